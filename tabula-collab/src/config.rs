//! Per-session configuration and its partial-update contract.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::SessionError;

/// Hard cap on `max_users`; update requests beyond it are rejected.
pub const MAX_USERS_CAP: u32 = 50;

/// Upper bound on password length.
pub const MAX_PASSWORD_LEN: usize = 64;

/// Default `max_users` for freshly created sessions.
pub const DEFAULT_MAX_USERS: u32 = 10;

/// Session configuration, owned exclusively by the session's control
/// block. `secret` and `password` never serialize — the secret reaches
/// the host only through the dedicated `user-host` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<Uuid>,
    #[serde(default, skip_serializing)]
    pub secret: String,
    pub max_users: u32,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

impl SessionConfig {
    pub fn new(id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: None,
            secret: secret.into(),
            max_users: DEFAULT_MAX_USERS,
            read_only: false,
            password: None,
        }
    }

    /// Validate and merge a partial update. Only the provided fields
    /// change. An explicit empty password clears it; an absent password
    /// field is a no-op.
    pub fn apply(&mut self, update: &ConfigUpdate) -> Result<(), SessionError> {
        update.validate()?;
        if let Some(max_users) = update.max_users {
            self.max_users = max_users;
        }
        if let Some(read_only) = update.read_only {
            self.read_only = read_only;
        }
        if let Some(ref password) = update.password {
            self.password = if password.is_empty() {
                None
            } else {
                Some(password.clone())
            };
        }
        Ok(())
    }
}

/// Partial configuration update: absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_users: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ConfigUpdate {
    fn validate(&self) -> Result<(), SessionError> {
        if let Some(max_users) = self.max_users {
            if !(1..=MAX_USERS_CAP).contains(&max_users) {
                return Err(SessionError::InvalidConfig(format!(
                    "maxUsers must be between 1 and {MAX_USERS_CAP}"
                )));
            }
        }
        if let Some(ref password) = self.password {
            if password.len() > MAX_PASSWORD_LEN {
                return Err(SessionError::InvalidConfig(format!(
                    "password longer than {MAX_PASSWORD_LEN} characters"
                )));
            }
        }
        Ok(())
    }
}
