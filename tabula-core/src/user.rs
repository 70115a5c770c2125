//! User identity with alias/color validation.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

static ALIAS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-zA-Z0-9-_]{4,32}$").expect("alias pattern"));
static COLOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^#[0-9a-fA-F]{6}$").expect("color pattern"));

/// Aliases longer than this are rejected even when they match the pattern.
pub const MAX_ALIAS_LEN: usize = 24;

/// Validation failures for user-supplied identity fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserError {
    InvalidAlias,
    InvalidColor,
}

impl std::fmt::Display for UserError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserError::InvalidAlias => write!(
                f,
                "alias must be 4-{MAX_ALIAS_LEN} characters of [a-zA-Z0-9-_]"
            ),
            UserError::InvalidColor => write!(f, "color must be #RRGGBB hex"),
        }
    }
}

impl std::error::Error for UserError {}

/// A whiteboard user. The live connection handle is tracked by the
/// session engine, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub alias: String,
    pub color: String,
}

impl User {
    /// Create a user with a fresh id after validating alias and color.
    pub fn new(alias: impl Into<String>, color: impl Into<String>) -> Result<Self, UserError> {
        let alias = alias.into();
        let color = color.into();
        validate_alias(&alias)?;
        validate_color(&color)?;
        Ok(Self {
            id: Uuid::new_v4(),
            alias,
            color,
        })
    }
}

/// Check an alias against the pattern and length bounds.
pub fn validate_alias(alias: &str) -> Result<(), UserError> {
    if alias.len() > MAX_ALIAS_LEN || !ALIAS_RE.is_match(alias) {
        return Err(UserError::InvalidAlias);
    }
    Ok(())
}

/// Check a color against the `#RRGGBB` hex form.
pub fn validate_color(color: &str) -> Result<(), UserError> {
    if !COLOR_RE.is_match(color) {
        return Err(UserError::InvalidColor);
    }
    Ok(())
}
