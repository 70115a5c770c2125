//! JSON wire protocol for session traffic.
//!
//! Every frame on the persistent connection is one envelope:
//!
//! ```text
//! { "type": "strokes", "sender": "<user id>", "content": <type-specific> }
//! ```
//!
//! The envelope keeps `content` as raw JSON and decodes it lazily against
//! a caller-supplied type, so malformed content can never corrupt the
//! routing fields. `receiver` is routing metadata for single-target
//! delivery inside the broadcaster and is never serialized to the wire.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use tabula_core::{Page, User};

/// Message types carried in the envelope's `type` field.
///
/// `Strokes` is the only inbound type defined at the session layer; the
/// rest are outbound broadcast/send types. The set is extensible — an
/// unrecognized inbound type decodes to [`MessageType::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    /// Batch of stroke edits (inbound and re-broadcast outbound).
    Strokes,
    /// A user attached a live connection.
    UserConnected,
    /// A user's connection went away.
    UserDisconnected,
    /// Full membership snapshot.
    UserSync,
    /// Session secret delivery to the host (receiver-only).
    UserHost,
    /// Kick notice (receiver-only).
    UserKick,
    /// Full page rank plus per-page meta.
    PageSync,
    /// Subset of pages changed in place.
    PageUpdate,
    /// Session configuration changed.
    SessionConfig,
    /// Error notice addressed to a single sender (receiver-only).
    Error,
    /// Anything we do not recognize.
    #[serde(other)]
    Unknown,
}

/// Sender id used for server-originated messages.
pub const SERVER_SENDER: &str = "";

/// The wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default)]
    pub sender: String,
    /// Single-target routing; never on the wire.
    #[serde(skip)]
    pub receiver: Option<Uuid>,
    #[serde(default)]
    pub content: serde_json::Value,
}

impl Message {
    /// Build a broadcast envelope from a serializable content value.
    pub fn new(
        msg_type: MessageType,
        sender: impl Into<String>,
        content: &impl Serialize,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type,
            sender: sender.into(),
            receiver: None,
            content: serde_json::to_value(content)
                .map_err(|e| ProtocolError::Serialization(e.to_string()))?,
        })
    }

    /// Build a single-target envelope.
    pub fn to_receiver(
        msg_type: MessageType,
        receiver: Uuid,
        content: &impl Serialize,
    ) -> Result<Self, ProtocolError> {
        let mut msg = Self::new(msg_type, SERVER_SENDER, content)?;
        msg.receiver = Some(receiver);
        Ok(msg)
    }

    /// Error notice addressed to `receiver`. Infallible — the content is
    /// a plain string wrapper.
    pub fn error_to(receiver: Uuid, text: impl Into<String>) -> Self {
        let content = ErrorContent {
            message: text.into(),
        };
        Self {
            msg_type: MessageType::Error,
            sender: SERVER_SENDER.to_string(),
            receiver: Some(receiver),
            content: serde_json::to_value(&content).unwrap_or(serde_json::Value::Null),
        }
    }

    /// Decode the content against a caller-supplied type.
    pub fn decode_content<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.content.clone())
            .map_err(|e| ProtocolError::BadContent(e.to_string()))
    }

    /// Serialize the envelope for the wire.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse an inbound frame.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Membership entry carried by `user-sync` and the users accessor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub id: Uuid,
    pub alias: String,
    pub color: String,
    pub connected: bool,
}

impl UserEntry {
    pub fn from_user(user: &User, connected: bool) -> Self {
        Self {
            id: user.id,
            alias: user.alias.clone(),
            color: user.color.clone(),
            connected,
        }
    }
}

/// `user-host` content: private secret delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSecret {
    pub secret: String,
}

/// `user-kick` content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KickNotice {
    pub user_id: Uuid,
}

/// `page-sync` content and the bulk reconciliation snapshot: the full
/// rank plus per-page data, keyed by page id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSync {
    pub page_rank: Vec<String>,
    pub pages: HashMap<String, Page>,
}

/// `page-update` content: pages changed in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageUpdateNotice {
    pub page_ids: Vec<String>,
    pub clear: bool,
}

/// `error` content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContent {
    pub message: String,
}

/// Protocol-level failures.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    BadContent(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "deserialization error: {e}"),
            Self::BadContent(e) => write!(f, "bad message content: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tabula_core::Stroke;

    #[test]
    fn test_envelope_roundtrip() {
        let strokes = vec![Stroke::deleted("st1", "pid1")];
        let msg = Message::new(MessageType::Strokes, Uuid::new_v4().to_string(), &strokes).unwrap();
        let raw = msg.encode().unwrap();
        let parsed = Message::decode(&raw).unwrap();

        assert_eq!(parsed.msg_type, MessageType::Strokes);
        assert_eq!(parsed.sender, msg.sender);
        let decoded: Vec<Stroke> = parsed.decode_content().unwrap();
        assert_eq!(decoded, strokes);
    }

    #[test]
    fn test_receiver_never_on_wire() {
        let msg = Message::to_receiver(
            MessageType::UserHost,
            Uuid::new_v4(),
            &HostSecret {
                secret: "s3cr3t".into(),
            },
        )
        .unwrap();
        let raw = msg.encode().unwrap();
        assert!(!raw.contains("receiver"));

        let parsed = Message::decode(&raw).unwrap();
        assert_eq!(parsed.receiver, None);
    }

    #[test]
    fn test_unknown_type_keeps_routing_fields() {
        let parsed =
            Message::decode(r#"{"type":"telepathy","sender":"u1","content":{"x":1}}"#).unwrap();
        assert_eq!(parsed.msg_type, MessageType::Unknown);
        assert_eq!(parsed.sender, "u1");
    }

    #[test]
    fn test_malformed_content_does_not_corrupt_envelope() {
        let parsed = Message::decode(r#"{"type":"strokes","sender":"u1","content":42}"#).unwrap();
        assert_eq!(parsed.msg_type, MessageType::Strokes);
        assert_eq!(parsed.sender, "u1");
        // Content only fails at the lazy decode step.
        assert!(parsed.decode_content::<Vec<Stroke>>().is_err());
    }

    #[test]
    fn test_wire_type_names() {
        assert_eq!(
            serde_json::to_string(&MessageType::UserConnected).unwrap(),
            r#""user-connected""#
        );
        assert_eq!(
            serde_json::to_string(&MessageType::PageSync).unwrap(),
            r#""page-sync""#
        );
        assert_eq!(
            serde_json::to_string(&MessageType::SessionConfig).unwrap(),
            r#""session-config""#
        );
    }

    #[test]
    fn test_error_to() {
        let uid = Uuid::new_v4();
        let msg = Message::error_to(uid, "message type not recognized");
        assert_eq!(msg.receiver, Some(uid));
        let content: ErrorContent = msg.decode_content().unwrap();
        assert_eq!(content.message, "message type not recognized");
    }
}
