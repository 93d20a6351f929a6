//! Envelope types for the roomcast protocol.
//!
//! The envelope is the only structure exchanged over a connection. Room
//! references are carried as a `(roomType, roomId)` pair; both halves are
//! opaque strings and no vocabulary is enforced here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Authenticated user identifier stamped onto outgoing envelopes.
pub type UserId = u64;

/// Envelope kind identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    /// Add the sender to a room.
    Join,
    /// Remove the sender from a room.
    Leave,
    /// Broadcast content to a room.
    Message,
}

impl EnvelopeKind {
    /// Wire name of this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Join => "join",
            EnvelopeKind::Leave => "leave",
            EnvelopeKind::Message => "message",
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite room identifier: a category (e.g. `dorm`, `floor`) plus an id
/// within that category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomKey {
    /// Logical room category.
    pub room_type: String,
    /// Room identifier within the category.
    pub room_id: String,
}

impl RoomKey {
    /// Create a new room key.
    #[must_use]
    pub fn new(room_type: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self {
            room_type: room_type.into(),
            room_id: room_id.into(),
        }
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.room_type, self.room_id)
    }
}

/// An envelope as sent by a client.
///
/// `userId` and `time` are never read from clients; serde drops them along
/// with any other unknown field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEnvelope {
    /// Requested operation.
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Room category.
    #[serde(default)]
    pub room_type: String,
    /// Room identifier.
    #[serde(default)]
    pub room_id: String,
    /// Message body, only meaningful for `message`.
    #[serde(default)]
    pub content: String,
}

impl InboundEnvelope {
    /// The room this envelope refers to.
    #[must_use]
    pub fn room_key(&self) -> RoomKey {
        RoomKey::new(self.room_type.clone(), self.room_id.clone())
    }
}

/// A server-authored envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Envelope kind.
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Room category.
    pub room_type: String,
    /// Room identifier.
    pub room_id: String,
    /// Sender, stamped by the server.
    pub user_id: UserId,
    /// Message body.
    pub content: String,
    /// Server receive time.
    pub time: DateTime<Utc>,
}

impl Envelope {
    /// Create a `message` envelope for `room`, stamped with the current time.
    #[must_use]
    pub fn message(room: &RoomKey, user_id: UserId, content: impl Into<String>) -> Self {
        Self::message_at(room, user_id, content, Utc::now())
    }

    /// Create a `message` envelope with an explicit timestamp.
    #[must_use]
    pub fn message_at(
        room: &RoomKey,
        user_id: UserId,
        content: impl Into<String>,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: EnvelopeKind::Message,
            room_type: room.room_type.clone(),
            room_id: room.room_id.clone(),
            user_id,
            content: content.into(),
            time,
        }
    }

    /// The room this envelope targets.
    #[must_use]
    pub fn room_key(&self) -> RoomKey {
        RoomKey::new(self.room_type.clone(), self.room_id.clone())
    }
}

/// An encoded envelope, ready to be written to any number of connections.
///
/// Cloning shares the underlying text, so every member of a room receives
/// the identical frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncodedEnvelope(Arc<str>);

impl EncodedEnvelope {
    /// The encoded JSON text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Encoded size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the encoded text is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for EncodedEnvelope {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl AsRef<str> for EncodedEnvelope {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EncodedEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
