//! The closed set of event type tags.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

/// Event type tag as it appears in the `type` field of the wire envelope.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    DocumentCreated,
    DocumentUpdated,
    DocumentDeleted,
    CommentAdded,
    UserRegistered,
    FileUploaded,
}

impl EventType {
    /// Every known tag, in declaration order.
    pub const ALL: [EventType; 6] = [
        EventType::DocumentCreated,
        EventType::DocumentUpdated,
        EventType::DocumentDeleted,
        EventType::CommentAdded,
        EventType::UserRegistered,
        EventType::FileUploaded,
    ];

    /// Stable wire name (e.g. `"document-created"`).
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::DocumentCreated => "document-created",
            EventType::DocumentUpdated => "document-updated",
            EventType::DocumentDeleted => "document-deleted",
            EventType::CommentAdded => "comment-added",
            EventType::UserRegistered => "user-registered",
            EventType::FileUploaded => "file-uploaded",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `type` tag outside the closed set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event type `{0}`")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}
