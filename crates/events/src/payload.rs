//! Per-type payloads.
//!
//! `data` on the wire is not an open map: each [`EventType`] owns exactly one
//! payload struct, and [`EventData`] is the closed union over them.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use bookspace_core::DomainResult;
use bookspace_core::error::require_non_empty;

use crate::kind::EventType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentCreated {
    pub document_id: String,
    pub title: String,
    pub created_by: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Only the fields that changed are present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentUpdated {
    pub document_id: String,
    pub updated_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentDeleted {
    pub document_id: String,
    pub deleted_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentAdded {
    pub comment_id: String,
    pub document_id: String,
    pub author_id: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRegistered {
    pub user_id: String,
    pub email: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUploaded {
    pub file_id: String,
    pub owner_id: String,
    /// Object-storage key of the uploaded blob.
    pub storage_key: String,
    pub content_type: String,
    pub size_bytes: u64,
}

/// The payload of an event, tagged by its type.
///
/// Serializes as the bare payload object; the tag travels separately in the
/// envelope's `type` field (see [`crate::codec`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum EventData {
    DocumentCreated(DocumentCreated),
    DocumentUpdated(DocumentUpdated),
    DocumentDeleted(DocumentDeleted),
    CommentAdded(CommentAdded),
    UserRegistered(UserRegistered),
    FileUploaded(FileUploaded),
}

impl EventData {
    pub fn event_type(&self) -> EventType {
        match self {
            EventData::DocumentCreated(_) => EventType::DocumentCreated,
            EventData::DocumentUpdated(_) => EventType::DocumentUpdated,
            EventData::DocumentDeleted(_) => EventType::DocumentDeleted,
            EventData::CommentAdded(_) => EventType::CommentAdded,
            EventData::UserRegistered(_) => EventType::UserRegistered,
            EventData::FileUploaded(_) => EventType::FileUploaded,
        }
    }

    /// Natural identifier of the entity the event is about.
    ///
    /// Several events can share it (every update of one document does). Use
    /// [`Event::idempotency_key`](crate::Event::idempotency_key) to recognise
    /// a redelivery of one event.
    pub fn subject_id(&self) -> &str {
        match self {
            EventData::DocumentCreated(p) => &p.document_id,
            EventData::DocumentUpdated(p) => &p.document_id,
            EventData::DocumentDeleted(p) => &p.document_id,
            EventData::CommentAdded(p) => &p.comment_id,
            EventData::UserRegistered(p) => &p.user_id,
            EventData::FileUploaded(p) => &p.file_id,
        }
    }

    /// Check the invariants serde cannot express (non-empty identifiers).
    pub fn validate(&self) -> DomainResult<()> {
        match self {
            EventData::DocumentCreated(p) => {
                require_non_empty("documentId", &p.document_id)?;
                require_non_empty("createdBy", &p.created_by)
            }
            EventData::DocumentUpdated(p) => {
                require_non_empty("documentId", &p.document_id)?;
                require_non_empty("updatedBy", &p.updated_by)
            }
            EventData::DocumentDeleted(p) => require_non_empty("documentId", &p.document_id),
            EventData::CommentAdded(p) => {
                require_non_empty("commentId", &p.comment_id)?;
                require_non_empty("documentId", &p.document_id)
            }
            EventData::UserRegistered(p) => {
                require_non_empty("userId", &p.user_id)?;
                require_non_empty("email", &p.email)
            }
            EventData::FileUploaded(p) => {
                require_non_empty("fileId", &p.file_id)?;
                require_non_empty("storageKey", &p.storage_key)
            }
        }
    }

    /// Decode `data` against the shape its tag requires.
    pub(crate) fn from_value(
        event_type: EventType,
        data: JsonValue,
    ) -> Result<Self, serde_json::Error> {
        Ok(match event_type {
            EventType::DocumentCreated => EventData::DocumentCreated(serde_json::from_value(data)?),
            EventType::DocumentUpdated => EventData::DocumentUpdated(serde_json::from_value(data)?),
            EventType::DocumentDeleted => EventData::DocumentDeleted(serde_json::from_value(data)?),
            EventType::CommentAdded => EventData::CommentAdded(serde_json::from_value(data)?),
            EventType::UserRegistered => EventData::UserRegistered(serde_json::from_value(data)?),
            EventType::FileUploaded => EventData::FileUploaded(serde_json::from_value(data)?),
        })
    }
}

macro_rules! impl_from_payload {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for EventData {
                fn from(value: $variant) -> Self {
                    EventData::$variant(value)
                }
            }
        )*
    };
}

impl_from_payload!(
    DocumentCreated,
    DocumentUpdated,
    DocumentDeleted,
    CommentAdded,
    UserRegistered,
    FileUploaded,
);
