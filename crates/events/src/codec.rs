//! JSON wire codec for the event envelope.
//!
//! ```text
//! { "type": "<tag>", "timestamp": "<ISO-8601>", "correlationId": "<opt>", "data": {...} }
//! ```
//!
//! Decoding validates `data` against the shape its `type` requires; a
//! mismatch is a [`DecodeError`], never a panic.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use bookspace_core::{CorrelationId, DomainError};

use crate::event::Event;
use crate::kind::EventType;
use crate::payload::EventData;

/// MIME type carried in the message properties.
pub const CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Error)]
#[error("failed to encode event: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

#[derive(Debug, Error)]
pub enum DecodeError {
    /// Not JSON, or missing envelope fields.
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    /// The `type` tag is outside the closed set.
    #[error("unknown event type `{0}`")]
    UnknownEventType(String),

    #[error("invalid timestamp `{value}`: {source}")]
    InvalidTimestamp {
        value: String,
        source: chrono::ParseError,
    },

    /// `data` does not have the shape `type` requires.
    #[error("payload does not match event type `{event_type}`: {source}")]
    PayloadMismatch {
        event_type: EventType,
        source: serde_json::Error,
    },

    #[error("invalid `{event_type}` payload: {source}")]
    InvalidPayload {
        event_type: EventType,
        source: DomainError,
    },
}

impl DecodeError {
    /// Unknown types are not transient: retrying them cannot succeed.
    pub fn is_unknown_type(&self) -> bool {
        matches!(self, DecodeError::UnknownEventType(_))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireEventRef<'a> {
    #[serde(rename = "type")]
    event_type: &'static str,
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<&'a CorrelationId>,
    data: &'a EventData,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent {
    #[serde(rename = "type")]
    event_type: String,
    timestamp: String,
    #[serde(default)]
    correlation_id: Option<CorrelationId>,
    data: JsonValue,
}

/// Serialize an event to its canonical JSON body.
pub fn encode(event: &Event) -> Result<Vec<u8>, EncodeError> {
    let wire = WireEventRef {
        event_type: event.event_type().as_str(),
        timestamp: event.timestamp().to_rfc3339_opts(SecondsFormat::Millis, true),
        correlation_id: event.correlation_id(),
        data: event.data(),
    };
    Ok(serde_json::to_vec(&wire)?)
}

/// Decode and validate a message body.
pub fn decode(body: &[u8]) -> Result<Event, DecodeError> {
    let wire: WireEvent = serde_json::from_slice(body).map_err(DecodeError::Malformed)?;

    let event_type: EventType = wire
        .event_type
        .parse()
        .map_err(|_| DecodeError::UnknownEventType(wire.event_type.clone()))?;

    let timestamp = DateTime::parse_from_rfc3339(&wire.timestamp)
        .map_err(|source| DecodeError::InvalidTimestamp {
            value: wire.timestamp.clone(),
            source,
        })?
        .with_timezone(&Utc);

    let data = EventData::from_value(event_type, wire.data)
        .map_err(|source| DecodeError::PayloadMismatch { event_type, source })?;
    data.validate()
        .map_err(|source| DecodeError::InvalidPayload { event_type, source })?;

    Ok(Event::from_parts(data, timestamp, wire.correlation_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{CommentAdded, DocumentCreated};
    use chrono::TimeZone;
    use proptest::prelude::*;
    use serde_json::json;

    fn document_created() -> Event {
        Event::new(DocumentCreated {
            document_id: "d1".into(),
            title: "Dune".into(),
            created_by: "u1".into(),
            tags: vec!["sci-fi".into()],
        })
        .with_timestamp(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
    }

    #[test]
    fn encodes_the_wire_envelope() {
        let event = document_created().with_correlation_id("req-1".parse().unwrap());
        let value: JsonValue = serde_json::from_slice(&encode(&event).unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "type": "document-created",
                "timestamp": "2024-03-01T12:00:00.000Z",
                "correlationId": "req-1",
                "data": {
                    "documentId": "d1",
                    "title": "Dune",
                    "createdBy": "u1",
                    "tags": ["sci-fi"]
                }
            })
        );
    }

    #[test]
    fn correlation_id_is_omitted_when_absent() {
        let body = encode(&document_created()).unwrap();
        let value: JsonValue = serde_json::from_slice(&body).unwrap();
        assert!(value.get("correlationId").is_none());
    }

    #[test]
    fn decode_restores_the_event() {
        let event = document_created().with_correlation_id("req-1".parse().unwrap());
        let decoded = decode(&encode(&event).unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn accepts_offsets_in_timestamps() {
        let body = json!({
            "type": "document-deleted",
            "timestamp": "2024-03-01T14:00:00+02:00",
            "data": {"documentId": "d1", "deletedBy": "u1"}
        });
        let event = decode(body.to_string().as_bytes()).unwrap();
        assert_eq!(event.timestamp(), Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn malformed_json_is_rejected() {
        let err = decode(b"{not json").unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn unknown_type_is_distinguished() {
        let body = json!({"type": "book-burned", "timestamp": "2024-03-01T12:00:00Z", "data": {}});
        let err = decode(body.to_string().as_bytes()).unwrap_err();
        assert!(err.is_unknown_type());
    }

    #[test]
    fn type_payload_mismatch_is_rejected() {
        let body = json!({
            "type": "comment-added",
            "timestamp": "2024-03-01T12:00:00Z",
            "data": {"documentId": "d1", "title": "Dune", "createdBy": "u1"}
        });
        let err = decode(body.to_string().as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::PayloadMismatch { event_type: EventType::CommentAdded, .. }
        ));
    }

    #[test]
    fn blank_identifiers_are_rejected() {
        let body = json!({
            "type": "document-deleted",
            "timestamp": "2024-03-01T12:00:00Z",
            "data": {"documentId": "", "deletedBy": "u1"}
        });
        let err = decode(body.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidPayload { .. }));
    }

    #[test]
    fn bad_timestamp_is_rejected() {
        let body = json!({
            "type": "document-deleted",
            "timestamp": "yesterday",
            "data": {"documentId": "d1", "deletedBy": "u1"}
        });
        let err = decode(body.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidTimestamp { .. }));
    }

    proptest! {
        #[test]
        fn any_non_blank_ids_survive_the_wire(
            comment_id in "[a-zA-Z0-9-]{1,24}",
            document_id in "[a-zA-Z0-9-]{1,24}",
            body in ".*",
        ) {
            let event = Event::new(CommentAdded {
                comment_id,
                document_id,
                author_id: "u1".into(),
                body,
            });
            let decoded = decode(&encode(&event).unwrap()).unwrap();
            prop_assert_eq!(decoded, event);
        }
    }
}
