use chrono::{DateTime, SubsecRound, Utc};
use sha2::{Digest, Sha256};

use bookspace_core::CorrelationId;

use crate::kind::EventType;
use crate::payload::EventData;

/// The unit of communication on the bus.
///
/// - `data` determines the event type; the two can never disagree
/// - `timestamp` is set when the event is built (millisecond precision, as
///   carried on the wire)
/// - `correlation_id` is opaque and passed through unchanged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    data: EventData,
    timestamp: DateTime<Utc>,
    correlation_id: Option<CorrelationId>,
}

impl Event {
    pub fn new(data: impl Into<EventData>) -> Self {
        Self {
            data: data.into(),
            timestamp: Utc::now().trunc_subsecs(3),
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp.trunc_subsecs(3);
        self
    }

    pub(crate) fn from_parts(
        data: EventData,
        timestamp: DateTime<Utc>,
        correlation_id: Option<CorrelationId>,
    ) -> Self {
        Self {
            data,
            timestamp,
            correlation_id,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.data.event_type()
    }

    pub fn data(&self) -> &EventData {
        &self.data
    }

    pub fn into_data(self) -> EventData {
        self.data
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    /// `<type>:<subject id>:<fingerprint>`, identifying one occurrence.
    ///
    /// The fingerprint covers the timestamp, correlation id and payload, all
    /// of which travel on the wire, so a redelivery or retry of the same
    /// message yields the same key while two updates of one subject do not.
    pub fn idempotency_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.timestamp.timestamp_millis().to_be_bytes());
        if let Some(correlation_id) = &self.correlation_id {
            hasher.update(correlation_id.as_str().as_bytes());
        }
        hasher.update([0u8]);
        // Plain string/number payloads; serialization cannot fail.
        hasher.update(serde_json::to_vec(&self.data).unwrap_or_default());
        let digest = hasher.finalize();

        format!(
            "{}:{}:{}",
            self.event_type(),
            self.data.subject_id(),
            hex::encode(&digest[..16])
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::payload::{DocumentCreated, DocumentUpdated};

    fn at_noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn retitled(title: &str) -> Event {
        Event::new(DocumentUpdated {
            document_id: "d1".into(),
            updated_by: "u1".into(),
            title: Some(title.into()),
            tags: None,
        })
        .with_timestamp(at_noon())
    }

    #[test]
    fn redelivered_copy_has_the_same_key() {
        let event = retitled("A").with_correlation_id("req-1".parse().unwrap());
        let copy = event.clone();
        assert_eq!(event.idempotency_key(), copy.idempotency_key());
        assert!(event.idempotency_key().starts_with("document-updated:d1:"));
    }

    #[test]
    fn distinct_updates_of_one_document_have_distinct_keys() {
        assert_ne!(retitled("A").idempotency_key(), retitled("B").idempotency_key());
    }

    #[test]
    fn same_content_at_another_time_is_another_occurrence() {
        let one_second_later = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 1).unwrap();
        let later = retitled("A").with_timestamp(one_second_later);
        assert_ne!(retitled("A").idempotency_key(), later.idempotency_key());
    }

    #[test]
    fn timestamps_are_kept_at_millisecond_precision() {
        let event = Event::new(DocumentCreated {
            document_id: "d1".into(),
            title: "Dune".into(),
            created_by: "u1".into(),
            tags: vec![],
        });
        assert_eq!(event.timestamp().timestamp_subsec_nanos() % 1_000_000, 0);
    }
}
