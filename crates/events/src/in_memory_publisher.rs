//! In-memory publisher for producer-side tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::event::Event;
use crate::publisher::EventPublisher;

#[derive(Debug, thiserror::Error)]
pub enum RecordingPublisherError {
    /// Publish failed due to internal lock poisoning.
    #[error("recording publisher lock poisoned")]
    Poisoned,
    /// Simulated broker outage (see [`RecordingPublisher::set_unavailable`]).
    #[error("publisher unavailable")]
    Unavailable,
}

/// Records published events instead of sending them anywhere.
///
/// - No IO
/// - Events are kept in publish order
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<Event>>,
    unavailable: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent publishes fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Snapshot of everything published so far.
    pub fn published(&self) -> Vec<Event> {
        self.published
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Drain the recorded events.
    pub fn take(&self) -> Vec<Event> {
        self.published
            .lock()
            .map(|mut events| std::mem::take(&mut *events))
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    type Error = RecordingPublisherError;

    async fn publish(&self, event: &Event) -> Result<(), Self::Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RecordingPublisherError::Unavailable);
        }
        self.published
            .lock()
            .map_err(|_| RecordingPublisherError::Poisoned)?
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::payload::UserRegistered;

    fn user_registered() -> Event {
        Event::new(UserRegistered {
            user_id: "u1".into(),
            email: "reader@bookspace.dev".into(),
            display_name: "Reader".into(),
        })
    }

    #[tokio::test]
    async fn records_in_publish_order() {
        let publisher = Arc::new(RecordingPublisher::new());
        let first = user_registered();
        let second = user_registered().with_correlation_id("req-2".parse().unwrap());

        publisher.publish(&first).await.unwrap();
        publisher.publish(&second).await.unwrap();

        assert_eq!(publisher.published(), vec![first, second]);
        assert_eq!(publisher.take().len(), 2);
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn outage_is_surfaced_to_the_caller() {
        let publisher = RecordingPublisher::new();
        publisher.set_unavailable(true);

        let err = publisher.publish(&user_registered()).await.unwrap_err();
        assert!(matches!(err, RecordingPublisherError::Unavailable));
        assert!(publisher.published().is_empty());
    }
}
