//! Routes decoded events to the handler registered for their type.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::event::Event;
use crate::handler::{EventHandler, HandlerError};
use crate::kind::EventType;

/// Maps each event type to at most one handler.
///
/// An event whose type has no handler is logged and treated as handled:
/// it is not a transient failure, so retrying it would only delay the
/// dead-letter queue. The dispatcher itself is an [`EventHandler`] and is
/// what a worker passes to `subscribe`.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    handlers: HashMap<EventType, Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_type`, replacing any previous one.
    pub fn register<H>(&mut self, event_type: EventType, handler: H) -> &mut Self
    where
        H: EventHandler + 'static,
    {
        if self.handlers.insert(event_type, Arc::new(handler)).is_some() {
            warn!(%event_type, "replacing previously registered handler");
        }
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_handler<H>(mut self, event_type: EventType, handler: H) -> Self
    where
        H: EventHandler + 'static,
    {
        self.register(event_type, handler);
        self
    }

    pub fn handles(&self, event_type: EventType) -> bool {
        self.handlers.contains_key(&event_type)
    }

    pub fn registered_types(&self) -> Vec<EventType> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }

    #[instrument(
        name = "dispatch",
        skip_all,
        fields(
            event_type = %event.event_type(),
            subject_id = %event.data().subject_id(),
            correlation_id = event.correlation_id().map(|c| c.as_str()),
        )
    )]
    pub async fn dispatch(&self, event: &Event) -> Result<(), HandlerError> {
        match self.handlers.get(&event.event_type()) {
            Some(handler) => handler.handle(event).await,
            None => {
                debug!("no handler registered for event type; dropping");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl EventHandler for EventDispatcher {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        self.dispatch(event).await
    }
}

impl core::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.registered_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::handler::handler_fn;
    use crate::payload::{DocumentCreated, DocumentUpdated, EventData, FileUploaded};

    fn document_created(id: &str) -> Event {
        Event::new(DocumentCreated {
            document_id: id.into(),
            title: "Dune".into(),
            created_by: "u1".into(),
            tags: vec![],
        })
    }

    fn retitled(title: &str) -> Event {
        Event::new(DocumentUpdated {
            document_id: "d1".into(),
            updated_by: "u1".into(),
            title: Some(title.into()),
            tags: None,
        })
    }

    fn file_uploaded() -> Event {
        Event::new(FileUploaded {
            file_id: "f1".into(),
            owner_id: "u1".into(),
            storage_key: "uploads/f1.png".into(),
            content_type: "image/png".into(),
            size_bytes: 42,
        })
    }

    fn counting(counter: Arc<AtomicUsize>) -> impl EventHandler + 'static {
        handler_fn(move |_event| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn routes_by_event_type() {
        let created = Arc::new(AtomicUsize::new(0));
        let uploaded = Arc::new(AtomicUsize::new(0));
        let dispatcher = EventDispatcher::new()
            .with_handler(EventType::DocumentCreated, counting(created.clone()))
            .with_handler(EventType::FileUploaded, counting(uploaded.clone()));

        dispatcher.dispatch(&document_created("d1")).await.unwrap();
        dispatcher.dispatch(&file_uploaded()).await.unwrap();
        dispatcher.dispatch(&file_uploaded()).await.unwrap();

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(uploaded.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unregistered_types_are_dropped_as_handled() {
        let dispatcher = EventDispatcher::new();
        assert!(dispatcher.dispatch(&file_uploaded()).await.is_ok());
    }

    #[tokio::test]
    async fn handler_errors_are_returned() {
        let dispatcher = EventDispatcher::new().with_handler(
            EventType::DocumentCreated,
            handler_fn(|_event| async { Err::<(), _>(HandlerError::failed("index unavailable")) }),
        );
        let err = dispatcher.dispatch(&document_created("d1")).await.unwrap_err();
        assert!(matches!(err, HandlerError::Failed(_)));
    }

    #[tokio::test]
    async fn re_registration_keeps_a_single_handler() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = EventDispatcher::new();
        dispatcher
            .register(EventType::DocumentCreated, counting(first.clone()))
            .register(EventType::DocumentCreated, counting(second.clone()));

        dispatcher.dispatch(&document_created("d1")).await.unwrap();

        assert_eq!(dispatcher.registered_types(), vec![EventType::DocumentCreated]);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn redelivery_has_no_double_effect_for_idempotent_handlers() {
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let effects = Arc::new(AtomicUsize::new(0));

        let handler = {
            let seen = seen.clone();
            let effects = effects.clone();
            handler_fn(move |event: Event| {
                let seen = seen.clone();
                let effects = effects.clone();
                async move {
                    if seen.lock().unwrap().insert(event.idempotency_key()) {
                        effects.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                }
            })
        };
        let dispatcher = EventDispatcher::new().with_handler(EventType::DocumentCreated, handler);

        let event = document_created("d1");
        dispatcher.dispatch(&event).await.unwrap();
        dispatcher.dispatch(&event.clone()).await.unwrap();
        dispatcher.dispatch(&document_created("d2")).await.unwrap();

        assert_eq!(effects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn successive_updates_of_one_document_are_all_applied() {
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let applied = Arc::new(Mutex::new(Vec::new()));

        let handler = {
            let seen = seen.clone();
            let applied = applied.clone();
            handler_fn(move |event: Event| {
                let seen = seen.clone();
                let applied = applied.clone();
                async move {
                    if seen.lock().unwrap().insert(event.idempotency_key()) {
                        if let EventData::DocumentUpdated(update) = event.data() {
                            applied.lock().unwrap().push(update.title.clone());
                        }
                    }
                    Ok(())
                }
            })
        };
        let dispatcher = EventDispatcher::new().with_handler(EventType::DocumentUpdated, handler);

        let first = retitled("A");
        let second = retitled("B");
        dispatcher.dispatch(&first).await.unwrap();
        dispatcher.dispatch(&first.clone()).await.unwrap();
        dispatcher.dispatch(&second).await.unwrap();

        assert_eq!(
            *applied.lock().unwrap(),
            vec![Some("A".to_string()), Some("B".to_string())]
        );
    }
}
