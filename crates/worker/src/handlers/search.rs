//! Keeps the search index in step with documents.
//!
//! Every operation is keyed by document id, so replaying an event leaves the
//! index unchanged.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use bookspace_events::{Event, EventData, EventDispatcher, EventHandler, EventType, HandlerError};

use crate::collaborators::{SearchDocument, SearchIndex};

pub struct SearchIndexer {
    index: Arc<dyn SearchIndex>,
}

impl SearchIndexer {
    pub fn new(index: Arc<dyn SearchIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl EventHandler for SearchIndexer {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        match event.data() {
            EventData::DocumentCreated(doc) => {
                self.index
                    .upsert(SearchDocument {
                        id: doc.document_id.clone(),
                        title: Some(doc.title.clone()),
                        tags: Some(doc.tags.clone()),
                    })
                    .await?
            }
            EventData::DocumentUpdated(doc) => {
                self.index
                    .upsert(SearchDocument {
                        id: doc.document_id.clone(),
                        title: doc.title.clone(),
                        tags: doc.tags.clone(),
                    })
                    .await?
            }
            EventData::DocumentDeleted(doc) => self.index.remove(&doc.document_id).await?,
            other => debug!(event_type = %other.event_type(), "not indexed"),
        }
        Ok(())
    }
}

pub fn dispatcher(index: Arc<dyn SearchIndex>) -> EventDispatcher {
    let indexer = Arc::new(SearchIndexer::new(index));
    EventDispatcher::new()
        .with_handler(EventType::DocumentCreated, indexer.clone())
        .with_handler(EventType::DocumentUpdated, indexer.clone())
        .with_handler(EventType::DocumentDeleted, indexer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use bookspace_events::{DocumentCreated, DocumentDeleted, DocumentUpdated};

    /// Merges partial updates the way a search engine's upsert does.
    #[derive(Default)]
    struct MemoryIndex {
        docs: Mutex<HashMap<String, SearchDocument>>,
    }

    #[async_trait]
    impl SearchIndex for MemoryIndex {
        async fn upsert(&self, document: SearchDocument) -> anyhow::Result<()> {
            let mut docs = self.docs.lock().unwrap();
            let entry = docs.entry(document.id.clone()).or_insert(SearchDocument {
                id: document.id.clone(),
                title: None,
                tags: None,
            });
            if document.title.is_some() {
                entry.title = document.title;
            }
            if document.tags.is_some() {
                entry.tags = document.tags;
            }
            Ok(())
        }

        async fn remove(&self, id: &str) -> anyhow::Result<()> {
            self.docs.lock().unwrap().remove(id);
            Ok(())
        }
    }

    fn created() -> Event {
        Event::new(DocumentCreated {
            document_id: "d1".into(),
            title: "Draft".into(),
            created_by: "u1".into(),
            tags: vec!["a".into()],
        })
    }

    #[tokio::test]
    async fn replaying_events_converges_to_the_same_index() {
        let index = Arc::new(MemoryIndex::default());
        let dispatcher = dispatcher(index.clone());
        let update = Event::new(DocumentUpdated {
            document_id: "d1".into(),
            updated_by: "u1".into(),
            title: Some("Final".into()),
            tags: None,
        });

        for event in [created(), update.clone(), created(), update] {
            dispatcher.dispatch(&event).await.unwrap();
        }

        let docs = index.docs.lock().unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs["d1"].title.as_deref(), Some("Final"));
        assert_eq!(docs["d1"].tags, Some(vec!["a".to_string()]));
    }

    #[tokio::test]
    async fn deletes_are_idempotent() {
        let index = Arc::new(MemoryIndex::default());
        let dispatcher = dispatcher(index.clone());
        let delete = Event::new(DocumentDeleted {
            document_id: "d1".into(),
            deleted_by: "u1".into(),
        });

        dispatcher.dispatch(&created()).await.unwrap();
        dispatcher.dispatch(&delete).await.unwrap();
        dispatcher.dispatch(&delete).await.unwrap();

        assert!(index.docs.lock().unwrap().is_empty());
    }
}
