use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use bookspace_events::{Event, EventData, EventDispatcher, EventHandler, EventType, HandlerError};

use crate::collaborators::ThumbnailRenderer;

/// Renders a thumbnail for every uploaded image. Rendering overwrites, so a
/// redelivered upload is harmless.
pub struct ThumbnailGenerator {
    renderer: Arc<dyn ThumbnailRenderer>,
}

impl ThumbnailGenerator {
    pub fn new(renderer: Arc<dyn ThumbnailRenderer>) -> Self {
        Self { renderer }
    }
}

#[async_trait]
impl EventHandler for ThumbnailGenerator {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        let EventData::FileUploaded(file) = event.data() else {
            return Ok(());
        };
        if !file.content_type.starts_with("image/") {
            debug!(
                file_id = %file.file_id,
                content_type = %file.content_type,
                "not an image, skipping"
            );
            return Ok(());
        }
        self.renderer
            .render(&file.storage_key, &file.content_type)
            .await?;
        Ok(())
    }
}

pub fn dispatcher(renderer: Arc<dyn ThumbnailRenderer>) -> EventDispatcher {
    EventDispatcher::new().with_handler(EventType::FileUploaded, ThumbnailGenerator::new(renderer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use bookspace_events::FileUploaded;

    #[derive(Default)]
    struct RecordingRenderer {
        rendered: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ThumbnailRenderer for RecordingRenderer {
        async fn render(&self, storage_key: &str, _content_type: &str) -> anyhow::Result<()> {
            self.rendered.lock().unwrap().push(storage_key.to_string());
            Ok(())
        }
    }

    fn upload(content_type: &str) -> Event {
        Event::new(FileUploaded {
            file_id: "f1".into(),
            owner_id: "u1".into(),
            storage_key: "uploads/f1".into(),
            content_type: content_type.into(),
            size_bytes: 2048,
        })
    }

    #[tokio::test]
    async fn only_images_are_rendered() {
        let renderer = Arc::new(RecordingRenderer::default());
        let dispatcher = dispatcher(renderer.clone());

        dispatcher.dispatch(&upload("image/png")).await.unwrap();
        dispatcher.dispatch(&upload("application/pdf")).await.unwrap();

        assert_eq!(*renderer.rendered.lock().unwrap(), vec!["uploads/f1".to_string()]);
    }
}
