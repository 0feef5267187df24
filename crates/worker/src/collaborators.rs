//! Interfaces to the systems the handlers drive.
//!
//! Mail delivery, the search engine and image resizing live outside this
//! crate; the defaults here only log what they would do.

use async_trait::async_trait;
use tracing::info;

/// Outbound mail.
///
/// Every call carries the natural key of the mail (`user_id` for the
/// welcome, `comment_id` for a comment notice); implementations that can
/// deduplicate should do so on it.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_welcome(
        &self,
        user_id: &str,
        email: &str,
        display_name: &str,
    ) -> anyhow::Result<()>;

    async fn notify_comment(
        &self,
        comment_id: &str,
        document_id: &str,
        author_id: &str,
    ) -> anyhow::Result<()>;
}

/// A searchable document. Upserting the same id twice overwrites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchDocument {
    pub id: String,
    pub title: Option<String>,
    pub tags: Option<Vec<String>>,
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn upsert(&self, document: SearchDocument) -> anyhow::Result<()>;

    /// Removing an absent document is not an error.
    async fn remove(&self, id: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ThumbnailRenderer: Send + Sync {
    /// Render (or re-render) the thumbnail for the blob at `storage_key`.
    async fn render(&self, storage_key: &str, content_type: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMailer;

#[async_trait]
impl Mailer for LoggingMailer {
    async fn send_welcome(
        &self,
        user_id: &str,
        email: &str,
        display_name: &str,
    ) -> anyhow::Result<()> {
        info!(user_id, email, display_name, "welcome email sent");
        Ok(())
    }

    async fn notify_comment(
        &self,
        comment_id: &str,
        document_id: &str,
        author_id: &str,
    ) -> anyhow::Result<()> {
        info!(comment_id, document_id, author_id, "comment notification sent");
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSearchIndex;

#[async_trait]
impl SearchIndex for LoggingSearchIndex {
    async fn upsert(&self, document: SearchDocument) -> anyhow::Result<()> {
        info!(id = %document.id, "document indexed");
        Ok(())
    }

    async fn remove(&self, id: &str) -> anyhow::Result<()> {
        info!(id, "document removed from index");
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingThumbnailRenderer;

#[async_trait]
impl ThumbnailRenderer for LoggingThumbnailRenderer {
    async fn render(&self, storage_key: &str, content_type: &str) -> anyhow::Result<()> {
        info!(storage_key, content_type, "thumbnail rendered");
        Ok(())
    }
}
