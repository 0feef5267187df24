use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::event::Event;

/// Failure reported by a handler.
///
/// The consumer loop turns any `HandlerError` into a retry or a
/// dead-lettering; it never propagates further.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),

    /// An external collaborator (database, mailer, object storage) failed.
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Reacts to a decoded event.
///
/// Delivery is at-least-once: implementations must tolerate being invoked
/// again with the same event, and may be invoked concurrently for distinct
/// events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H> EventHandler for Arc<H>
where
    H: EventHandler + ?Sized,
{
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        (**self).handle(event).await
    }
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure taking an owned [`Event`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        (self.f)(event.clone()).await
    }
}

impl<F> core::fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}
