//! Producer-side publishing seam.
//!
//! Producer services depend on [`EventPublisher`] rather than on a concrete
//! broker client, so they can be exercised against
//! [`RecordingPublisher`](crate::RecordingPublisher) in tests.

use std::sync::Arc;

use async_trait::async_trait;

use crate::event::Event;

/// Publishes events to every subscriber of the bus.
///
/// Publishing is fire-and-forget: `Ok` means the broker accepted the write,
/// not that any consumer processed it.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    async fn publish(&self, event: &Event) -> Result<(), Self::Error>;
}

#[async_trait]
impl<P> EventPublisher for Arc<P>
where
    P: EventPublisher + ?Sized,
{
    type Error = P::Error;

    async fn publish(&self, event: &Event) -> Result<(), Self::Error> {
        (**self).publish(event).await
    }
}
