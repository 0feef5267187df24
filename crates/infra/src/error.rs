use thiserror::Error;

use bookspace_events::EncodeError;

use crate::broker::TransportError;

/// Errors surfaced by the bus to its callers.
///
/// Handler and decode failures never appear here: the consumer loop turns
/// them into retries or dead-lettering.
#[derive(Debug, Error)]
pub enum BusError {
    /// Could not reach the broker. Fatal at startup; restart policy is the
    /// caller's.
    #[error("cannot connect to broker at {url}: {source}")]
    Connection {
        url: String,
        #[source]
        source: TransportError,
    },

    /// An exchange, queue or binding already exists with different
    /// parameters. Not retried.
    #[error("topology declaration failed for {entity}: {source}")]
    Declaration {
        entity: String,
        #[source]
        source: TransportError,
    },

    /// Publish or subscribe attempted without an open channel.
    #[error("bus is not connected")]
    NotConnected,

    #[error("publish failed: {0}")]
    Publish(#[source] TransportError),

    #[error("cannot subscribe to queue {queue}: {source}")]
    Subscribe {
        queue: String,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

pub type BusResult<T> = Result<T, BusError>;

impl BusError {
    pub(crate) fn declaration(entity: impl Into<String>, source: TransportError) -> Self {
        match source {
            TransportError::ChannelClosed => Self::NotConnected,
            source => Self::Declaration {
                entity: entity.into(),
                source,
            },
        }
    }

    pub(crate) fn publish(source: TransportError) -> Self {
        match source {
            TransportError::ChannelClosed => Self::NotConnected,
            source => Self::Publish(source),
        }
    }

    pub(crate) fn subscribe(queue: impl Into<String>, source: TransportError) -> Self {
        match source {
            TransportError::ChannelClosed => Self::NotConnected,
            source => Self::Subscribe {
                queue: queue.into(),
                source,
            },
        }
    }

    /// Startup-fatal errors: the process should log and exit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Declaration { .. })
    }
}
