//! Worker wiring: one queue and one dispatcher per consumer identity.

use std::sync::Arc;

use tracing::info;

use bookspace_events::EventDispatcher;
use bookspace_infra::{
    BusResult, DeadLetterMonitor, DeadLetterMonitorHandle, EventBus, SubscriptionHandle,
};

use crate::collaborators::{
    LoggingMailer, LoggingSearchIndex, LoggingThumbnailRenderer, Mailer, SearchIndex,
    ThumbnailRenderer,
};
use crate::handlers::{notifications, search, thumbnails};

pub const NOTIFICATIONS: &str = "notifications";
pub const SEARCH_INDEXING: &str = "search-indexing";
pub const THUMBNAILS: &str = "thumbnails";

#[derive(Clone)]
pub struct Collaborators {
    pub mailer: Arc<dyn Mailer>,
    pub search: Arc<dyn SearchIndex>,
    pub thumbnails: Arc<dyn ThumbnailRenderer>,
}

impl Collaborators {
    /// Implementations that only log.
    pub fn logging() -> Self {
        Self {
            mailer: Arc::new(LoggingMailer),
            search: Arc::new(LoggingSearchIndex),
            thumbnails: Arc::new(LoggingThumbnailRenderer),
        }
    }
}

/// Consumer identities and their dispatchers.
pub fn dispatchers(collaborators: &Collaborators) -> Vec<(&'static str, EventDispatcher)> {
    vec![
        (NOTIFICATIONS, notifications::dispatcher(collaborators.mailer.clone())),
        (SEARCH_INDEXING, search::dispatcher(collaborators.search.clone())),
        (THUMBNAILS, thumbnails::dispatcher(collaborators.thumbnails.clone())),
    ]
}

/// Running subscriptions plus the dead-letter monitor.
#[derive(Debug)]
pub struct Worker {
    subscriptions: Vec<SubscriptionHandle>,
    monitor: DeadLetterMonitorHandle,
}

impl Worker {
    /// Subscribe every consumer identity and start the DLQ monitor.
    pub async fn start(bus: &EventBus, collaborators: &Collaborators) -> BusResult<Self> {
        let mut subscriptions = Vec::new();
        for (identity, dispatcher) in dispatchers(collaborators) {
            let queue = bus.topology().consumer_queue(identity);
            info!(%queue, handles = ?dispatcher.registered_types(), "starting consumer");
            match bus.subscribe(&queue, dispatcher).await {
                Ok(handle) => subscriptions.push(handle),
                Err(err) => {
                    stop_all(subscriptions).await;
                    return Err(err);
                }
            }
        }

        Self::with_monitor(subscriptions, bus.dead_letter_monitor().await).await
    }

    async fn with_monitor(
        subscriptions: Vec<SubscriptionHandle>,
        monitor: BusResult<DeadLetterMonitor>,
    ) -> BusResult<Self> {
        match monitor {
            Ok(monitor) => Ok(Self {
                subscriptions,
                monitor: monitor.spawn(),
            }),
            Err(err) => {
                stop_all(subscriptions).await;
                Err(err)
            }
        }
    }

    pub fn subscriptions(&self) -> &[SubscriptionHandle] {
        &self.subscriptions
    }

    /// Stop intake, let in-flight deliveries settle, and flush pending retries.
    pub async fn shutdown(self) {
        for handle in self.subscriptions {
            let queue = handle.queue().to_string();
            let stats = handle.stats();
            handle.shutdown().await;
            info!(%queue, ?stats, "consumer stopped");
        }
        self.monitor.shutdown().await;
    }
}

async fn stop_all(subscriptions: Vec<SubscriptionHandle>) {
    for handle in subscriptions {
        handle.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bookspace_infra::broker::InMemoryBroker;
    use bookspace_infra::{BusConfig, BusError};

    #[tokio::test]
    async fn failed_monitor_start_stops_the_consumers() {
        let broker = InMemoryBroker::new();
        let bus = EventBus::connect(&broker, BusConfig::default()).await.unwrap();
        let mut subscriptions = Vec::new();
        for (identity, dispatcher) in dispatchers(&Collaborators::logging()) {
            let queue = bus.topology().consumer_queue(identity);
            subscriptions.push(bus.subscribe(&queue, dispatcher).await.unwrap());
        }
        let queues: Vec<String> = subscriptions.iter().map(|h| h.queue().to_string()).collect();

        let err = Worker::with_monitor(subscriptions, Err(BusError::NotConnected))
            .await
            .unwrap_err();

        assert!(matches!(err, BusError::NotConnected));
        for queue in queues {
            assert_eq!(broker.consumer_count(&queue), 0, "{queue} still consumed");
        }
    }
}
