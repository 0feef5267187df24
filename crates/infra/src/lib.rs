//! Broker-backed event bus: topology, publishing, and the consumer loop
//! with bounded retry and dead-letter quarantine.
//!
//! ```text
//! Publisher -> <ns>.events (fanout) -> N queues -> Consumer -> handler
//!                                                     |-> ack
//!                                                     |-> delayed republish (x-retry-count + 1)
//!                                                     '-> reject -> <ns>.events.dlx -> <ns>.events.dlq
//! ```

pub mod broker;
pub mod bus;
pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod error;
pub mod publisher;
pub mod retry;
pub mod topology;

pub use bus::EventBus;
pub use config::{BusConfig, ConfigError};
pub use consumer::{Consumer, ConsumerSettings, ConsumerStatsSnapshot, SubscriptionHandle};
pub use dead_letter::{DeadLetterMonitor, DeadLetterMonitorHandle};
pub use error::{BusError, BusResult};
pub use publisher::Publisher;
pub use retry::{RETRY_COUNT_HEADER, RetryDecision, RetryPolicy};
pub use topology::Topology;
