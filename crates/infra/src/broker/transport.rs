//! Transport contract the bus is written against.
//!
//! The broker is a black box exposing connect / declare / bind / publish /
//! consume / ack / reject / prefetch. [`InMemoryBroker`](super::InMemoryBroker)
//! implements it in-process; the `amqp` feature adds a `lapin`-backed one.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Queue argument naming the exchange rejected messages are routed to.
pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";

/// Header set by the broker on dead-lettered messages: the queue they died in.
pub const FIRST_DEATH_QUEUE_HEADER: &str = "x-first-death-queue";

/// Header set by the broker on dead-lettered messages: why they died.
pub const FIRST_DEATH_REASON_HEADER: &str = "x-first-death-reason";

/// Header and argument values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Int(i64),
    Text(String),
    Bool(bool),
}

impl FieldValue {
    /// Integer view; numeric strings are accepted since some clients send
    /// counters as text.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(i) => Some(*i),
            FieldValue::Text(s) => s.trim().parse().ok(),
            FieldValue::Bool(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Headers / arguments table.
pub type FieldTable = BTreeMap<String, FieldValue>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Copies every message to every bound queue; routing keys are ignored.
    Fanout,
    /// Routes on exact routing-key match.
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    /// Durable fanout exchange.
    pub fn fanout(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Fanout,
            durable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub arguments: FieldTable,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            arguments: FieldTable::new(),
        }
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.arguments.insert(
            DEAD_LETTER_EXCHANGE_ARG.to_string(),
            FieldValue::Text(exchange.into()),
        );
        self
    }

    pub fn dead_letter_exchange(&self) -> Option<&str> {
        self.arguments
            .get(DEAD_LETTER_EXCHANGE_ARG)
            .and_then(FieldValue::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    /// Survives a broker restart (AMQP delivery mode 2).
    pub persistent: bool,
    /// Publish time, seconds since the Unix epoch.
    pub timestamp: Option<u64>,
    pub headers: FieldTable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// Broker-assigned, opaque identifier of one in-flight delivery.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

impl core::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// A message handed to a consumer and not yet settled.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub queue: String,
    /// Set when the broker delivers the message again after a channel loss.
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// Push-based stream of deliveries for one consumer.
///
/// Ends when the consumer is cancelled or the channel closes.
#[derive(Debug)]
pub struct DeliveryStream {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl DeliveryStream {
    pub fn new(rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

/// Connection / channel state notifications surfaced to the caller.
///
/// The bus does not reconnect on its own; a supervisor listening to these
/// decides whether to call `connect` again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    ConnectionError { message: String },
    ChannelError { message: String },
    Closed { reason: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("channel is closed")]
    ChannelClosed,

    /// Redeclaration with different parameters, double settlement, etc.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(DeliveryTag),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// One multiplexed channel on a broker connection.
#[async_trait]
pub trait Channel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Idempotent for identical parameters; a mismatch is
    /// [`TransportError::PreconditionFailed`].
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), TransportError>;

    /// Idempotent for identical parameters; a mismatch is
    /// [`TransportError::PreconditionFailed`].
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), TransportError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    /// Bound on unacknowledged deliveries for consumers started afterwards.
    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError>;

    /// The empty exchange name is the default exchange: it routes to the
    /// queue named by `routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), TransportError>;

    async fn consume(&self, queue: &str, consumer_tag: &str)
    -> Result<DeliveryStream, TransportError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    async fn ack(&self, tag: DeliveryTag) -> Result<(), TransportError>;

    /// `requeue = false` hands the message to the queue's dead-letter
    /// exchange, if it has one.
    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), TransportError>;

    /// Messages ready for delivery (not counting unacknowledged ones).
    async fn queue_depth(&self, queue: &str) -> Result<u32, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// What a [`Connector`] hands back: the single channel plus the state
/// notification feed.
pub struct RawConnection {
    pub channel: Arc<dyn Channel>,
    pub events: broadcast::Sender<ConnectionEvent>,
}

/// Establishes broker connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<RawConnection, TransportError>;
}
