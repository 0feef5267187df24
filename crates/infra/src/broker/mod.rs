//! Broker transport: the contract, connection handling, and implementations.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod connection;
pub mod in_memory;
pub mod transport;

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use connection::{BrokerConnection, ChannelHandle, connect, redact_url};
pub use in_memory::{
    DeliveryRecord, InMemoryBroker, QueuedMessage, SettlementKind, SettlementRecord,
};
pub use transport::{
    Channel, ConnectionEvent, Connector, Delivery, DeliveryStream, DeliveryTag, ExchangeKind,
    ExchangeSpec, FieldTable, FieldValue, MessageProperties, OutboundMessage, QueueSpec,
    RawConnection, TransportError,
};
