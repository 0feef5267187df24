//! `lapin`-backed AMQP 0-9-1 transport.

use std::sync::Arc;

use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::{AMQPValue, FieldTable as AmqpFieldTable, LongString, ShortString};
use lapin::{BasicProperties, ConnectionProperties};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tracing::{debug, error, warn};

use super::transport::{
    Channel, ConnectionEvent, Connector, Delivery, DeliveryStream, DeliveryTag, ExchangeKind,
    ExchangeSpec, FieldTable, FieldValue, MessageProperties, OutboundMessage, QueueSpec,
    RawConnection, TransportError,
};

const PERSISTENT: u8 = 2;

/// Opens one connection and one channel per `connect`.
#[derive(Clone, Default)]
pub struct AmqpConnector {
    properties: ConnectionProperties,
}

impl core::fmt::Debug for AmqpConnector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AmqpConnector").finish_non_exhaustive()
    }
}

impl AmqpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, url: &str) -> Result<RawConnection, TransportError> {
        let connection = lapin::Connection::connect(url, self.properties.clone())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (events, _) = broadcast::channel(16);

        let tx = events.clone();
        connection.on_error(move |err| {
            error!(error = %err, "broker connection error");
            let _ = tx.send(ConnectionEvent::ConnectionError {
                message: err.to_string(),
            });
        });
        let tx = events.clone();
        channel.on_error(move |err| {
            error!(error = %err, "broker channel error");
            let _ = tx.send(ConnectionEvent::ChannelError {
                message: err.to_string(),
            });
        });

        Ok(RawConnection {
            channel: Arc::new(AmqpChannel {
                connection,
                channel,
            }),
            events,
        })
    }
}

pub struct AmqpChannel {
    connection: lapin::Connection,
    channel: lapin::Channel,
}

fn map_error(err: lapin::Error) -> TransportError {
    match &err {
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                TransportError::PreconditionFailed(amqp.to_string())
            }
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => {
                TransportError::NotFound(amqp.to_string())
            }
            _ => TransportError::Protocol(err.to_string()),
        },
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            TransportError::ChannelClosed
        }
        _ => TransportError::Protocol(err.to_string()),
    }
}

fn to_amqp_table(table: &FieldTable) -> AmqpFieldTable {
    let mut out = AmqpFieldTable::default();
    for (key, value) in table {
        let value = match value {
            FieldValue::Int(i) => AMQPValue::LongLongInt(*i),
            FieldValue::Text(s) => AMQPValue::LongString(LongString::from(s.as_str())),
            FieldValue::Bool(b) => AMQPValue::Boolean(*b),
        };
        out.insert(ShortString::from(key.as_str()), value);
    }
    out
}

fn from_amqp_table(table: &AmqpFieldTable) -> FieldTable {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongLongInt(i) => FieldValue::Int(*i),
                AMQPValue::LongInt(i) => FieldValue::Int(i64::from(*i)),
                AMQPValue::LongUInt(i) => FieldValue::Int(i64::from(*i)),
                AMQPValue::ShortInt(i) => FieldValue::Int(i64::from(*i)),
                AMQPValue::ShortUInt(i) => FieldValue::Int(i64::from(*i)),
                AMQPValue::ShortShortInt(i) => FieldValue::Int(i64::from(*i)),
                AMQPValue::ShortShortUInt(i) => FieldValue::Int(i64::from(*i)),
                AMQPValue::Boolean(b) => FieldValue::Bool(*b),
                AMQPValue::ShortString(s) => FieldValue::Text(s.as_str().to_string()),
                AMQPValue::LongString(s) => {
                    FieldValue::Text(String::from_utf8_lossy(s.as_bytes()).into_owned())
                }
                // Nested tables and arrays (e.g. x-death) are not needed by the bus.
                _ => return None,
            };
            Some((key.as_str().to_string(), value))
        })
        .collect()
}

fn to_basic_properties(props: &MessageProperties) -> BasicProperties {
    let mut out = BasicProperties::default();
    if let Some(content_type) = &props.content_type {
        out = out.with_content_type(ShortString::from(content_type.as_str()));
    }
    if props.persistent {
        out = out.with_delivery_mode(PERSISTENT);
    }
    if let Some(timestamp) = props.timestamp {
        out = out.with_timestamp(timestamp);
    }
    if !props.headers.is_empty() {
        out = out.with_headers(to_amqp_table(&props.headers));
    }
    out
}

fn from_basic_properties(props: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: props.content_type().as_ref().map(|s| s.as_str().to_string()),
        persistent: *props.delivery_mode() == Some(PERSISTENT),
        timestamp: *props.timestamp(),
        headers: props
            .headers()
            .as_ref()
            .map(from_amqp_table)
            .unwrap_or_default(),
    }
}

#[async_trait]
impl Channel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), TransportError> {
        let kind = match spec.kind {
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        };
        let options = ExchangeDeclareOptions {
            durable: spec.durable,
            ..Default::default()
        };
        self.channel
            .exchange_declare(&spec.name, kind, options, AmqpFieldTable::default())
            .await
            .map_err(map_error)
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), TransportError> {
        let options = QueueDeclareOptions {
            durable: spec.durable,
            ..Default::default()
        };
        self.channel
            .queue_declare(&spec.name, options, to_amqp_table(&spec.arguments))
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                AmqpFieldTable::default(),
            )
            .await
            .map_err(map_error)
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(map_error)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        // Confirms are not enabled on the channel; the returned handle
        // resolves immediately.
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                to_basic_properties(&message.properties),
            )
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                AmqpFieldTable::default(),
            )
            .await
            .map_err(map_error)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let queue = queue.to_string();
        tokio::spawn(async move {
            while let Some(next) = consumer.next().await {
                match next {
                    Ok(delivery) => {
                        let delivery = Delivery {
                            tag: DeliveryTag(delivery.delivery_tag),
                            queue: queue.clone(),
                            redelivered: delivery.redelivered,
                            properties: from_basic_properties(&delivery.properties),
                            body: delivery.data,
                        };
                        if tx.send(delivery).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(queue = %queue, error = %err, "consumer stream failed");
                        break;
                    }
                }
            }
            debug!(queue = %queue, "consumer stream closed");
        });

        Ok(DeliveryStream::new(rx))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(map_error)
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), TransportError> {
        self.channel
            .basic_ack(tag.0, BasicAckOptions::default())
            .await
            .map_err(map_error)
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), TransportError> {
        self.channel
            .basic_reject(tag.0, BasicRejectOptions { requeue })
            .await
            .map_err(map_error)
    }

    async fn queue_depth(&self, queue: &str) -> Result<u32, TransportError> {
        let options = QueueDeclareOptions {
            passive: true,
            ..Default::default()
        };
        self.channel
            .queue_declare(queue, options, AmqpFieldTable::default())
            .await
            .map(|q| q.message_count())
            .map_err(map_error)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.channel
            .close(200, "closed by application")
            .await
            .map_err(map_error)?;
        self.connection
            .close(200, "closed by application")
            .await
            .map_err(map_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_survive_conversion() {
        let mut headers = FieldTable::new();
        headers.insert("x-retry-count".into(), FieldValue::Int(2));
        headers.insert("x-first-death-queue".into(), FieldValue::Text("q".into()));
        let props = MessageProperties {
            content_type: Some("application/json".into()),
            persistent: true,
            timestamp: Some(1_700_000_000),
            headers,
        };

        assert_eq!(from_basic_properties(&to_basic_properties(&props)), props);
    }

    #[test]
    fn narrow_integers_widen() {
        let mut table = AmqpFieldTable::default();
        table.insert("x-retry-count".into(), AMQPValue::ShortShortUInt(3));
        assert_eq!(from_amqp_table(&table).get("x-retry-count"), Some(&FieldValue::Int(3)));
    }
}
