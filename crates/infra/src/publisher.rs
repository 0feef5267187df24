use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, instrument};

use bookspace_events::codec::{self, CONTENT_TYPE};
use bookspace_events::{Event, EventPublisher};

use crate::broker::{ChannelHandle, FieldTable, MessageProperties, OutboundMessage};
use crate::error::{BusError, BusResult};

/// Publishes events to the primary fanout exchange.
///
/// Fire-and-forget: returns once the broker accepted the write, without
/// waiting for delivery to any queue.
#[derive(Debug, Clone)]
pub struct Publisher {
    channel: ChannelHandle,
    exchange: String,
}

impl Publisher {
    pub fn new(channel: ChannelHandle, exchange: impl Into<String>) -> Self {
        Self {
            channel,
            exchange: exchange.into(),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    #[instrument(
        skip(self, event),
        fields(
            exchange = %self.exchange,
            event_type = %event.event_type(),
            correlation_id = ?event.correlation_id().map(|c| c.as_str()),
        ),
        err
    )]
    pub async fn publish(&self, event: &Event) -> BusResult<()> {
        if !self.channel.is_open() {
            return Err(BusError::NotConnected);
        }

        let body = codec::encode(event)?;
        let message = OutboundMessage {
            body,
            properties: message_properties(),
        };

        self.channel
            .publish(&self.exchange, "", message)
            .await
            .map_err(|source| {
                error!(error = %source, "publish failed");
                BusError::publish(source)
            })?;

        debug!("event published");
        Ok(())
    }
}

fn message_properties() -> MessageProperties {
    MessageProperties {
        content_type: Some(CONTENT_TYPE.to_string()),
        persistent: true,
        timestamp: u64::try_from(Utc::now().timestamp()).ok(),
        headers: FieldTable::new(),
    }
}

#[async_trait]
impl EventPublisher for Publisher {
    type Error = BusError;

    async fn publish(&self, event: &Event) -> Result<(), Self::Error> {
        Publisher::publish(self, event).await
    }
}
