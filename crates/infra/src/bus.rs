//! The bus facade producers and workers are handed.
//!
//! Built explicitly from a [`Connector`] and a [`BusConfig`] and passed
//! down; there is no process-wide instance.

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};
use tracing::{info, instrument, warn};

use bookspace_events::{Event, EventHandler, EventPublisher};

use crate::broker::{
    BrokerConnection, ChannelHandle, ConnectionEvent, Connector, connect, redact_url,
};
use crate::config::BusConfig;
use crate::consumer::{Consumer, SubscriptionHandle};
use crate::dead_letter::DeadLetterMonitor;
use crate::error::{BusError, BusResult};
use crate::publisher::Publisher;
use crate::topology::{Topology, declare_consumer_queue, declare_topology};

#[derive(Debug)]
pub struct EventBus {
    config: BusConfig,
    topology: Topology,
    connection: RwLock<Option<BrokerConnection>>,
}

impl EventBus {
    /// Connect and declare the topology.
    ///
    /// Both failures are fatal; the connection is closed again if the
    /// topology cannot be declared.
    #[instrument(skip(connector, config), fields(namespace = %config.namespace), err)]
    pub async fn connect<C>(connector: &C, config: BusConfig) -> BusResult<Self>
    where
        C: Connector + ?Sized,
    {
        let connection = connect(connector, &config.url).await?;
        let topology = config.topology();

        if let Err(err) = declare_topology(connection.channel(), &topology).await {
            if let Err(close_err) = connection.close().await {
                warn!(error = %close_err, "closing after failed declaration");
            }
            return Err(err);
        }

        Ok(Self {
            config,
            topology,
            connection: RwLock::new(Some(connection)),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    async fn channel(&self) -> BusResult<ChannelHandle> {
        match self.connection.read().await.as_ref() {
            Some(connection) if connection.is_open() => Ok(connection.channel().clone()),
            _ => Err(BusError::NotConnected),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.channel().await.is_ok()
    }

    /// Connection and channel state notifications.
    pub async fn connection_events(&self) -> BusResult<broadcast::Receiver<ConnectionEvent>> {
        self.connection
            .read()
            .await
            .as_ref()
            .map(BrokerConnection::events)
            .ok_or(BusError::NotConnected)
    }

    pub async fn publish(&self, event: &Event) -> BusResult<()> {
        let channel = self.channel().await?;
        Publisher::new(channel, self.topology.exchange())
            .publish(event)
            .await
    }

    /// Declare `queue` (bound to the event exchange, dead-lettering into the
    /// DLX) and start consuming it.
    #[instrument(skip(self, handler), err)]
    pub async fn subscribe<H>(&self, queue: &str, handler: H) -> BusResult<SubscriptionHandle>
    where
        H: EventHandler + 'static,
    {
        let channel = self.channel().await?;
        declare_consumer_queue(&channel, &self.topology, queue).await?;
        Consumer::new(channel, self.config.consumer_settings())
            .subscribe(queue, handler)
            .await
    }

    /// Depth monitor for this namespace's dead-letter queue.
    pub async fn dead_letter_monitor(&self) -> BusResult<DeadLetterMonitor> {
        let channel = self.channel().await?;
        Ok(DeadLetterMonitor::new(
            channel,
            self.topology.dead_letter_queue(),
            self.config.dlq_poll_interval,
        ))
    }

    /// Close the channel. Subsequent publishes fail with `NotConnected`;
    /// closing twice is a no-op.
    #[instrument(skip(self), err)]
    pub async fn close(&self) -> BusResult<()> {
        let Some(connection) = self.connection.write().await.take() else {
            return Ok(());
        };
        connection
            .close()
            .await
            .map_err(|source| BusError::Connection {
                url: redact_url(&self.config.url),
                source,
            })?;
        info!("bus closed");
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for EventBus {
    type Error = BusError;

    async fn publish(&self, event: &Event) -> Result<(), Self::Error> {
        EventBus::publish(self, event).await
    }
}
