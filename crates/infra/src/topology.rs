//! Exchange / queue / binding layout.
//!
//! ```text
//! <ns>.events       fanout, durable     producers publish here
//! <ns>.events.dlx   fanout, durable     rejected deliveries land here
//! <ns>.events.dlq   durable, bound to the DLX
//! <queue>           durable, bound to <ns>.events, x-dead-letter-exchange = <ns>.events.dlx
//! ```
//!
//! Every declaration is idempotent; a mismatch with an existing entity is a
//! fatal [`BusError::Declaration`].

use tracing::{error, info, instrument};

use crate::broker::{ChannelHandle, ExchangeSpec, QueueSpec};
use crate::error::{BusError, BusResult};

pub const DEFAULT_NAMESPACE: &str = "bookspace";

/// Names derived from one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    namespace: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl Topology {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn exchange(&self) -> String {
        format!("{}.events", self.namespace)
    }

    pub fn dead_letter_exchange(&self) -> String {
        format!("{}.events.dlx", self.namespace)
    }

    pub fn dead_letter_queue(&self) -> String {
        format!("{}.events.dlq", self.namespace)
    }

    /// Queue name for a consumer identity, e.g. `bookspace.notifications`.
    pub fn consumer_queue(&self, identity: &str) -> String {
        format!("{}.{identity}", self.namespace)
    }

    pub fn exchange_spec(&self) -> ExchangeSpec {
        ExchangeSpec::fanout(self.exchange())
    }

    pub fn dead_letter_exchange_spec(&self) -> ExchangeSpec {
        ExchangeSpec::fanout(self.dead_letter_exchange())
    }

    pub fn dead_letter_queue_spec(&self) -> QueueSpec {
        QueueSpec::durable(self.dead_letter_queue())
    }

    /// Declaration for a consumer queue: durable, dead-lettering into the DLX.
    pub fn consumer_queue_spec(&self, queue: &str) -> QueueSpec {
        QueueSpec::durable(queue).with_dead_letter_exchange(self.dead_letter_exchange())
    }
}

/// Declare both exchanges and the dead-letter queue. Safe on every start.
#[instrument(skip(channel, topology), fields(namespace = %topology.namespace()), err)]
pub async fn declare_topology(channel: &ChannelHandle, topology: &Topology) -> BusResult<()> {
    for spec in [topology.exchange_spec(), topology.dead_letter_exchange_spec()] {
        channel.declare_exchange(&spec).await.map_err(|source| {
            error!(exchange = %spec.name, error = %source, "exchange declaration failed");
            BusError::declaration(format!("exchange {}", spec.name), source)
        })?;
    }

    let dlq = topology.dead_letter_queue_spec();
    let dlx = topology.dead_letter_exchange();
    channel.declare_queue(&dlq).await.map_err(|source| {
        error!(queue = %dlq.name, error = %source, "queue declaration failed");
        BusError::declaration(format!("queue {}", dlq.name), source)
    })?;
    channel
        .bind_queue(&dlq.name, &dlx, "")
        .await
        .map_err(|source| {
            BusError::declaration(format!("binding {} -> {}", dlq.name, dlx), source)
        })?;

    info!(
        exchange = %topology.exchange(),
        dead_letter_exchange = %dlx,
        dead_letter_queue = %dlq.name,
        "topology declared"
    );
    Ok(())
}

/// Declare a consumer queue and bind it to the primary exchange.
#[instrument(skip(channel, topology), err)]
pub async fn declare_consumer_queue(
    channel: &ChannelHandle,
    topology: &Topology,
    queue: &str,
) -> BusResult<()> {
    let spec = topology.consumer_queue_spec(queue);
    channel.declare_queue(&spec).await.map_err(|source| {
        error!(error = %source, "queue declaration failed");
        BusError::declaration(format!("queue {queue}"), source)
    })?;

    let exchange = topology.exchange();
    channel
        .bind_queue(queue, &exchange, "")
        .await
        .map_err(|source| BusError::declaration(format!("binding {queue} -> {exchange}"), source))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_the_namespace() {
        let topology = Topology::default();
        assert_eq!(topology.exchange(), "bookspace.events");
        assert_eq!(topology.dead_letter_exchange(), "bookspace.events.dlx");
        assert_eq!(topology.dead_letter_queue(), "bookspace.events.dlq");
        assert_eq!(topology.consumer_queue("notifications"), "bookspace.notifications");
    }

    #[test]
    fn consumer_queues_dead_letter_into_the_dlx() {
        let spec = Topology::new("test").consumer_queue_spec("test.search");
        assert!(spec.durable);
        assert_eq!(spec.dead_letter_exchange(), Some("test.events.dlx"));
    }
}
