//! In-process broker for tests and local development.
//!
//! Models the parts of AMQP semantics the bus relies on:
//! - durable-parameter checks on redeclaration
//! - fanout / direct exchanges and the default exchange
//! - per-consumer prefetch with round-robin across a queue's consumers
//! - reject-without-requeue routed through `x-dead-letter-exchange`
//! - unacked deliveries requeued (flagged redelivered) when a channel closes
//!
//! Every delivery and settlement is logged so tests can check that each
//! delivery tag was settled exactly once.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use super::transport::{
    Channel, ConnectionEvent, Connector, Delivery, DeliveryStream, DeliveryTag, ExchangeKind,
    ExchangeSpec, FIRST_DEATH_QUEUE_HEADER, FIRST_DEATH_REASON_HEADER, FieldValue,
    MessageProperties, OutboundMessage, QueueSpec, RawConnection, TransportError,
};
use crate::retry::RETRY_COUNT_HEADER;

/// A message sitting in a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub redelivered: bool,
}

/// One delivery handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub tag: DeliveryTag,
    pub queue: String,
    /// `x-retry-count` header at delivery time, if present.
    pub retry_count: Option<i64>,
    pub redelivered: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SettlementKind {
    Ack,
    Reject { requeue: bool },
}

/// One ack or reject accepted by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRecord {
    pub tag: DeliveryTag,
    pub queue: String,
    pub kind: SettlementKind,
}

#[derive(Debug)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

#[derive(Debug)]
struct ConsumerSlot {
    tag: String,
    channel: u64,
    /// 0 means unbounded.
    prefetch: u16,
    in_flight: usize,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

#[derive(Debug)]
struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<QueuedMessage>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    channel: u64,
    consumer_tag: String,
    message: QueuedMessage,
}

#[derive(Debug)]
struct ChannelState {
    open: bool,
    prefetch: u16,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    channels: HashMap<u64, ChannelState>,
    unacked: HashMap<DeliveryTag, Unacked>,
    next_tag: u64,
    next_channel: u64,
    deliveries: Vec<DeliveryRecord>,
    settlements: Vec<SettlementRecord>,
}

impl BrokerState {
    fn ensure_open(&self, channel: u64) -> Result<(), TransportError> {
        match self.channels.get(&channel) {
            Some(state) if state.open => Ok(()),
            _ => Err(TransportError::ChannelClosed),
        }
    }

    /// Route a message from `exchange`; unroutable messages are dropped.
    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: QueuedMessage,
    ) -> Result<(), TransportError> {
        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            let spec = self
                .exchanges
                .get(exchange)
                .ok_or_else(|| TransportError::NotFound(format!("exchange '{exchange}'")))?;
            self.bindings
                .iter()
                .filter(|b| b.exchange == exchange)
                .filter(|b| spec.kind == ExchangeKind::Fanout || b.routing_key == routing_key)
                .map(|b| b.queue.clone())
                .collect()
        };

        for queue in targets {
            if let Some(q) = self.queues.get_mut(&queue) {
                q.ready.push_back(message.clone());
                self.pump(&queue);
            }
        }
        Ok(())
    }

    /// Hand ready messages to consumers with spare prefetch capacity.
    fn pump(&mut self, queue: &str) {
        loop {
            let Some(q) = self.queues.get_mut(queue) else {
                return;
            };
            if q.ready.is_empty() || q.consumers.is_empty() {
                return;
            }

            let n = q.consumers.len();
            let Some(idx) = (0..n)
                .map(|i| (q.cursor + i) % n)
                .find(|&idx| q.consumers[idx].has_capacity())
            else {
                return;
            };
            let Some(message) = q.ready.pop_front() else {
                return;
            };

            self.next_tag += 1;
            let tag = DeliveryTag(self.next_tag);
            let delivery = Delivery {
                tag,
                queue: queue.to_string(),
                redelivered: message.redelivered,
                body: message.body.clone(),
                properties: message.properties.clone(),
            };

            if q.consumers[idx].tx.send(delivery).is_err() {
                // Consumer stream dropped without cancel.
                q.consumers.remove(idx);
                q.cursor = 0;
                q.ready.push_front(message);
                continue;
            }

            let consumer = &mut q.consumers[idx];
            consumer.in_flight += 1;
            q.cursor = (idx + 1) % n;

            self.deliveries.push(DeliveryRecord {
                tag,
                queue: queue.to_string(),
                retry_count: message
                    .properties
                    .headers
                    .get(RETRY_COUNT_HEADER)
                    .and_then(FieldValue::as_i64),
                redelivered: message.redelivered,
            });
            self.unacked.insert(
                tag,
                Unacked {
                    queue: queue.to_string(),
                    channel: consumer.channel,
                    consumer_tag: consumer.tag.clone(),
                    message,
                },
            );
        }
    }

    fn take_unacked(&mut self, channel: u64, tag: DeliveryTag) -> Result<Unacked, TransportError> {
        match self.unacked.get(&tag) {
            Some(entry) if entry.channel == channel => {}
            _ => return Err(TransportError::UnknownDeliveryTag(tag)),
        }
        let entry = self
            .unacked
            .remove(&tag)
            .ok_or(TransportError::UnknownDeliveryTag(tag))?;

        if let Some(q) = self.queues.get_mut(&entry.queue) {
            if let Some(consumer) = q.consumers.iter_mut().find(|c| c.tag == entry.consumer_tag) {
                consumer.in_flight = consumer.in_flight.saturating_sub(1);
            }
        }
        Ok(entry)
    }

    fn dead_letter(&mut self, queue: &str, mut message: QueuedMessage) {
        let Some(dlx) = self
            .queues
            .get(queue)
            .and_then(|q| q.spec.dead_letter_exchange())
            .map(str::to_string)
        else {
            return;
        };

        let headers = &mut message.properties.headers;
        headers
            .entry(FIRST_DEATH_QUEUE_HEADER.to_string())
            .or_insert_with(|| FieldValue::Text(queue.to_string()));
        headers
            .entry(FIRST_DEATH_REASON_HEADER.to_string())
            .or_insert_with(|| FieldValue::Text("rejected".to_string()));
        message.redelivered = false;

        // A missing DLX drops the message, as a real broker would.
        let _ = self.route(&dlx, "", message);
    }

    /// Close a channel: drop its consumers and requeue what they held.
    fn close_channel(&mut self, channel: u64) {
        if let Some(state) = self.channels.get_mut(&channel) {
            state.open = false;
        }
        for q in self.queues.values_mut() {
            q.consumers.retain(|c| c.channel != channel);
            q.cursor = 0;
        }

        let mut held: Vec<DeliveryTag> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        // Requeue newest first so the oldest ends up at the head.
        held.sort_unstable_by(|a, b| b.cmp(a));

        let mut touched = Vec::new();
        for tag in held {
            if let Some(mut entry) = self.unacked.remove(&tag) {
                entry.message.redelivered = true;
                if let Some(q) = self.queues.get_mut(&entry.queue) {
                    q.ready.push_front(entry.message);
                }
                touched.push(entry.queue);
            }
        }
        touched.sort();
        touched.dedup();
        for queue in touched {
            self.pump(&queue);
        }
    }
}

/// In-process broker; clones share state.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    events: broadcast::Sender<ConnectionEvent>,
    refuse_connections: Arc<AtomicBool>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            events,
            refuse_connections: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>, TransportError> {
        self.state
            .lock()
            .map_err(|_| TransportError::Protocol("broker state poisoned".to_string()))
    }

    fn inspect(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make subsequent `connect` calls fail (or succeed again).
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Simulate losing the connection: every channel closes, unacked
    /// deliveries go back to their queues, and listeners are notified.
    pub fn disconnect(&self, reason: &str) {
        {
            let mut state = self.inspect();
            let ids: Vec<u64> = state.channels.keys().copied().collect();
            for id in ids {
                state.close_channel(id);
            }
        }
        let _ = self.events.send(ConnectionEvent::ConnectionError {
            message: reason.to_string(),
        });
    }

    /// Publish without going through a channel (e.g. to inject raw bodies).
    pub fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        self.lock()?.route(
            exchange,
            routing_key,
            QueuedMessage {
                body: message.body,
                properties: message.properties,
                redelivered: false,
            },
        )
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.inspect().exchanges.get(name).cloned()
    }

    pub fn queue(&self, name: &str) -> Option<QueueSpec> {
        self.inspect().queues.get(name).map(|q| q.spec.clone())
    }

    /// Queues bound to `exchange`, sorted by name.
    pub fn bound_queues(&self, exchange: &str) -> Vec<String> {
        let mut queues: Vec<String> = self
            .inspect()
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .map(|b| b.queue.clone())
            .collect();
        queues.sort();
        queues.dedup();
        queues
    }

    /// Messages waiting in `queue`, head first.
    pub fn ready_messages(&self, queue: &str) -> Vec<QueuedMessage> {
        self.inspect()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn ready_count(&self, queue: &str) -> usize {
        self.inspect()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Drop every ready message in `queue`, as an operator purge would.
    /// Returns how many were dropped.
    pub fn purge(&self, queue: &str) -> usize {
        self.inspect()
            .queues
            .get_mut(queue)
            .map_or(0, |q| q.ready.drain(..).count())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inspect()
            .unacked
            .values()
            .filter(|u| u.queue == queue)
            .count()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.inspect()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    pub fn deliveries(&self) -> Vec<DeliveryRecord> {
        self.inspect().deliveries.clone()
    }

    pub fn deliveries_for(&self, queue: &str) -> Vec<DeliveryRecord> {
        self.inspect()
            .deliveries
            .iter()
            .filter(|d| d.queue == queue)
            .cloned()
            .collect()
    }

    pub fn settlements(&self) -> Vec<SettlementRecord> {
        self.inspect().settlements.clone()
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self, _url: &str) -> Result<RawConnection, TransportError> {
        if self.refuse_connections.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        let id = {
            let mut state = self.lock()?;
            state.next_channel += 1;
            let id = state.next_channel;
            state.channels.insert(
                id,
                ChannelState {
                    open: true,
                    prefetch: 0,
                },
            );
            id
        };

        Ok(RawConnection {
            channel: Arc::new(InMemoryChannel {
                broker: self.clone(),
                id,
            }),
            events: self.events.clone(),
        })
    }
}

/// Channel on an [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemoryChannel {
    broker: InMemoryBroker,
    id: u64,
}

impl InMemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>, TransportError> {
        let state = self.broker.lock()?;
        state.ensure_open(self.id)?;
        Ok(state)
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    fn is_open(&self) -> bool {
        self.broker.inspect().ensure_open(self.id).is_ok()
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), TransportError> {
        let mut state = self.open_state()?;
        match state.exchanges.get(&spec.name) {
            Some(existing) if existing != spec => Err(TransportError::PreconditionFailed(format!(
                "inequivalent arguments for exchange '{}'",
                spec.name
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), TransportError> {
        let mut state = self.open_state()?;
        match state.queues.get(&spec.name) {
            Some(existing) if existing.spec != *spec => Err(TransportError::PreconditionFailed(
                format!("inequivalent arguments for queue '{}'", spec.name),
            )),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    spec.name.clone(),
                    QueueState {
                        spec: spec.clone(),
                        ready: VecDeque::new(),
                        consumers: Vec::new(),
                        cursor: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.open_state()?;
        if !state.exchanges.contains_key(exchange) {
            return Err(TransportError::NotFound(format!("exchange '{exchange}'")));
        }
        if !state.queues.contains_key(queue) {
            return Err(TransportError::NotFound(format!("queue '{queue}'")));
        }
        let exists = state.bindings.iter().any(|b| {
            b.exchange == exchange && b.queue == queue && b.routing_key == routing_key
        });
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        let mut state = self.open_state()?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = count;
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        let mut state = self.open_state()?;
        state.route(
            exchange,
            routing_key,
            QueuedMessage {
                body: message.body,
                properties: message.properties,
                redelivered: false,
            },
        )
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        let mut state = self.open_state()?;
        let prefetch = state.channels.get(&self.id).map_or(0, |c| c.prefetch);
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::NotFound(format!("queue '{queue}'")))?;
        if q.consumers.iter().any(|c| c.tag == consumer_tag) {
            return Err(TransportError::PreconditionFailed(format!(
                "consumer tag '{consumer_tag}' already in use"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        q.consumers.push(ConsumerSlot {
            tag: consumer_tag.to_string(),
            channel: self.id,
            prefetch,
            in_flight: 0,
            tx,
        });
        state.pump(queue);
        Ok(DeliveryStream::new(rx))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        let mut state = self.open_state()?;
        for q in state.queues.values_mut() {
            let before = q.consumers.len();
            q.consumers
                .retain(|c| !(c.channel == self.id && c.tag == consumer_tag));
            if q.consumers.len() != before {
                q.cursor = 0;
            }
        }
        Ok(())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), TransportError> {
        let mut state = self.open_state()?;
        let entry = state.take_unacked(self.id, tag)?;
        state.settlements.push(SettlementRecord {
            tag,
            queue: entry.queue.clone(),
            kind: SettlementKind::Ack,
        });
        state.pump(&entry.queue);
        Ok(())
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), TransportError> {
        let mut state = self.open_state()?;
        let mut entry = state.take_unacked(self.id, tag)?;
        state.settlements.push(SettlementRecord {
            tag,
            queue: entry.queue.clone(),
            kind: SettlementKind::Reject { requeue },
        });

        if requeue {
            entry.message.redelivered = true;
            if let Some(q) = state.queues.get_mut(&entry.queue) {
                q.ready.push_front(entry.message);
            }
        } else {
            state.dead_letter(&entry.queue, entry.message);
        }
        state.pump(&entry.queue);
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> Result<u32, TransportError> {
        let state = self.open_state()?;
        let q = state
            .queues
            .get(queue)
            .ok_or_else(|| TransportError::NotFound(format!("queue '{queue}'")))?;
        Ok(u32::try_from(q.ready.len()).unwrap_or(u32::MAX))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.open_state()?;
        state.close_channel(self.id);
        Ok(())
    }
}
