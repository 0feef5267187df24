//! Consumer loop: bounded intake, handler invocation, and the
//! ack / retry / dead-letter state machine.
//!
//! Each delivery ends in exactly one settlement of its tag:
//! - handler success, or an unknown event type: `ack`
//! - failure with `x-retry-count < max_retries`: a delayed copy is scheduled
//!   with the count incremented, then the original is acked
//! - failure at the limit: `reject` without requeue, which the queue's
//!   dead-letter exchange routes to the DLQ
//!
//! Malformed bodies follow the failure path. Handler errors, panics and
//! timeouts never escape the loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use bookspace_events::codec;
use bookspace_events::{Event, EventHandler};

use crate::broker::{
    ChannelHandle, Delivery, DeliveryStream, DeliveryTag, FieldValue, MessageProperties,
    OutboundMessage,
};
use crate::error::{BusError, BusResult};
use crate::retry::{self, RETRY_COUNT_HEADER, RetryDecision, RetryPolicy};

pub const DEFAULT_PREFETCH: u16 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    /// Unacknowledged deliveries the broker may hand this consumer at once.
    pub prefetch: u16,
    pub retry: RetryPolicy,
    /// Abort handlers that run longer and treat them as failed. Off by default.
    pub handler_timeout: Option<Duration>,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            prefetch: DEFAULT_PREFETCH,
            retry: RetryPolicy::default(),
            handler_timeout: None,
        }
    }
}

impl ConsumerSettings {
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }
}

/// Live counters for one subscription.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    delivered: AtomicU64,
    acked: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    handler_failures: AtomicU64,
    decode_failures: AtomicU64,
    dropped_unknown: AtomicU64,
    settle_failures: AtomicU64,
}

/// Point-in-time copy of [`ConsumerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStatsSnapshot {
    pub delivered: u64,
    pub acked: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub handler_failures: u64,
    pub decode_failures: u64,
    pub dropped_unknown: u64,
    pub settle_failures: u64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            dropped_unknown: self.dropped_unknown.load(Ordering::Relaxed),
            settle_failures: self.settle_failures.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Handle to a running subscription.
///
/// Dropping it stops the consumer without waiting; [`shutdown`](Self::shutdown)
/// waits for in-flight deliveries to settle and publishes scheduled retries
/// without waiting out their backoff.
#[derive(Debug)]
pub struct SubscriptionHandle {
    queue: String,
    consumer_tag: String,
    stats: Arc<ConsumerStats>,
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn stats(&self) -> ConsumerStatsSnapshot {
        self.stats.snapshot()
    }

    /// True once the loop has exited (shutdown, or the delivery stream ended).
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(queue = %self.queue, error = %err, "consumer loop terminated abnormally");
            }
        }
    }
}

/// Starts consumer loops on a shared channel.
#[derive(Debug, Clone)]
pub struct Consumer {
    channel: ChannelHandle,
    settings: ConsumerSettings,
}

impl Consumer {
    pub fn new(channel: ChannelHandle, settings: ConsumerSettings) -> Self {
        Self { channel, settings }
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Start consuming `queue`, which must already exist.
    #[tracing::instrument(skip(self, handler), fields(prefetch = self.settings.prefetch), err)]
    pub async fn subscribe<H>(&self, queue: &str, handler: H) -> BusResult<SubscriptionHandle>
    where
        H: EventHandler + 'static,
    {
        if !self.channel.is_open() {
            return Err(BusError::NotConnected);
        }

        let consumer_tag = format!("{queue}.{}", Uuid::now_v7());
        let prefetch = self.settings.prefetch.max(1);
        let stream = self
            .channel
            .consume(queue, &consumer_tag, prefetch)
            .await
            .map_err(|source| {
                error!(error = %source, "consume failed");
                BusError::subscribe(queue, source)
            })?;

        let stats = Arc::new(ConsumerStats::default());
        let ctx = Arc::new(LoopContext {
            channel: self.channel.clone(),
            queue: queue.to_string(),
            consumer_tag: consumer_tag.clone(),
            handler: Arc::new(handler),
            retry: self.settings.retry,
            handler_timeout: self.settings.handler_timeout,
            stats: stats.clone(),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let span = info_span!("consumer", queue = %queue, consumer_tag = %consumer_tag);
        let join = tokio::spawn(run(ctx, stream, shutdown_rx).instrument(span));

        info!(consumer_tag = %consumer_tag, "subscribed");
        Ok(SubscriptionHandle {
            queue: queue.to_string(),
            consumer_tag,
            stats,
            shutdown: Some(shutdown_tx),
            join: Some(join),
        })
    }
}

struct LoopContext {
    channel: ChannelHandle,
    queue: String,
    consumer_tag: String,
    handler: Arc<dyn EventHandler>,
    retry: RetryPolicy,
    handler_timeout: Option<Duration>,
    stats: Arc<ConsumerStats>,
}

/// A delayed republish of a failed delivery.
struct ScheduledRetry {
    attempt: u32,
    delay: Duration,
    message: OutboundMessage,
}

async fn run(
    ctx: Arc<LoopContext>,
    mut stream: DeliveryStream,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut in_flight = JoinSet::new();
    let mut retries = JoinSet::new();
    let (retry_tx, mut retry_rx) = mpsc::unbounded_channel::<ScheduledRetry>();
    let (flush_tx, flush_rx) = watch::channel(false);

    let stream_open = loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("consumer shutting down");
                break true;
            }
            delivery = stream.next() => match delivery {
                Some(delivery) => {
                    in_flight.spawn(process(ctx.clone(), delivery, retry_tx.clone()));
                }
                None => {
                    warn!("delivery stream ended");
                    break false;
                }
            },
            Some(job) = retry_rx.recv() => {
                retries.spawn(republish(ctx.clone(), job, flush_rx.clone()));
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => log_join(joined),
            Some(joined) = retries.join_next(), if !retries.is_empty() => log_join(joined),
        }
    };

    // Stopping: pending and late retries skip the rest of their backoff.
    flush_tx.send_replace(true);

    if stream_open {
        match ctx.channel.cancel(&ctx.consumer_tag).await {
            Ok(()) => {
                // Deliveries pushed before the cancel took effect.
                while let Some(delivery) = stream.next().await {
                    settle(&ctx, delivery.tag, Settlement::Requeue).await;
                }
            }
            Err(err) => warn!(error = %err, "consumer cancel failed"),
        }
    }
    drop(stream);
    drop(retry_tx);

    loop {
        tokio::select! {
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => log_join(joined),
            Some(job) = retry_rx.recv() => {
                retries.spawn(republish(ctx.clone(), job, flush_rx.clone()));
            }
            else => break,
        }
    }
    while let Some(joined) = retries.join_next().await {
        log_join(joined);
    }

    info!(stats = ?ctx.stats.snapshot(), "consumer stopped");
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        error!(error = %err, "consumer task failed");
    }
}

enum Outcome {
    Ack,
    Failed(String),
}

#[derive(Debug, Clone, Copy)]
enum Settlement {
    Ack,
    DeadLetter,
    Requeue,
}

async fn process(
    ctx: Arc<LoopContext>,
    delivery: Delivery,
    retry_tx: mpsc::UnboundedSender<ScheduledRetry>,
) {
    bump(&ctx.stats.delivered);
    let retry_count = retry::retry_count(&delivery.properties.headers);
    let span = info_span!(
        "delivery",
        delivery_tag = %delivery.tag,
        retry_count,
        redelivered = delivery.redelivered,
        event_type = tracing::field::Empty,
        correlation_id = tracing::field::Empty,
    );

    async move {
        let outcome = match codec::decode(&delivery.body) {
            Ok(event) => {
                let span = tracing::Span::current();
                span.record("event_type", tracing::field::display(event.event_type()));
                if let Some(correlation_id) = event.correlation_id() {
                    span.record("correlation_id", correlation_id.as_str());
                }
                match invoke(&ctx, event).await {
                    Ok(()) => Outcome::Ack,
                    Err(reason) => {
                        bump(&ctx.stats.handler_failures);
                        Outcome::Failed(reason)
                    }
                }
            }
            Err(err) if err.is_unknown_type() => {
                bump(&ctx.stats.dropped_unknown);
                warn!(error = %err, "dropping event of unknown type");
                Outcome::Ack
            }
            Err(err) => {
                bump(&ctx.stats.decode_failures);
                warn!(error = %err, "undecodable delivery");
                Outcome::Failed(err.to_string())
            }
        };

        match outcome {
            Outcome::Ack => settle(&ctx, delivery.tag, Settlement::Ack).await,
            Outcome::Failed(reason) => fail(&ctx, delivery, retry_count, &reason, &retry_tx).await,
        }
    }
    .instrument(span)
    .await
}

/// Run the handler in its own task so a panic or timeout is contained.
async fn invoke(ctx: &LoopContext, event: Event) -> Result<(), String> {
    let handler = ctx.handler.clone();
    let mut task = tokio::spawn(async move { handler.handle(&event).await }.in_current_span());

    let joined = match ctx.handler_timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                task.abort();
                return Err(format!("handler timed out after {limit:?}"));
            }
        },
        None => task.await,
    };

    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(err) if err.is_panic() => Err("handler panicked".to_string()),
        Err(err) => Err(format!("handler task cancelled: {err}")),
    }
}

async fn fail(
    ctx: &LoopContext,
    delivery: Delivery,
    retry_count: u32,
    reason: &str,
    retry_tx: &mpsc::UnboundedSender<ScheduledRetry>,
) {
    match ctx.retry.decide(retry_count) {
        RetryDecision::Retry { attempt, delay } => {
            let job = ScheduledRetry {
                attempt,
                delay,
                message: OutboundMessage {
                    body: delivery.body,
                    properties: with_retry_count(delivery.properties, attempt),
                },
            };
            if retry_tx.send(job).is_err() {
                error!(reason, "cannot schedule retry, returning delivery to the queue");
                settle(ctx, delivery.tag, Settlement::Requeue).await;
                return;
            }
            bump(&ctx.stats.retried);
            warn!(
                reason,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "handler failed, retry scheduled"
            );
            settle(ctx, delivery.tag, Settlement::Ack).await;
        }
        RetryDecision::DeadLetter => {
            warn!(
                reason,
                max_retries = ctx.retry.max_retries,
                "retries exhausted, dead-lettering"
            );
            settle(ctx, delivery.tag, Settlement::DeadLetter).await;
        }
    }
}

fn with_retry_count(mut properties: MessageProperties, attempt: u32) -> MessageProperties {
    properties
        .headers
        .insert(RETRY_COUNT_HEADER.to_string(), FieldValue::Int(i64::from(attempt)));
    properties
}

async fn settle(ctx: &LoopContext, tag: DeliveryTag, settlement: Settlement) {
    let result = match settlement {
        Settlement::Ack => ctx.channel.ack(tag).await,
        Settlement::DeadLetter => ctx.channel.reject(tag, false).await,
        Settlement::Requeue => ctx.channel.reject(tag, true).await,
    };

    match result {
        Ok(()) => {
            match settlement {
                Settlement::Ack => bump(&ctx.stats.acked),
                Settlement::DeadLetter => bump(&ctx.stats.dead_lettered),
                Settlement::Requeue => {}
            }
            debug!(delivery_tag = %tag, ?settlement, "delivery settled");
        }
        Err(err) => {
            bump(&ctx.stats.settle_failures);
            error!(delivery_tag = %tag, ?settlement, error = %err, "settlement failed");
        }
    }
}

/// Wait out the backoff, then send the copy straight back to the queue it
/// failed in through the default exchange.
///
/// Once `flush` turns true the consumer is stopping and the copy is sent
/// without waiting for the remaining delay.
async fn republish(
    ctx: Arc<LoopContext>,
    job: ScheduledRetry,
    mut flush: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = tokio::time::sleep(job.delay) => {}
        _ = flush.wait_for(|flush| *flush) => {
            debug!(attempt = job.attempt, "consumer stopping, publishing retry early");
        }
    }
    match ctx.channel.publish("", &ctx.queue, job.message).await {
        Ok(()) => debug!(attempt = job.attempt, "retry published"),
        Err(err) => {
            error!(attempt = job.attempt, error = %err, "retry publish failed, message lost");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Connector, InMemoryBroker, QueueSpec};
    use bookspace_events::{HandlerError, UserRegistered, handler_fn};
    use std::sync::atomic::AtomicUsize;

    async fn channel_with_queue(broker: &InMemoryBroker) -> ChannelHandle {
        let raw = broker.connect("memory://").await.unwrap();
        let channel = ChannelHandle::new(raw.channel);
        channel.declare_queue(&QueueSpec::durable("q")).await.unwrap();
        channel
    }

    fn body() -> Vec<u8> {
        codec::encode(&Event::new(UserRegistered {
            user_id: "u1".into(),
            email: "a@example.com".into(),
            display_name: "A".into(),
        }))
        .unwrap()
    }

    fn publish(broker: &InMemoryBroker) {
        broker
            .publish_raw(
                "",
                "q",
                OutboundMessage {
                    body: body(),
                    properties: MessageProperties::default(),
                },
            )
            .unwrap();
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn retry_count_header_is_set() {
        let props = with_retry_count(MessageProperties::default(), 2);
        assert_eq!(props.headers.get(RETRY_COUNT_HEADER), Some(&FieldValue::Int(2)));
    }

    #[tokio::test]
    async fn successful_handler_acks() {
        let broker = InMemoryBroker::new();
        let channel = channel_with_queue(&broker).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let handler = handler_fn(move |_event: Event| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        });

        let handle = Consumer::new(channel.clone(), ConsumerSettings::default())
            .subscribe("q", handler)
            .await
            .unwrap();
        publish(&broker);

        wait_for(|| handle.stats().acked == 1).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.unacked_count("q"), 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn panicking_handler_is_a_failure() {
        let broker = InMemoryBroker::new();
        let channel = channel_with_queue(&broker).await;
        let handler = handler_fn(|_event: Event| async move {
            if true {
                panic!("boom");
            }
            Ok::<(), HandlerError>(())
        });

        let settings = ConsumerSettings::default()
            .with_retry(RetryPolicy::new(0, Duration::from_millis(1)));
        let handle = Consumer::new(channel, settings)
            .subscribe("q", handler)
            .await
            .unwrap();
        publish(&broker);

        wait_for(|| handle.stats().dead_lettered == 1).await;
        assert_eq!(handle.stats().handler_failures, 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let broker = InMemoryBroker::new();
        let channel = channel_with_queue(&broker).await;
        let handler = handler_fn(|_event: Event| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<(), HandlerError>(())
        });

        let settings = ConsumerSettings::default()
            .with_retry(RetryPolicy::new(0, Duration::from_millis(1)))
            .with_handler_timeout(Duration::from_millis(20));
        let handle = Consumer::new(channel, settings)
            .subscribe("q", handler)
            .await
            .unwrap();
        publish(&broker);

        wait_for(|| handle.stats().dead_lettered == 1).await;
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn subscribing_on_a_closed_channel_fails() {
        let broker = InMemoryBroker::new();
        let channel = channel_with_queue(&broker).await;
        channel.close().await.unwrap();

        let handler = handler_fn(|_event: Event| async move { Ok::<(), HandlerError>(()) });
        let err = Consumer::new(channel, ConsumerSettings::default())
            .subscribe("q", handler)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NotConnected));
    }

    #[tokio::test]
    async fn subscribing_to_a_missing_queue_fails() {
        let broker = InMemoryBroker::new();
        let channel = channel_with_queue(&broker).await;
        let handler = handler_fn(|_event: Event| async move { Ok::<(), HandlerError>(()) });
        let err = Consumer::new(channel, ConsumerSettings::default())
            .subscribe("missing", handler)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Subscribe { .. }));
    }

    #[tokio::test]
    async fn shutdown_cancels_the_consumer() {
        let broker = InMemoryBroker::new();
        let channel = channel_with_queue(&broker).await;
        let handler = handler_fn(|_event: Event| async move { Ok::<(), HandlerError>(()) });
        let handle = Consumer::new(channel, ConsumerSettings::default())
            .subscribe("q", handler)
            .await
            .unwrap();
        assert_eq!(broker.consumer_count("q"), 1);

        handle.shutdown().await;
        assert_eq!(broker.consumer_count("q"), 0);
    }
}
