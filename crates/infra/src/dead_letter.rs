//! Dead-letter queue depth monitoring.
//!
//! Dead-lettering is silent; this is the operator-facing signal. Every poll
//! that finds messages logs at `warn`. The monitor only reads the queue
//! depth, it never consumes.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::broker::{ChannelHandle, TransportError};

const UNOBSERVED: i64 = -1;

#[derive(Debug, Clone)]
pub struct DeadLetterMonitor {
    channel: ChannelHandle,
    queue: String,
    interval: Duration,
}

impl DeadLetterMonitor {
    pub fn new(channel: ChannelHandle, queue: impl Into<String>, interval: Duration) -> Self {
        Self {
            channel,
            queue: queue.into(),
            interval,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Current number of dead-lettered messages waiting in the queue.
    pub async fn depth(&self) -> Result<u32, TransportError> {
        self.channel.queue_depth(&self.queue).await
    }

    /// Poll in the background until the handle is shut down or dropped.
    pub fn spawn(self) -> DeadLetterMonitorHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let last = Arc::new(AtomicI64::new(UNOBSERVED));
        let observed = last.clone();
        let span = info_span!("dead_letter_monitor", queue = %self.queue);

        let join = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(self.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = &mut shutdown_rx => break,
                        _ = ticker.tick() => self.poll(&observed).await,
                    }
                }
                debug!("dead-letter monitor stopped");
            }
            .instrument(span),
        );

        DeadLetterMonitorHandle {
            last_depth: last,
            shutdown: Some(shutdown_tx),
            join: Some(join),
        }
    }

    async fn poll(&self, last: &AtomicI64) {
        let depth = match self.depth().await {
            Ok(depth) => depth,
            Err(err) => {
                error!(error = %err, "cannot read dead-letter queue depth");
                return;
            }
        };

        let previous = last.swap(i64::from(depth), Ordering::Relaxed);
        if depth > 0 {
            let growing = i64::from(depth) > previous;
            warn!(
                depth,
                previous = previous.max(0),
                growing,
                "dead-letter queue holds messages"
            );
        } else if previous > 0 {
            info!("dead-letter queue drained");
        } else {
            debug!("dead-letter queue empty");
        }
    }
}

#[derive(Debug)]
pub struct DeadLetterMonitorHandle {
    last_depth: Arc<AtomicI64>,
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl DeadLetterMonitorHandle {
    /// Depth seen at the most recent successful poll.
    pub fn last_observed_depth(&self) -> Option<u32> {
        u32::try_from(self.last_depth.load(Ordering::Relaxed)).ok()
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex;

    use crate::broker::{Connector, InMemoryBroker, MessageProperties, OutboundMessage, QueueSpec};

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn lines(&self) -> Vec<String> {
            String::from_utf8_lossy(&self.0.lock().unwrap())
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn dead_letter(broker: &InMemoryBroker, count: usize) {
        for _ in 0..count {
            broker
                .publish_raw(
                    "",
                    "dlq",
                    OutboundMessage {
                        body: b"{}".to_vec(),
                        properties: MessageProperties::default(),
                    },
                )
                .unwrap();
        }
    }

    async fn monitor(broker: &InMemoryBroker) -> DeadLetterMonitor {
        let raw = broker.connect("memory://").await.unwrap();
        let channel = ChannelHandle::new(raw.channel);
        channel.declare_queue(&QueueSpec::durable("dlq")).await.unwrap();
        DeadLetterMonitor::new(channel, "dlq", Duration::from_millis(10))
    }

    #[tokio::test]
    async fn warns_on_every_poll_while_messages_remain() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let broker = InMemoryBroker::new();
        let monitor = monitor(&broker).await;
        let last = AtomicI64::new(UNOBSERVED);

        monitor.poll(&last).await;
        dead_letter(&broker, 2);
        monitor.poll(&last).await;
        monitor.poll(&last).await;
        broker.purge("dlq");
        monitor.poll(&last).await;

        let warnings: Vec<_> = logs
            .lines()
            .into_iter()
            .filter(|line| line.contains("WARN"))
            .collect();
        assert_eq!(warnings.len(), 2, "{warnings:?}");
        assert!(warnings[0].contains("growing=true"));
        assert!(warnings[1].contains("growing=false"));
        assert!(
            logs.lines()
                .iter()
                .any(|line| line.contains("INFO") && line.contains("drained"))
        );
    }

    #[tokio::test]
    async fn reports_depth_without_consuming() {
        let broker = InMemoryBroker::new();
        let monitor = monitor(&broker).await;
        dead_letter(&broker, 3);

        let handle = monitor.spawn();
        for _ in 0..100 {
            if handle.last_observed_depth().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(handle.last_observed_depth(), Some(3));
        assert_eq!(broker.ready_count("dlq"), 3);
        handle.shutdown().await;
    }
}
