use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use bookspace_infra::broker::{AmqpConnector, ConnectionEvent, redact_url};
use bookspace_infra::{BusConfig, EventBus};
use bookspace_worker::app::{Collaborators, Worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bookspace_observability::init();

    let config = BusConfig::from_env().context("invalid bus configuration")?;
    info!(url = %redact_url(&config.url), namespace = %config.namespace, "starting worker");

    let bus = EventBus::connect(&AmqpConnector::new(), config)
        .await
        .context("cannot start event bus")?;
    let mut events = bus.connection_events().await?;
    let worker = Worker::start(&bus, &Collaborators::logging())
        .await
        .context("cannot start consumers")?;

    // The bus does not reconnect; on connection loss exit non-zero and let
    // the supervisor restart the process.
    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("cannot listen for ctrl-c")?;
            info!("shutdown requested");
            Ok(())
        }
        lost = connection_lost(&mut events) => {
            Err(anyhow::anyhow!("broker connection lost: {lost}"))
        }
    };

    worker.shutdown().await;
    if let Err(err) = bus.close().await {
        warn!(error = %err, "closing bus");
    }
    if let Err(err) = &outcome {
        error!(error = %err, "worker exiting");
    }
    outcome
}

async fn connection_lost(events: &mut tokio::sync::broadcast::Receiver<ConnectionEvent>) -> String {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::ConnectionError { message })
            | Ok(ConnectionEvent::ChannelError { message }) => return message,
            Ok(ConnectionEvent::Closed { reason }) => return reason,
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed connection events"),
            Err(RecvError::Closed) => return "event feed closed".to_string(),
        }
    }
}
