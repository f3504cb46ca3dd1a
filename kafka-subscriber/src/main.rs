use anyhow::{Context, Result};
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kafka_subscriber::{Record, Subscriber, SubscriberConfig};

async fn log_record(record: Record) {
    info!(
        topic = record.topic,
        partition = record.partition,
        offset = record.offset,
        payload_bytes = record.payload.as_ref().map_or(0, Vec::len),
        "received record"
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting kafka subscriber");

    let config = SubscriberConfig::init_from_env()
        .context("Failed to load configuration from environment variables")?;
    info!("Configuration loaded: {:?}", config);

    let subscriber = Subscriber::new(config, log_record)
        .context("Failed to create subscriber. Check your Kafka connection settings.")?;

    let shutdown = CancellationToken::new();
    let mut errors = subscriber.subscribe(shutdown.clone());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received ctrl-c, shutting down");
                break;
            }
            received = errors.recv() => match received {
                Some(e) if e.is_fatal() => error!("fatal consumer error: {e}"),
                Some(e) => warn!("consumer error: {e}"),
                None => {
                    info!("poll loop finished");
                    break;
                }
            },
        }
    }

    shutdown.cancel();
    subscriber
        .unsubscribe()
        .await
        .context("Failed to unsubscribe")?;

    info!("kafka subscriber stopped");
    Ok(())
}
