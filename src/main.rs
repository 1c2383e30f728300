//! Frame ingestion service

use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tracing::{error, info};

use frame_ingest::capture::{Frame, Value, FRAME_NUMBER_KEY, IMAGE_HANDLE_KEY};
use frame_ingest::pipeline::QueueClient;
use frame_ingest::{Ingestor, IngestorConfig};

const DEFAULT_CONFIG: &str = "config/ingestor.toml";

fn describe(frame: &Frame) -> String {
    let tag = frame
        .meta()
        .get(FRAME_NUMBER_KEY)
        .and_then(Value::as_i64)
        .map(|n| format!("#{}", n))
        .or_else(|| frame.meta().get(IMAGE_HANDLE_KEY).and_then(Value::as_str).map(String::from))
        .unwrap_or_default();
    format!("{} {}x{}x{} ({} bytes)", tag, frame.width(), frame.height(), frame.channels(), frame.data().len())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter("frame_ingest=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Frame ingestor launching...");

    let path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = IngestorConfig::load(&path).map_err(|e| eyre!("Failed to load {}: {}", path, e))?;
    info!("Loaded configuration from {}", path);

    let (tx, rx) = flume::bounded::<Frame>(config.queue_size);
    let client = QueueClient::from_sender(tx);
    let stats_client = client.clone();

    let mut ingestor = Ingestor::build(config, client)?;
    ingestor.start()?;

    // Stand-in for the downstream worker pool
    let consumer = tokio::spawn(async move {
        while let Ok(frame) = rx.recv_async().await {
            let latency = frame.timestamp().elapsed();
            metrics::histogram!("frame_latency_ms").record(latency.as_secs_f64() * 1000.0);
            info!("Received frame {} after {:?}", describe(&frame), latency);
        }
    });

    let stats = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            info!("Queue stats: {:?}", stats_client.stats());
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    tokio::task::spawn_blocking(move || ingestor.stop())
        .await?
        .map_err(|e| eyre!("Failed to stop ingestor: {}", e))?;

    stats.abort();
    consumer.abort();
    if let Err(e) = consumer.await {
        if !e.is_cancelled() {
            error!("Consumer task failed: {}", e);
        }
    }

    Ok(())
}
