//! paddockd: headless telemetry daemon.
//!
//! Binds the OutGauge UDP port, runs the pipeline, appends frames and
//! session summaries to the data directory, and serves live observer
//! subscriptions to whatever boundary layer embeds the hub.

use anyhow::{Context, Result};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use paddock_ingest::{OutGaugeConfig, OutGaugeSource, TelemetrySource};
use paddock_io::NdjsonSink;
use paddock_pipeline::{OwnerOnly, Pipeline, PipelineConfig, SingleOwner};

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let port: u16 = env_or("UDP_PORT", 4444);
    let data_dir: String = env_or("DATA_DIR", "data".to_string());
    let owner: String = env_or("OWNER", "local".to_string());
    let cfg = PipelineConfig {
        activity_threshold_mps: env_or("ACTIVITY_THRESHOLD_MPS", 0.5),
        inactivity_timeout: Duration::from_secs(env_or("INACTIVITY_TIMEOUT_S", 30)),
        idle_extends_session: env_or("IDLE_EXTENDS_SESSION", false),
        live_buffer_capacity: env_or("LIVE_BUFFER_CAPACITY", 64),
        persist_buffer_capacity: env_or("PERSIST_BUFFER_CAPACITY", 1024),
        observer_queue_capacity: env_or("OBSERVER_QUEUE_CAPACITY", 64),
        ..PipelineConfig::default()
    };

    let sink = Arc::new(NdjsonSink::create(&data_dir)?);
    let handle = Pipeline::spawn(
        cfg,
        Arc::new(SingleOwner(owner.clone())),
        Arc::new(OwnerOnly),
        sink.clone(),
    );

    let source = OutGaugeSource::new(OutGaugeConfig {
        bind_addr: format!("0.0.0.0:{port}"),
    });
    let sample_tx = handle.sample_tx.clone();
    let listener = tokio::spawn(async move {
        if let Err(err) = source.run(sample_tx).await {
            error!(%err, "UDP listener failed");
        }
    });

    info!(port, %owner, data_dir, "paddockd running, ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;

    info!("shutting down: draining open sessions");
    listener.abort();
    let _ = listener.await;
    handle.shutdown().await;
    sink.close()?;
    Ok(())
}
