//! Telemetry ingestion: the OutGauge decoder and the live UDP source.

use anyhow::Context;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use model::TelemetrySample;

pub mod outgauge;

pub use outgauge::{decode, DecodeError, Reading, OUTGAUGE_PACKET_LEN};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("{0}")]
    Msg(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type SampleTx = mpsc::Sender<Arc<TelemetrySample>>;
pub type SampleRx = mpsc::Receiver<Arc<TelemetrySample>>;

pub fn sample_channel(capacity: usize) -> (SampleTx, SampleRx) {
    mpsc::channel(capacity)
}

/// Trait for any live source connector.
#[async_trait::async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn run(&self, tx: SampleTx) -> Result<(), IngestError>;
}

#[derive(Clone, Debug)]
pub struct OutGaugeConfig {
    /// Local bind address, e.g. "0.0.0.0:4444" (BeamNG's OutGauge default).
    pub bind_addr: String,
}

impl Default for OutGaugeConfig {
    fn default() -> Self {
        Self { bind_addr: "0.0.0.0:4444".into() }
    }
}

pub struct OutGaugeSource {
    cfg: OutGaugeConfig,
}

impl OutGaugeSource {
    pub fn new(cfg: OutGaugeConfig) -> Self {
        Self { cfg }
    }
}

// Log rejected packets at a throttled cadence; a misconfigured emitter can
// spray thousands per second.
const REJECT_LOG_EVERY: u64 = 100;

#[async_trait::async_trait]
impl TelemetrySource for OutGaugeSource {
    async fn run(&self, tx: SampleTx) -> Result<(), IngestError> {
        let socket = UdpSocket::bind(&self.cfg.bind_addr)
            .await
            .with_context(|| format!("bind {}", self.cfg.bind_addr))?;
        info!(addr = %self.cfg.bind_addr, "OutGauge listener bound, waiting for packets");

        let mut buf = vec![0u8; 512];
        let mut accepted: u64 = 0;
        let mut rejected: u64 = 0;
        let mut dropped: u64 = 0;
        loop {
            let (len, peer) = socket.recv_from(&mut buf).await?;
            match decode(&buf[..len]) {
                Ok(reading) => {
                    let sample = Arc::new(TelemetrySample {
                        source: peer,
                        timestamp: OffsetDateTime::now_utc(),
                        speed_mps: reading.speed_mps,
                        rpm: reading.rpm,
                        gear: reading.gear,
                        g_force_x: reading.g_force_x,
                        g_force_y: reading.g_force_y,
                        throttle: Some(reading.throttle),
                        brake: Some(reading.brake),
                        fuel: Some(reading.fuel),
                    });
                    accepted += 1;
                    if accepted % 1000 == 0 {
                        debug!(accepted, rejected, dropped, %peer, "ingest counters");
                    }
                    match tx.try_send(sample) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            // The producer must never block on a slow
                            // pipeline; blocking here starves the socket.
                            dropped += 1;
                            if dropped % REJECT_LOG_EVERY == 1 {
                                warn!(dropped, "pipeline channel full, dropping sample");
                            }
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            info!("pipeline closed, stopping listener");
                            return Ok(());
                        }
                    }
                }
                Err(DecodeError::MotionSim) => {
                    trace!(%peer, "ignoring MotionSim packet");
                }
                Err(err) => {
                    rejected += 1;
                    if rejected % REJECT_LOG_EVERY == 1 {
                        warn!(%peer, rejected, %err, "rejected packet");
                    }
                }
            }
        }
    }
}
