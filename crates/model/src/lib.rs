use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Logical owner of a telemetry source. In the minimal deployment every
/// source maps to one configured owner; a token-based mapping can replace
/// that without touching the pipeline.
pub type OwnerId = String;

/// Authenticated caller identity, as handed over by the boundary layer.
pub type Identity = String;

pub type SessionId = Uuid;

/// One decoded telemetry reading. Timestamp is stamped on receipt, never
/// taken from the packet. Immutable after decode; shared via `Arc`.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct TelemetrySample {
    pub source: SocketAddr,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub speed_mps: f32,
    pub rpm: f32,
    /// -1 = reverse, 0 = neutral, 1.. = forward gears.
    pub gear: i8,
    pub g_force_x: f32,
    pub g_force_y: f32,
    pub throttle: Option<f32>,
    pub brake: Option<f32>,
    pub fuel: Option<f32>,
}

/// Incrementally aggregated statistics for one session.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct SessionStats {
    pub samples: u64,
    pub top_speed_mps: f32,
    pub mean_speed_mps: f32,
    pub speed_stddev_mps: f32,
    pub max_rpm: f32,
    /// Peak combined lateral/longitudinal g magnitude.
    pub peak_g: f32,
}

/// A closed session. Immutable once produced; never reopened.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct SessionSummary {
    #[serde(with = "uuid::serde::simple")]
    pub id: SessionId,
    pub owner: OwnerId,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end_time: OffsetDateTime,
    pub duration_s: f64,
    /// Number of frames recorded while the session was active.
    pub frame_count: u64,
    pub stats: SessionStats,
}

impl SessionSummary {
    pub fn duration(&self) -> time::Duration {
        self.end_time - self.start_time
    }
}
