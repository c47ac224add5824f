//! The telemetry pipeline core: source registry, session state machine,
//! bounded fan-out delivery buffer, authorized live broadcast, and the
//! task assembly connecting them.
//!
//! External collaborators (identity resolution, authorization, durable
//! storage) are traits; the pipeline never talks to a database or a
//! credential store directly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use model::{Identity, OwnerId, SessionId, SessionSummary, TelemetrySample};

pub mod broadcast;
pub mod buffer;
pub mod registry;
pub mod session;
pub mod worker;

pub use broadcast::{ObserverHub, ObserverStream, StreamMessage};
pub use buffer::{DeliveryBuffer, Droppable, Subscription};
pub use registry::SourceRegistry;
pub use session::{ProcessOutcome, SessionConfig, SessionEnd, SessionTracker};
pub use worker::{Pipeline, PipelineHandle};

/// One event flowing through the delivery buffer. Teardown is an in-band
/// variant so it traverses the same queues as the data it terminates.
#[derive(Clone, Debug)]
pub enum PipelineEvent {
    Frame {
        sample: Arc<TelemetrySample>,
        owner: OwnerId,
        /// `None` for idle telemetry recorded outside any session.
        session_id: Option<SessionId>,
    },
    /// Lifecycle marker only; the summary is built by the persistence
    /// consumer from the frames that actually landed.
    SessionClosed(Arc<SessionEnd>),
    Shutdown,
}

impl Droppable for PipelineEvent {
    fn droppable(&self) -> bool {
        matches!(self, PipelineEvent::Frame { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("identity {identity:?} is not authorized for owner {owner:?}")]
    Unauthorized { identity: Identity, owner: OwnerId },
}

/// Maps a network origin to its logical owner. Resolution by address is a
/// known limitation (NAT/shared-IP ambiguity); this seam exists so a
/// token-based mapping can replace it later.
pub trait IdentityResolver: Send + Sync {
    fn owner_for(&self, source: SocketAddr) -> OwnerId;
}

/// Minimal deployment: every source belongs to one configured owner.
pub struct SingleOwner(pub OwnerId);

impl IdentityResolver for SingleOwner {
    fn owner_for(&self, _source: SocketAddr) -> OwnerId {
        self.0.clone()
    }
}

/// Checked once per observer connection, at subscribe time. Credential
/// expiry mid-connection is handled by the boundary layer, not here.
pub trait AuthorizationCheck: Send + Sync {
    fn allows(&self, identity: &Identity, owner: &OwnerId) -> bool;
}

/// Allows an identity to watch exactly its own sources.
pub struct OwnerOnly;

impl AuthorizationCheck for OwnerOnly {
    fn allows(&self, identity: &Identity, owner: &OwnerId) -> bool {
        identity == owner
    }
}

/// Durable storage boundary. Implementations must tolerate being called
/// from the persistence task only; errors are logged and isolated.
#[async_trait::async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn persist_frame(&self, sample: &TelemetrySample, session: SessionId) -> anyhow::Result<()>;
    async fn persist_session(&self, summary: &SessionSummary) -> anyhow::Result<()>;
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Minimum speed (m/s) considered "driving" for session opening.
    pub activity_threshold_mps: f32,
    /// Open sessions close after this long without qualifying activity.
    pub inactivity_timeout: Duration,
    /// Whether sub-threshold samples keep an active session alive. Off by
    /// default: an idling car times out even while packets keep coming.
    pub idle_extends_session: bool,
    pub sweep_interval: Duration,
    pub ingest_channel_capacity: usize,
    /// Per-observer-facing buffer; small, freshness over completeness.
    pub live_buffer_capacity: usize,
    /// Persistence consumer buffer; larger, drops should be rare.
    pub persist_buffer_capacity: usize,
    pub observer_queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            activity_threshold_mps: 0.5,
            inactivity_timeout: Duration::from_secs(30),
            idle_extends_session: false,
            sweep_interval: Duration::from_secs(1),
            ingest_channel_capacity: 256,
            live_buffer_capacity: 64,
            persist_buffer_capacity: 1024,
            observer_queue_capacity: 64,
        }
    }
}

impl PipelineConfig {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            activity_threshold_mps: self.activity_threshold_mps,
            inactivity_timeout: self.inactivity_timeout,
            idle_extends_session: self.idle_extends_session,
        }
    }
}
