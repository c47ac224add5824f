//! Per-source session lifecycle.
//!
//! Each source is IDLE (no open session) or ACTIVE (exactly one open
//! session). A qualifying sample while IDLE opens a session; an
//! inactivity window with no qualifying sample closes it. Closed sessions
//! are immutable; a new burst of activity opens a fresh one.
//!
//! All mutation funnels through [`SessionTracker`], which owns the source
//! registry outright. The per-packet path and the periodic sweep
//! serialize on the mutex wrapping the tracker, so a sweep can never
//! observe a half-applied transition. Timeout decisions use monotonic
//! receipt instants; wall-clock timestamps are only recorded, never
//! compared.

use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use model::{OwnerId, SessionId, TelemetrySample};

use crate::registry::SourceRegistry;
use crate::IdentityResolver;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub activity_threshold_mps: f32,
    pub inactivity_timeout: Duration,
    pub idle_extends_session: bool,
}

pub struct ActiveSession {
    pub id: SessionId,
    pub start_time: OffsetDateTime,
    /// Timestamp of the most recent sample recorded into the session;
    /// becomes `end_time` at closure (never the sweep's wall clock).
    pub last_sample_time: OffsetDateTime,
    /// Monotonic instant of the last timer-resetting sample.
    pub last_activity: Instant,
}

impl ActiveSession {
    fn open(sample: &TelemetrySample, now: Instant) -> Self {
        Self {
            id: Uuid::new_v4(),
            start_time: sample.timestamp,
            last_sample_time: sample.timestamp,
            last_activity: now,
        }
    }
}

/// Lifecycle record of a session that just ended. The tracker only owns
/// timing and identity; statistics are derived downstream from the
/// frames that actually reach durable storage, so a summary can never
/// claim frames the sink discarded.
#[derive(Clone, Debug)]
pub struct SessionEnd {
    pub id: SessionId,
    pub owner: OwnerId,
    pub start_time: OffsetDateTime,
    pub end_time: OffsetDateTime,
}

/// What the ingestion path needs to know after one sample.
pub struct ProcessOutcome {
    pub owner: OwnerId,
    /// Session the sample was recorded into, if any.
    pub session_id: Option<SessionId>,
    /// A session closed by gap detection before this sample was applied.
    pub closed: Option<SessionEnd>,
}

pub struct SessionTracker {
    cfg: SessionConfig,
    registry: SourceRegistry,
    resolver: std::sync::Arc<dyn IdentityResolver>,
}

impl SessionTracker {
    pub fn new(cfg: SessionConfig, resolver: std::sync::Arc<dyn IdentityResolver>) -> Self {
        Self {
            cfg,
            registry: SourceRegistry::new(),
            resolver,
        }
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Applies one decoded sample. Malformed packets never get this far;
    /// decode rejections are counted upstream and cannot advance or close
    /// a session.
    pub fn process(&mut self, sample: &TelemetrySample, now: Instant) -> ProcessOutcome {
        let cfg = self.cfg.clone();
        let entry = self.registry.entry_mut(sample.source, self.resolver.as_ref());

        // Gap detection: the sweep normally fires first, but a source that
        // reappears after a long silence must not extend its stale session.
        let mut closed = None;
        if let Some(active) = entry.active.take() {
            if now.duration_since(active.last_activity) > cfg.inactivity_timeout {
                closed = Some(close_session(&entry.owner, active));
            } else {
                entry.active = Some(active);
            }
        }

        let moving = sample.speed_mps > cfg.activity_threshold_mps;
        if entry.active.is_none() && moving {
            let opened = ActiveSession::open(sample, now);
            info!(session = %opened.id, owner = %entry.owner, source = %sample.source,
                "session opened");
            entry.active = Some(opened);
        }

        let session_id = match entry.active.as_mut() {
            Some(active) => {
                active.last_sample_time = sample.timestamp;
                if moving || cfg.idle_extends_session {
                    active.last_activity = now;
                }
                Some(active.id)
            }
            // Idle telemetry is still forwarded downstream for debug
            // visibility; it just belongs to no session.
            None => None,
        };

        ProcessOutcome {
            owner: entry.owner.clone(),
            session_id,
            closed,
        }
    }

    /// Periodic inactivity sweep, run on its own interval distinct from
    /// the per-packet path. Only acts on sources whose last activity
    /// already exceeds the timeout; closing is idempotent because the
    /// active slot is taken exactly once.
    pub fn sweep(&mut self, now: Instant) -> Vec<SessionEnd> {
        let timeout = self.cfg.inactivity_timeout;
        let mut ended = Vec::new();
        for (_, entry) in self.registry.iter_mut() {
            let expired = entry
                .active
                .as_ref()
                .map(|a| now.duration_since(a.last_activity) > timeout)
                .unwrap_or(false);
            if expired {
                if let Some(active) = entry.active.take() {
                    ended.push(close_session(&entry.owner, active));
                }
            }
        }
        ended
    }

    /// Shutdown drain: every open session is closed as if its inactivity
    /// timeout had fired, with `end_time` at its last sample.
    pub fn close_all(&mut self) -> Vec<SessionEnd> {
        let mut ended = Vec::new();
        for (_, entry) in self.registry.iter_mut() {
            if let Some(active) = entry.active.take() {
                ended.push(close_session(&entry.owner, active));
            }
        }
        ended
    }
}

fn close_session(owner: &OwnerId, active: ActiveSession) -> SessionEnd {
    let end = SessionEnd {
        id: active.id,
        owner: owner.clone(),
        start_time: active.start_time,
        end_time: active.last_sample_time,
    };
    info!(session = %end.id, owner = %end.owner, "session ended");
    end
}
