//! Task assembly: ingestion worker, inactivity sweep, persistence
//! consumer, and observer dispatch, connected by the delivery buffer.
//!
//! All tasks are cooperatively scheduled and never block; the only shared
//! mutable state is the tracker mutex and the buffer's internal queues.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, trace, warn};

use analytics::SessionAccumulator;
use model::{SessionId, SessionSummary};
use paddock_ingest::{sample_channel, SampleRx, SampleTx};

use crate::broadcast::ObserverHub;
use crate::buffer::{DeliveryBuffer, Subscription};
use crate::session::SessionTracker;
use crate::{
    AuthorizationCheck, IdentityResolver, PersistenceSink, PipelineConfig, PipelineEvent,
};

pub struct Pipeline;

impl Pipeline {
    pub fn spawn(
        cfg: PipelineConfig,
        resolver: Arc<dyn IdentityResolver>,
        auth: Arc<dyn AuthorizationCheck>,
        sink: Arc<dyn PersistenceSink>,
    ) -> PipelineHandle {
        let (sample_tx, sample_rx) = sample_channel(cfg.ingest_channel_capacity);
        let buffer = Arc::new(DeliveryBuffer::new());
        let tracker = Arc::new(Mutex::new(SessionTracker::new(cfg.session_config(), resolver)));
        let hub = ObserverHub::new(auth, cfg.observer_queue_capacity);

        let hub_events = buffer.subscribe(cfg.live_buffer_capacity);
        let persist_events = buffer.subscribe(cfg.persist_buffer_capacity);

        let (stop, stop_rx) = watch::channel(false);
        let producer_tasks = vec![
            tokio::spawn(ingest_loop(
                sample_rx,
                tracker.clone(),
                buffer.clone(),
                stop_rx.clone(),
            )),
            tokio::spawn(sweep_loop(
                cfg.sweep_interval,
                tracker.clone(),
                buffer.clone(),
                stop_rx,
            )),
        ];
        let consumer_tasks = vec![
            tokio::spawn(persist_loop(persist_events, sink)),
            tokio::spawn(hub.clone().run(hub_events)),
        ];

        PipelineHandle {
            sample_tx,
            hub,
            buffer,
            tracker,
            stop,
            producer_tasks,
            consumer_tasks,
        }
    }
}

pub struct PipelineHandle {
    /// Feed for decoded samples; the UDP source holds a clone.
    pub sample_tx: SampleTx,
    pub hub: Arc<ObserverHub>,
    buffer: Arc<DeliveryBuffer<PipelineEvent>>,
    tracker: Arc<Mutex<SessionTracker>>,
    stop: watch::Sender<bool>,
    producer_tasks: Vec<JoinHandle<()>>,
    consumer_tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Graceful teardown: stop the producing tasks, close every open
    /// session as a forced inactivity closure, then let the consumers
    /// drain their queues through the in-band `Shutdown` event.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        for task in self.producer_tasks {
            if let Err(err) = task.await {
                warn!(%err, "pipeline producer task failed");
            }
        }
        let ended = self.tracker.lock().close_all();
        for end in ended {
            self.buffer.publish(PipelineEvent::SessionClosed(Arc::new(end)));
        }
        self.buffer.publish(PipelineEvent::Shutdown);
        for task in self.consumer_tasks {
            if let Err(err) = task.await {
                warn!(%err, "pipeline consumer task failed");
            }
        }
        info!("pipeline stopped");
    }
}

async fn ingest_loop(
    mut rx: SampleRx,
    tracker: Arc<Mutex<SessionTracker>>,
    buffer: Arc<DeliveryBuffer<PipelineEvent>>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            maybe = rx.recv() => {
                let Some(sample) = maybe else { break };
                let outcome = tracker.lock().process(&sample, Instant::now());
                if let Some(end) = outcome.closed {
                    buffer.publish(PipelineEvent::SessionClosed(Arc::new(end)));
                }
                trace!(source = %sample.source, speed = sample.speed_mps,
                    session = ?outcome.session_id, "frame");
                buffer.publish(PipelineEvent::Frame {
                    sample,
                    owner: outcome.owner,
                    session_id: outcome.session_id,
                });
            }
        }
    }
}

async fn sweep_loop(
    interval: std::time::Duration,
    tracker: Arc<Mutex<SessionTracker>>,
    buffer: Arc<DeliveryBuffer<PipelineEvent>>,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                let ended = tracker.lock().sweep(Instant::now());
                for end in ended {
                    buffer.publish(PipelineEvent::SessionClosed(Arc::new(end)));
                }
            }
        }
    }
}

/// Session statistics are accumulated here, from exactly the frames the
/// sink accepts. A frame evicted under backpressure or refused by the
/// sink never reaches the accumulator, so a summary always agrees with
/// a recompute over the persisted frame set. Queue order guarantees the
/// `SessionClosed` marker arrives after every surviving frame of its
/// session.
async fn persist_loop(mut events: Subscription<PipelineEvent>, sink: Arc<dyn PersistenceSink>) {
    let mut live: HashMap<SessionId, SessionAccumulator> = HashMap::new();
    while let Some(event) = events.recv().await {
        match event {
            PipelineEvent::Frame { sample, session_id: Some(id), .. } => {
                match sink.persist_frame(&sample, id).await {
                    Ok(()) => {
                        if let Err(err) = live.entry(id).or_default().update(&sample) {
                            error!(session = %id, %err, "sample fed to finalized accumulator");
                        }
                    }
                    Err(err) => warn!(%err, session = %id, "frame persistence failed"),
                }
            }
            // idle telemetry outside a session: live visibility only
            PipelineEvent::Frame { .. } => {}
            PipelineEvent::SessionClosed(end) => {
                // a session whose every frame was dropped still gets a
                // summary, with zeroed stats
                let mut acc = live.remove(&end.id).unwrap_or_default();
                let summary = match acc.finalize() {
                    Ok(stats) => SessionSummary {
                        id: end.id,
                        owner: end.owner.clone(),
                        start_time: end.start_time,
                        end_time: end.end_time,
                        duration_s: (end.end_time - end.start_time).as_seconds_f64(),
                        frame_count: stats.samples,
                        stats,
                    },
                    Err(err) => {
                        error!(session = %end.id, %err, "accumulator finalized twice");
                        continue;
                    }
                };
                info!(session = %summary.id, owner = %summary.owner,
                    frames = summary.frame_count, duration_s = summary.duration_s,
                    "session closed");
                if let Err(err) = sink.persist_session(&summary).await {
                    warn!(%err, session = %summary.id, "session persistence failed");
                }
            }
            PipelineEvent::Shutdown => break,
        }
    }
}
