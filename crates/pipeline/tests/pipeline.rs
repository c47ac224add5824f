//! End-to-end pipeline tests: decoded samples in, live stream and
//! persisted records out.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

use model::{OwnerId, SessionId, SessionSummary, TelemetrySample};
use paddock_pipeline::{
    AuthorizationCheck, IdentityResolver, OwnerOnly, PersistenceSink, Pipeline, PipelineConfig,
    SingleOwner, StreamMessage,
};

#[derive(Default)]
struct RecordingSink {
    frames: Mutex<Vec<(TelemetrySample, SessionId)>>,
    sessions: Mutex<Vec<SessionSummary>>,
}

#[async_trait::async_trait]
impl PersistenceSink for RecordingSink {
    async fn persist_frame(&self, sample: &TelemetrySample, session: SessionId) -> anyhow::Result<()> {
        self.frames.lock().push((sample.clone(), session));
        Ok(())
    }

    async fn persist_session(&self, summary: &SessionSummary) -> anyhow::Result<()> {
        self.sessions.lock().push(summary.clone());
        Ok(())
    }
}

fn sample(source: SocketAddr, speed: f32) -> Arc<TelemetrySample> {
    Arc::new(TelemetrySample {
        source,
        timestamp: OffsetDateTime::now_utc(),
        speed_mps: speed,
        rpm: speed * 120.0,
        gear: 3,
        g_force_x: 0.2,
        g_force_y: -0.1,
        throttle: Some(0.7),
        brake: Some(0.0),
        fuel: Some(0.5),
    })
}

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        activity_threshold_mps: 1.0,
        inactivity_timeout: Duration::from_millis(150),
        sweep_interval: Duration::from_millis(25),
        ..PipelineConfig::default()
    }
}

#[tokio::test]
async fn session_lifecycle_end_to_end() {
    let sink = Arc::new(RecordingSink::default());
    let handle = Pipeline::spawn(
        fast_config(),
        Arc::new(SingleOwner("driver".into())),
        Arc::new(OwnerOnly),
        sink.clone(),
    );
    let mut observer = handle.hub.subscribe("driver".into(), "driver".into()).unwrap();

    let src: SocketAddr = "172.16.0.2:4444".parse().unwrap();
    for speed in [0.0f32, 12.0, 15.0, 3.0] {
        handle.sample_tx.send(sample(src, speed)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // wait for the sweep to time the session out
    tokio::time::sleep(Duration::from_millis(400)).await;

    let sessions = sink.sessions.lock().clone();
    assert_eq!(sessions.len(), 1, "exactly one session closed");
    let summary = &sessions[0];
    assert_eq!(summary.owner, "driver");
    // the idle first sample is outside the session
    assert_eq!(summary.frame_count, 3);
    assert_eq!(summary.stats.top_speed_mps, 15.0);

    // the summary covers exactly the persisted frame set
    let frames = sink.frames.lock().clone();
    let session_frames: Vec<_> = frames
        .iter()
        .filter(|(_, id)| *id == summary.id)
        .map(|(s, _)| s.clone())
        .collect();
    assert_eq!(session_frames.len() as u64, summary.frame_count);
    let top = session_frames
        .iter()
        .map(|s| s.speed_mps)
        .fold(f32::NEG_INFINITY, f32::max);
    let mean = session_frames.iter().map(|s| s.speed_mps).sum::<f32>()
        / session_frames.len() as f32;
    assert_eq!(top, summary.stats.top_speed_mps);
    assert!((mean - summary.stats.mean_speed_mps).abs() < 1e-4);

    // the observer saw every frame for its owner, idle one included
    let mut live = Vec::new();
    for _ in 0..4 {
        match observer.recv().await {
            Some(StreamMessage::Sample(s)) => live.push(s.speed_mps),
            other => panic!("expected sample, got {other:?}"),
        }
    }
    assert_eq!(live, vec![0.0, 12.0, 15.0, 3.0]);

    handle.shutdown().await;
    // teardown reaches the observer in-band
    loop {
        match observer.recv().await {
            Some(StreamMessage::Closed) | None => break,
            Some(StreamMessage::Sample(_)) => {}
        }
    }
}

struct PortOwners;

impl IdentityResolver for PortOwners {
    fn owner_for(&self, source: SocketAddr) -> OwnerId {
        if source.port() == 1111 {
            "alice".into()
        } else {
            "bob".into()
        }
    }
}

#[tokio::test]
async fn observers_isolated_under_concurrent_sources() {
    let sink = Arc::new(RecordingSink::default());
    let handle = Pipeline::spawn(
        fast_config(),
        Arc::new(PortOwners),
        Arc::new(OwnerOnly),
        sink.clone(),
    );
    let mut alice = handle.hub.subscribe("alice".into(), "alice".into()).unwrap();

    let alice_src: SocketAddr = "10.0.0.1:1111".parse().unwrap();
    let bob_src: SocketAddr = "10.0.0.2:2222".parse().unwrap();

    let tx_a = handle.sample_tx.clone();
    let tx_b = handle.sample_tx.clone();
    let feed_a = tokio::spawn(async move {
        for i in 0..20 {
            tx_a.send(sample(alice_src, 10.0 + i as f32)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });
    let feed_b = tokio::spawn(async move {
        for i in 0..20 {
            tx_b.send(sample(bob_src, 100.0 + i as f32)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });
    feed_a.await.unwrap();
    feed_b.await.unwrap();
    handle.shutdown().await;

    let mut speeds = Vec::new();
    while let Some(msg) = alice.recv().await {
        match msg {
            StreamMessage::Sample(s) => {
                assert!(s.speed_mps < 100.0, "alice must never see bob's samples");
                assert_eq!(s.source, alice_src);
                speeds.push(s.speed_mps);
            }
            StreamMessage::Closed => break,
        }
    }
    // per-source order preserved end to end
    let mut sorted = speeds.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(speeds, sorted);
}

struct DenyAll;

impl AuthorizationCheck for DenyAll {
    fn allows(&self, _identity: &String, _owner: &String) -> bool {
        false
    }
}

#[tokio::test]
async fn unauthorized_observer_never_connects() {
    let sink = Arc::new(RecordingSink::default());
    let handle = Pipeline::spawn(
        fast_config(),
        Arc::new(SingleOwner("driver".into())),
        Arc::new(DenyAll),
        sink,
    );
    assert!(handle.hub.subscribe("driver".into(), "driver".into()).is_err());
    handle.shutdown().await;
}

/// Delays every frame write, so the persistence queue overflows and
/// evicts the oldest frames.
struct SlowSink {
    inner: RecordingSink,
    delay: Duration,
}

#[async_trait::async_trait]
impl PersistenceSink for SlowSink {
    async fn persist_frame(&self, sample: &TelemetrySample, session: SessionId) -> anyhow::Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.persist_frame(sample, session).await
    }

    async fn persist_session(&self, summary: &SessionSummary) -> anyhow::Result<()> {
        self.inner.persist_session(summary).await
    }
}

#[tokio::test]
async fn summary_matches_persisted_frames_under_backpressure() {
    let sink = Arc::new(SlowSink {
        inner: RecordingSink::default(),
        delay: Duration::from_millis(30),
    });
    let handle = Pipeline::spawn(
        PipelineConfig {
            activity_threshold_mps: 1.0,
            inactivity_timeout: Duration::from_secs(600),
            persist_buffer_capacity: 4,
            ..PipelineConfig::default()
        },
        Arc::new(SingleOwner("driver".into())),
        Arc::new(OwnerOnly),
        sink.clone(),
    );

    let src: SocketAddr = "172.16.0.4:4444".parse().unwrap();
    for i in 0..30 {
        handle.sample_tx.send(sample(src, 10.0 + i as f32)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.shutdown().await;

    let sessions = sink.inner.sessions.lock().clone();
    assert_eq!(sessions.len(), 1);
    let summary = &sessions[0];

    let frames = sink.inner.frames.lock().clone();
    let persisted: Vec<_> = frames
        .iter()
        .filter(|(_, id)| *id == summary.id)
        .map(|(s, _)| s.clone())
        .collect();
    assert!(!persisted.is_empty());
    assert!((persisted.len() as u64) < 30, "the slow sink must have lost frames");
    // the summary never claims frames the sink did not accept
    assert_eq!(summary.frame_count, persisted.len() as u64);
    assert_eq!(summary.stats.samples, persisted.len() as u64);

    // and its stats match a recompute over exactly the persisted set
    let top = persisted
        .iter()
        .map(|s| s.speed_mps)
        .fold(f32::NEG_INFINITY, f32::max);
    let mean = persisted.iter().map(|s| s.speed_mps).sum::<f32>() / persisted.len() as f32;
    assert_eq!(summary.stats.top_speed_mps, top);
    assert!((summary.stats.mean_speed_mps - mean).abs() < 1e-4);
}

#[tokio::test]
async fn shutdown_drains_open_sessions() {
    let sink = Arc::new(RecordingSink::default());
    let handle = Pipeline::spawn(
        PipelineConfig {
            activity_threshold_mps: 1.0,
            // long timeout: only shutdown can close this session
            inactivity_timeout: Duration::from_secs(600),
            ..PipelineConfig::default()
        },
        Arc::new(SingleOwner("driver".into())),
        Arc::new(OwnerOnly),
        sink.clone(),
    );

    let src: SocketAddr = "172.16.0.9:4444".parse().unwrap();
    for speed in [8.0f32, 9.0, 10.0] {
        handle.sample_tx.send(sample(src, speed)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.shutdown().await;

    let sessions = sink.sessions.lock().clone();
    assert_eq!(sessions.len(), 1, "shutdown closes the open session");
    assert_eq!(sessions[0].frame_count, 3);
    assert_eq!(sessions[0].stats.top_speed_mps, 10.0);
}
