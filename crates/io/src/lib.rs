//! File-backed persistence adapter.
//!
//! Frames and session summaries land in append-only NDJSON logs, plus a
//! flat CSV of summaries for spreadsheet import. All file IO happens on a
//! dedicated writer thread fed through a crossbeam channel, so the async
//! persistence task never blocks on disk.

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::thread;
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};

use model::{SessionId, SessionSummary, TelemetrySample};
use paddock_pipeline::PersistenceSink;

const FRAMES_FILE: &str = "frames.ndjson";
const SESSIONS_FILE: &str = "sessions.ndjson";
const SESSIONS_CSV_FILE: &str = "sessions.csv";

#[derive(Serialize)]
struct FrameRecord {
    #[serde(with = "uuid::serde::simple")]
    session: SessionId,
    #[serde(flatten)]
    sample: TelemetrySample,
}

#[derive(Serialize)]
struct SummaryRow {
    id: String,
    owner: String,
    start_time: String,
    end_time: String,
    duration_s: f64,
    frame_count: u64,
    top_speed_mps: f32,
    mean_speed_mps: f32,
    speed_stddev_mps: f32,
    max_rpm: f32,
    peak_g: f32,
}

enum WriteCmd {
    Frame(Box<FrameRecord>),
    Session(Box<SessionSummary>),
    Shutdown,
}

pub struct NdjsonSink {
    tx: Sender<WriteCmd>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl NdjsonSink {
    /// Opens (or creates) the data directory and starts the writer
    /// thread. Existing logs are appended to, never truncated.
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).with_context(|| format!("create data dir {}", dir.display()))?;

        let frames = append_writer(&dir.join(FRAMES_FILE))?;
        let sessions = append_writer(&dir.join(SESSIONS_FILE))?;
        let csv_path = dir.join(SESSIONS_CSV_FILE);
        let csv_existed = csv_path.exists();
        let csv_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&csv_path)
            .with_context(|| format!("open {}", csv_path.display()))?;
        let summaries = csv::WriterBuilder::new()
            .has_headers(!csv_existed)
            .from_writer(csv_file);

        let (tx, rx) = unbounded();
        let worker = thread::Builder::new()
            .name("paddock-io".into())
            .spawn(move || writer_loop(rx, frames, sessions, summaries))
            .context("spawn writer thread")?;
        info!(dir = %dir.display(), "persistence sink ready");
        Ok(Self { tx, worker: Mutex::new(Some(worker)) })
    }

    /// Flushes everything and joins the writer thread.
    pub fn close(&self) -> Result<()> {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = self.tx.send(WriteCmd::Shutdown);
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("persistence writer panicked"))?;
        }
        Ok(())
    }
}

impl Drop for NdjsonSink {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(%err, "persistence sink teardown failed");
        }
    }
}

#[async_trait::async_trait]
impl PersistenceSink for NdjsonSink {
    async fn persist_frame(&self, sample: &TelemetrySample, session: SessionId) -> Result<()> {
        let record = FrameRecord { session, sample: sample.clone() };
        self.tx
            .send(WriteCmd::Frame(Box::new(record)))
            .context("persistence writer is gone")
    }

    async fn persist_session(&self, summary: &SessionSummary) -> Result<()> {
        self.tx
            .send(WriteCmd::Session(Box::new(summary.clone())))
            .context("persistence writer is gone")
    }
}

fn append_writer(path: &Path) -> Result<BufWriter<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    Ok(BufWriter::new(file))
}

fn writer_loop(
    rx: Receiver<WriteCmd>,
    mut frames: BufWriter<File>,
    mut sessions: BufWriter<File>,
    mut summaries: csv::Writer<File>,
) {
    for cmd in rx {
        let result = match cmd {
            WriteCmd::Frame(record) => write_line(&mut frames, &*record),
            WriteCmd::Session(summary) => write_session(&mut sessions, &mut summaries, &summary),
            WriteCmd::Shutdown => break,
        };
        if let Err(err) = result {
            // a bad disk must not take the pipeline down
            warn!(%err, "persistence write failed");
        }
    }
    if let Err(err) = frames
        .flush()
        .and_then(|_| sessions.flush())
        .context("flush ndjson logs")
        .and_then(|_| summaries.flush().context("flush summary csv"))
    {
        warn!(%err, "final flush failed");
    }
}

fn write_line<T: Serialize>(w: &mut BufWriter<File>, value: &T) -> Result<()> {
    let line = serde_json::to_string(value)?;
    writeln!(w, "{line}")?;
    Ok(())
}

fn write_session(
    sessions: &mut BufWriter<File>,
    summaries: &mut csv::Writer<File>,
    summary: &SessionSummary,
) -> Result<()> {
    write_line(sessions, summary)?;
    summaries.serialize(SummaryRow {
        id: summary.id.simple().to_string(),
        owner: summary.owner.clone(),
        start_time: summary.start_time.format(&Rfc3339)?,
        end_time: summary.end_time.format(&Rfc3339)?,
        duration_s: summary.duration_s,
        frame_count: summary.frame_count,
        top_speed_mps: summary.stats.top_speed_mps,
        mean_speed_mps: summary.stats.mean_speed_mps,
        speed_stddev_mps: summary.stats.speed_stddev_mps,
        max_rpm: summary.stats.max_rpm,
        peak_g: summary.stats.peak_g,
    })?;
    // summaries are rare and precious: push them to disk right away
    sessions.flush()?;
    summaries.flush()?;
    Ok(())
}
