//! The snapshot worker.
//!
//! Every commit enqueues `(revision, timestamp, record size)`. A dedicated
//! task evaluates the three thresholds (records, cumulative size, age; any
//! one firing is enough) and, when crossed, collapses all non-compacted
//! history up to that revision into a single ZSTD snapshot object, then
//! prunes the chunk objects the snapshot supersedes.
//!
//! The request channel is bounded and lossy: when the worker is busy the
//! commit path drops the request with a warning rather than blocking -
//! every later commit enqueues again, so nothing is lost but timing.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use netsy_datafile::Writer;
use netsy_index::LocalIndex;
use netsy_proto::netsy::FileKind;
use netsy_s3::{FileInfo, S3Store};

const REQUEST_CHANNEL_CAPACITY: usize = 100;

/// One commit's contribution to the threshold accounting.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotRequest {
    pub revision: i64,
    pub timestamp: Instant,
    pub record_size: i64,
}

/// The thresholds; each is disabled when 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotThresholds {
    pub records: i64,
    pub size_mb: i64,
    pub age_minutes: i64,
}

/// Commit-side handle: enqueue without blocking the commit path.
#[derive(Clone)]
pub struct SnapshotHandle {
    tx: mpsc::Sender<SnapshotRequest>,
}

impl SnapshotHandle {
    pub fn observe(&self, revision: i64, record_size: i64) {
        let req = SnapshotRequest {
            revision,
            timestamp: Instant::now(),
            record_size,
        };
        if self.tx.try_send(req).is_err() {
            warn!(revision, "snapshot request channel full, dropping request");
        }
    }
}

struct State {
    last_revision: i64,
    last_time: Option<Instant>,
    cumulative_size: i64,
}

/// The worker: owns the request channel; the threshold state and the
/// snapshot pass live in [`SnapshotCore`] so the receive loop and the
/// processing can be separated.
pub struct SnapshotWorker {
    core: Arc<SnapshotCore>,
    rx: mpsc::Receiver<SnapshotRequest>,
}

struct SnapshotCore {
    index: Arc<LocalIndex>,
    s3: Arc<S3Store>,
    thresholds: SnapshotThresholds,
    data_dir: PathBuf,
    instance_id: String,
    state: Mutex<State>,
    // One snapshot pass at a time.
    snapshot_mutex: AsyncMutex<()>,
}

impl SnapshotWorker {
    pub fn new(
        index: Arc<LocalIndex>,
        s3: Arc<S3Store>,
        thresholds: SnapshotThresholds,
        data_dir: PathBuf,
        instance_id: String,
    ) -> (SnapshotHandle, SnapshotWorker) {
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let core = Arc::new(SnapshotCore {
            index,
            s3,
            thresholds,
            data_dir,
            instance_id,
            state: Mutex::new(State {
                last_revision: 0,
                last_time: None,
                cumulative_size: 0,
            }),
            snapshot_mutex: AsyncMutex::new(()),
        });
        (SnapshotHandle { tx }, SnapshotWorker { core, rx })
    }

    /// Seed threshold state from the newest existing snapshot. Its exact
    /// creation time is unknown, so "now" stands in; age thresholds are
    /// coarse enough to tolerate the approximation.
    pub fn initialize_from_snapshot(&self, latest: Option<&FileInfo>) {
        let mut state = self.core.state.lock().expect("snapshot state poisoned");
        match latest {
            Some(info) => {
                state.last_revision = info.revision;
                state.last_time = Some(Instant::now());
                state.cumulative_size = 0;
                info!(
                    latest_snapshot_revision = info.revision,
                    "initialized snapshot tracking from existing snapshot"
                );
            }
            None => {
                state.last_revision = 0;
                state.last_time = None;
                state.cumulative_size = 0;
                info!("no existing snapshots found, initialized with default state");
            }
        }
    }

    /// Run a snapshot pass immediately, regardless of thresholds.
    pub async fn create_snapshot(&self, up_to: i64) {
        self.core.create_snapshot(up_to).await;
    }

    /// Run until shut down or until every commit-side handle is dropped.
    pub fn start(self, shutdown_rx: oneshot::Receiver<()>) -> JoinHandle<()> {
        let core = self.core;
        let mut rx = self.rx;
        let mut shutdown_rx = shutdown_rx;
        tokio::spawn(async move {
            info!("snapshot worker started");
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("snapshot worker stopping");
                        break;
                    }
                    req = rx.recv() => match req {
                        Some(req) => core.process(req).await,
                        None => break,
                    }
                }
            }
        })
    }
}

impl SnapshotCore {
    async fn process(&self, req: SnapshotRequest) {
        let decision = {
            let mut state = self.state.lock().expect("snapshot state poisoned");
            state.cumulative_size += req.record_size;
            let decision = decide(
                self.thresholds,
                req.revision,
                req.timestamp,
                state.cumulative_size,
                state.last_revision,
                state.last_time,
            );
            if decision.is_some() {
                state.last_revision = req.revision;
                state.last_time = Some(req.timestamp);
                state.cumulative_size = 0;
            }
            decision
        };

        if let Some(reason) = decision {
            info!(
                current_revision = req.revision,
                reason, "snapshot thresholds met, creating snapshot"
            );
            self.create_snapshot(req.revision).await;
        }
    }

    /// Collapse history up to `up_to` into one snapshot object and prune the
    /// superseded chunks. Failures are logged, never fatal: the next
    /// threshold crossing retries.
    async fn create_snapshot(&self, up_to: i64) {
        let _pass = self.snapshot_mutex.lock().await;

        info!(up_to_revision = up_to, "starting snapshot creation");

        let records = match self.index.find_all_records_for_snapshot(up_to).await {
            Ok(records) => records,
            Err(err) => {
                error!(error = %err, "failed to get records for snapshot");
                return;
            }
        };
        if records.is_empty() {
            warn!(up_to_revision = up_to, "no records found for snapshot");
            return;
        }
        let record_count = records.len();

        let temp = match tempfile::Builder::new()
            .prefix(&format!("snapshot_{up_to}_"))
            .suffix(".netsy")
            .tempfile_in(&self.data_dir)
        {
            Ok(temp) => temp,
            Err(err) => {
                error!(error = %err, "failed to create temporary snapshot file");
                return;
            }
        };

        debug!(temp_file = %temp.path().display(), records = record_count, "writing snapshot file");
        let path = temp.path().to_path_buf();
        let instance_id = self.instance_id.clone();
        let written = tokio::task::spawn_blocking(move || -> netsy_datafile::Result<()> {
            let file = std::fs::File::create(&path)?;
            let mut writer = Writer::new(
                std::io::BufWriter::new(file),
                FileKind::KindSnapshot,
                records.len() as i64,
                &instance_id,
            )?;
            for record in &records {
                writer.write(record)?;
            }
            writer.finish()
        })
        .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(error = %err, "failed to write snapshot file");
                return;
            }
            Err(err) => {
                error!(error = %err, "snapshot writer task failed");
                return;
            }
        }

        let key = self.s3.layout().snapshot_key(up_to);
        info!(key = %key, "uploading snapshot");
        if let Err(err) = self.s3.upload_file(&key, temp.path()).await {
            error!(key = %key, error = %err, "failed to upload snapshot");
            return;
        }
        info!(revision = up_to, records = record_count, key = %key, "snapshot uploaded");

        // Prune chunks the snapshot now covers. Delete failures are retried
        // by the next pass.
        let chunks = match self.s3.list_chunks_for_cleanup(up_to).await {
            Ok(chunks) => chunks,
            Err(err) => {
                error!(error = %err, "failed to list chunks for cleanup");
                return;
            }
        };
        let mut deleted = 0usize;
        for chunk in &chunks {
            match self.s3.delete_file(&chunk.key).await {
                Ok(()) => {
                    deleted += 1;
                    debug!(key = %chunk.key, revision = chunk.revision, "deleted chunk file");
                }
                Err(err) => {
                    warn!(key = %chunk.key, error = %err, "failed to delete chunk file");
                }
            }
        }
        info!(
            up_to_revision = up_to,
            deleted_chunks = deleted,
            "chunk file cleanup completed"
        );
    }
}

/// The threshold policy. Never fires without new records; otherwise the
/// first threshold to trip wins, and a 0 threshold is disabled.
fn decide(
    thresholds: SnapshotThresholds,
    current_revision: i64,
    now: Instant,
    cumulative_size: i64,
    last_revision: i64,
    last_time: Option<Instant>,
) -> Option<&'static str> {
    if current_revision <= last_revision {
        return None;
    }

    if thresholds.records > 0 && current_revision - last_revision >= thresholds.records {
        return Some("record_count");
    }

    if thresholds.age_minutes > 0 {
        match last_time {
            // First eligible request fires once age tracking is on.
            None => return Some("first_snapshot"),
            Some(last) => {
                let age = Duration::from_secs(thresholds.age_minutes as u64 * 60);
                if now.duration_since(last) >= age {
                    return Some("age");
                }
            }
        }
    }

    if thresholds.size_mb > 0 && cumulative_size >= thresholds.size_mb * (1 << 20) {
        return Some("size");
    }

    None
}
