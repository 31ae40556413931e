#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! Append-only store of permanently failed jobs.
//!
//! Every job that exhausts its retries (or fails a non-retryable way) is
//! recorded as one self-delimited JSON object per line in a per-run file
//! named with the run's start timestamp. Appends go through an in-memory
//! buffer that a timer task flushes every five seconds and disposal
//! flushes a final time, so a worker never blocks on the disk beyond
//! serializing the append itself.
//!
//! A retry run is a normal run whose job producer is [`read_jobs`] over a
//! previous run's file.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use fastcopy_core::{CopyJob, TransferError};

/// Interval between background flushes of buffered records.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Error raised by recovery store operations.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// Underlying file failure.
    #[error("recovery store I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record line did not parse.
    #[error("malformed recovery record: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One dead-lettered job, as serialized to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedJobRecord {
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
    /// Source URI of the failed job.
    pub source: String,
    /// Destination URI of the failed job.
    pub destination: String,
    /// Size the job declared, when known.
    pub file_size: Option<u64>,
    /// The final error, rendered.
    pub error_message: String,
    /// Optional diagnostic trace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl FailedJobRecord {
    /// The job this record describes, for replay.
    #[must_use]
    pub fn to_job(&self) -> CopyJob {
        CopyJob { source: self.source.clone(), destination: self.destination.clone(), size: self.file_size }
    }
}

struct Buffer {
    file: File,
    pending: Vec<u8>,
    records: u64,
}

/// Per-run append-only record stream.
///
/// `log_failure` is thread-safe; appends serialize on one lock and only
/// touch the in-memory buffer. Dropping the store flushes best-effort and
/// stops the timer task.
pub struct RecoveryStore {
    path: PathBuf,
    buffer: Arc<Mutex<Buffer>>,
    flusher: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for RecoveryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryStore").field("path", &self.path).finish_non_exhaustive()
    }
}

impl RecoveryStore {
    /// Creates the store for a new run in `dir`, named with the current
    /// timestamp, flushing every [`DEFAULT_FLUSH_INTERVAL`].
    ///
    /// Must be called within a tokio runtime; the flush timer runs as a
    /// background task.
    pub fn create_in(dir: &Path) -> Result<Self, RecoveryError> {
        Self::create_with_interval(dir, DEFAULT_FLUSH_INTERVAL)
    }

    /// [`create_in`](Self::create_in) with an explicit flush interval.
    pub fn create_with_interval(dir: &Path, interval: Duration) -> Result<Self, RecoveryError> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S");
        let path = dir.join(format!("fastcopy-failed-{stamp}.jsonl"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let buffer = Arc::new(Mutex::new(Buffer { file, pending: Vec::new(), records: 0 }));
        let flusher = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if let Err(error) = flush_buffer(&buffer) {
                        warn!(%error, "periodic recovery store flush failed");
                    }
                }
            })
        };

        Ok(Self { path, buffer, flusher })
    }

    /// Records a permanently failed job.
    ///
    /// The record is stamped under the store lock, so timestamps in the
    /// file are non-decreasing in append order.
    pub fn log_failure(&self, job: &CopyJob, error: &TransferError, trace: Option<String>) {
        let mut buffer = lock(&self.buffer);
        let record = FailedJobRecord {
            timestamp: Utc::now(),
            source: job.source.clone(),
            destination: job.destination.clone(),
            file_size: job.size,
            error_message: error.to_string(),
            trace,
        };
        match serde_json::to_vec(&record) {
            Ok(line) => {
                buffer.pending.extend_from_slice(&line);
                buffer.pending.push(b'\n');
                buffer.records += 1;
            }
            Err(serialize_error) => {
                warn!(%serialize_error, source = %job.source, "failed to serialize recovery record");
            }
        }
    }

    /// Number of records logged this run.
    #[must_use]
    pub fn record_count(&self) -> u64 {
        lock(&self.buffer).records
    }

    /// Path of this run's record file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Forces buffered records to disk.
    pub fn flush(&self) -> Result<(), RecoveryError> {
        flush_buffer(&self.buffer)
    }
}

impl Drop for RecoveryStore {
    /// Final best-effort flush; disposal errors are swallowed.
    fn drop(&mut self) {
        self.flusher.abort();
        if let Err(error) = flush_buffer(&self.buffer) {
            warn!(%error, "recovery store flush on close failed");
        }
    }
}

fn lock(buffer: &Arc<Mutex<Buffer>>) -> std::sync::MutexGuard<'_, Buffer> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

fn flush_buffer(buffer: &Arc<Mutex<Buffer>>) -> Result<(), RecoveryError> {
    let mut buffer = lock(buffer);
    if buffer.pending.is_empty() {
        return Ok(());
    }
    let pending = std::mem::take(&mut buffer.pending);
    buffer.file.write_all(&pending)?;
    buffer.file.sync_data()?;
    debug!(bytes = pending.len(), "recovery store flushed");
    Ok(())
}

/// Lazily reads the records of a previous run's file.
///
/// Blank lines are skipped; a malformed line yields an `Err` item without
/// ending the iteration.
pub fn read_records(
    path: &Path,
) -> Result<impl Iterator<Item = Result<FailedJobRecord, RecoveryError>>, RecoveryError> {
    let reader = BufReader::new(File::open(path)?);
    Ok(reader.lines().filter_map(|line| match line {
        Err(error) => Some(Err(error.into())),
        Ok(line) if line.trim().is_empty() => None,
        Ok(line) => Some(serde_json::from_str::<FailedJobRecord>(&line).map_err(Into::into)),
    }))
}

/// Lazily reads a previous run's records as jobs for a retry run.
pub fn read_jobs(
    path: &Path,
) -> Result<impl Iterator<Item = Result<CopyJob, RecoveryError>>, RecoveryError> {
    Ok(read_records(path)?.map(|record| record.map(|record| record.to_job())))
}
