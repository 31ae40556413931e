//! Job production: enumerate a source into the bounded job channel.
//!
//! Three live modes plus recovery replay: a single file, a recursive
//! directory walk, an external job list (`source|destination` per line),
//! and a previous run's failed-job file. All of them feed the channel
//! lazily, so a slow pool backpressures enumeration instead of buffering
//! the whole tree in memory.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use fastcopy_core::{CopyJob, TransferError, parse_job_line};

use crate::EngineError;

/// What a run enumerates.
#[derive(Debug, Clone)]
pub enum JobSource {
    /// One file to one destination.
    SingleFile {
        /// Local source path.
        source: PathBuf,
        /// Destination URI.
        destination: String,
    },
    /// Every regular file under a root, mirrored below a destination root.
    Directory {
        /// Local source root.
        root: PathBuf,
        /// Destination root URI; relative paths are appended.
        destination_root: String,
    },
    /// External job list, one `source|destination` pair per line.
    JobList {
        /// Path of the list file.
        path: PathBuf,
    },
    /// Replay of a previous run's failed jobs.
    RecoveryFile {
        /// Path of the recovery store file.
        path: PathBuf,
    },
}

/// Enumerates `source` into `jobs`, returning the number produced.
///
/// Stops early (without error) when the run is cancelled or the pool side
/// of the channel closes.
pub async fn produce(
    source: JobSource,
    jobs: mpsc::Sender<CopyJob>,
    cancel: &CancellationToken,
) -> Result<u64, EngineError> {
    match source {
        JobSource::SingleFile { source, destination } => {
            produce_single(source, destination, &jobs).await
        }
        JobSource::Directory { root, destination_root } => {
            produce_directory(root, destination_root, jobs, cancel).await
        }
        JobSource::JobList { path } => produce_job_list(&path, &jobs, cancel).await,
        JobSource::RecoveryFile { path } => produce_recovery(path, jobs, cancel).await,
    }
}

async fn produce_single(
    source: PathBuf,
    destination: String,
    jobs: &mpsc::Sender<CopyJob>,
) -> Result<u64, EngineError> {
    let metadata = tokio::fs::metadata(&source).await.map_err(|error| {
        if error.kind() == std::io::ErrorKind::NotFound {
            EngineError::Transfer(TransferError::SourceNotFound {
                path: source.display().to_string(),
            })
        } else {
            EngineError::Io(error)
        }
    })?;
    if !metadata.is_file() {
        return Err(EngineError::Transfer(TransferError::bad_input(format!(
            "source is not a regular file: {}",
            source.display()
        ))));
    }

    let job = CopyJob::with_size(source.display().to_string(), destination, metadata.len());
    let _ = jobs.send(job).await;
    Ok(1)
}

/// Walks `root` on a blocking task, emitting one job per regular file
/// with the destination computed from the file's relative path.
async fn produce_directory(
    root: PathBuf,
    destination_root: String,
    jobs: mpsc::Sender<CopyJob>,
    cancel: &CancellationToken,
) -> Result<u64, EngineError> {
    if !tokio::fs::metadata(&root).await.map(|metadata| metadata.is_dir()).unwrap_or(false) {
        return Err(EngineError::Transfer(TransferError::bad_input(format!(
            "source is not a directory: {}",
            root.display()
        ))));
    }

    let cancel = cancel.clone();
    let destination_root = destination_root.trim_end_matches('/').to_string();
    let produced = tokio::task::spawn_blocking(move || -> Result<u64, EngineError> {
        let mut produced = 0u64;
        for entry in jwalk::WalkDir::new(&root).sort(true) {
            if cancel.is_cancelled() {
                break;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    warn!(%error, "skipping unreadable directory entry");
                    continue;
                }
            };
            let path = entry.path();
            let Ok(metadata) = std::fs::metadata(&path) else { continue };
            if !metadata.is_file() {
                continue;
            }

            let Ok(relative) = path.strip_prefix(&root) else { continue };
            let relative = join_components(relative);

            let job = CopyJob::with_size(
                path.display().to_string(),
                format!("{destination_root}/{relative}"),
                metadata.len(),
            );
            if jobs.blocking_send(job).is_err() {
                break;
            }
            produced += 1;
        }
        Ok(produced)
    })
    .await
    .map_err(|join_error| {
        EngineError::Transfer(TransferError::bad_input(format!(
            "directory enumeration failed: {join_error}"
        )))
    })??;

    debug!(produced, "directory enumeration complete");
    Ok(produced)
}

/// Renders a relative path with `/` separators for destination URIs.
fn join_components(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

async fn produce_job_list(
    path: &Path,
    jobs: &mpsc::Sender<CopyJob>,
    cancel: &CancellationToken,
) -> Result<u64, EngineError> {
    let file = tokio::fs::File::open(path).await?;
    let mut lines = BufReader::new(file).lines();

    let mut produced = 0u64;
    while let Some(line) = lines.next_line().await? {
        if cancel.is_cancelled() {
            break;
        }
        let Some(job) = parse_job_line(&line)? else { continue };
        if jobs.send(job).await.is_err() {
            break;
        }
        produced += 1;
    }
    Ok(produced)
}

/// Replays a recovery store file on a blocking task; the reader is lazy,
/// so backpressure reaches the file reads.
async fn produce_recovery(
    path: PathBuf,
    jobs: mpsc::Sender<CopyJob>,
    cancel: &CancellationToken,
) -> Result<u64, EngineError> {
    let cancel = cancel.clone();
    let produced = tokio::task::spawn_blocking(move || -> Result<u64, EngineError> {
        let mut produced = 0u64;
        for job in recovery::read_jobs(&path)? {
            if cancel.is_cancelled() {
                break;
            }
            let job = match job {
                Ok(job) => job,
                Err(error) => {
                    warn!(%error, "skipping malformed recovery record");
                    continue;
                }
            };
            if jobs.blocking_send(job).is_err() {
                break;
            }
            produced += 1;
        }
        Ok(produced)
    })
    .await
    .map_err(|join_error| {
        EngineError::Transfer(TransferError::bad_input(format!(
            "recovery replay failed: {join_error}"
        )))
    })??;

    debug!(produced, "recovery replay complete");
    Ok(produced)
}
