//! Top-level composition of one copy run.
//!
//! The controller owns every component for the duration of the run:
//! journal, recovery store, watchdog, rate limiter, pause gate, progress
//! registry, job producer, and worker pool. External front ends steer a
//! running controller through the [`ControlEvent`] channel and observe it
//! through the progress registry; when the run drains the controller
//! finalizes (completion command, source deletion, store flushes) and
//! returns a [`RunSummary`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bandwidth::RateLimiter;
use fastcopy_core::{ExitCode, PauseGate, ProgressRegistry};
use journal::Journal;
use recovery::RecoveryStore;
use transport::{TransportConfig, TransportFactory};

use crate::EngineError;
use crate::executor::TransportExecutor;
use crate::pool::{PoolConfig, PoolShared, WorkerPool};
use crate::producer::{self, JobSource};
use crate::watchdog::ResourceWatchdog;

/// Depth of the bounded job channel between producer and pool.
const JOB_QUEUE_DEPTH: usize = 256;

/// Effective options for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// What to enumerate.
    pub source: JobSource,
    /// Global rate limit in bytes per second, `0` for unlimited.
    pub rate_limit: u64,
    /// Hard upper bound on concurrent transfers.
    pub max_parallelism: usize,
    /// Retries after the first attempt of each job.
    pub max_retries: u32,
    /// Abort the whole run on the first permanent failure.
    pub stop_on_error: bool,
    /// Working-set cap for the resource watchdog.
    pub max_memory_bytes: Option<u64>,
    /// Reduce logging to errors.
    pub quiet: bool,
    /// Enumerate and report without transferring.
    pub dry_run: bool,
    /// Remove the source after a fully successful run.
    pub delete_source: bool,
    /// Shell command executed after a fully successful run.
    pub on_completion: Option<String>,
    /// Journal location; defaults to `fastcopy.journal` in the working
    /// directory.
    pub journal_path: Option<PathBuf>,
    /// Directory for the per-run failed-job file; defaults to the working
    /// directory.
    pub recovery_dir: Option<PathBuf>,
    /// Transport knobs (host-key verification, key file, timeouts).
    pub transport: TransportConfig,
}

impl RunOptions {
    /// Options with conservative defaults for the given source.
    #[must_use]
    pub fn new(source: JobSource) -> Self {
        Self {
            source,
            rate_limit: 0,
            max_parallelism: 4,
            max_retries: 2,
            stop_on_error: false,
            max_memory_bytes: None,
            quiet: false,
            dry_run: false,
            delete_source: false,
            on_completion: None,
            journal_path: None,
            recovery_dir: None,
            transport: TransportConfig::default(),
        }
    }
}

/// Signals an interactive front end sends into a running controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Flip the pause gate.
    TogglePause,
    /// Retarget the global rate limit; `0` removes it.
    SetRateLimit(u64),
    /// Nudge the parallelism ceiling by ±1 (or any delta).
    AdjustParallelism(i32),
}

/// How the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The queue drained; failed jobs (if any) are in the recovery store.
    Completed,
    /// `stop_on_error` aborted the run on a permanent failure.
    Failed,
    /// The run was cancelled from outside.
    Cancelled,
}

impl RunOutcome {
    /// Exit code a command-line front end should use.
    #[must_use]
    pub fn exit_code(self) -> ExitCode {
        match self {
            Self::Completed => ExitCode::Success,
            Self::Failed => ExitCode::Failure,
            Self::Cancelled => ExitCode::Interrupted,
        }
    }
}

/// Final accounting for one run.
#[derive(Debug)]
pub struct RunSummary {
    /// Terminal state of the run.
    pub outcome: RunOutcome,
    /// Jobs the producer enumerated.
    pub jobs_produced: u64,
    /// Jobs that completed.
    pub jobs_completed: u64,
    /// Jobs recorded to the recovery store.
    pub jobs_failed: u64,
    /// Bytes delivered by completed jobs.
    pub bytes_transferred: u64,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
    /// Path of the recovery store file when any job was dead-lettered.
    pub recovery_path: Option<PathBuf>,
    /// Rendered first permanent failure, when any.
    pub first_error: Option<String>,
}

/// Composes and drives one run.
#[derive(Debug)]
pub struct Controller {
    options: RunOptions,
    registry: Arc<ProgressRegistry>,
    pause: Arc<PauseGate>,
    limiter: Arc<RateLimiter>,
}

impl Controller {
    /// Builds the externally observable pieces for a run.
    #[must_use]
    pub fn new(options: RunOptions) -> Self {
        let limiter = Arc::new(RateLimiter::new(options.rate_limit));
        Self {
            options,
            registry: Arc::new(ProgressRegistry::new()),
            pause: Arc::new(PauseGate::new()),
            limiter,
        }
    }

    /// The registry front ends snapshot for progress display.
    #[must_use]
    pub fn registry(&self) -> Arc<ProgressRegistry> {
        Arc::clone(&self.registry)
    }

    /// The pause gate, for direct wiring to a keyboard handler.
    #[must_use]
    pub fn pause_gate(&self) -> Arc<PauseGate> {
        Arc::clone(&self.pause)
    }

    /// The global rate limiter.
    #[must_use]
    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }

    /// Runs to completion, cancellation, or fatal error.
    ///
    /// # Errors
    ///
    /// Setup failures (journal, recovery store, enumeration) surface as
    /// [`EngineError`]; per-job failures end up in the summary and the
    /// recovery store instead.
    pub async fn run(
        self,
        controls: Option<mpsc::Receiver<ControlEvent>>,
        cancel: CancellationToken,
    ) -> Result<RunSummary, EngineError> {
        crate::trace::init(self.options.quiet);
        let started = Instant::now();
        let Self { options, registry, pause, limiter } = self;

        if options.dry_run {
            return dry_run(options, &cancel, started).await;
        }

        let journal_path = options
            .journal_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(journal::DEFAULT_FILE_NAME));
        let journal = Arc::new(Journal::open(&journal_path)?);
        let carried_over = journal.resume();
        if !carried_over.is_empty() {
            info!(
                entries = carried_over.len(),
                "journal carries in-flight entries from a previous run"
            );
        }

        let recovery_dir = options.recovery_dir.clone().unwrap_or_else(|| PathBuf::from("."));
        let recovery = Arc::new(RecoveryStore::create_in(&recovery_dir)?);
        let recovery_path = recovery.path().to_path_buf();

        let watchdog = ResourceWatchdog::new(options.max_parallelism, options.max_memory_bytes);
        let watchdog_task = watchdog.run(cancel.clone());

        let manual_ceiling = Arc::new(AtomicUsize::new(options.max_parallelism));
        let control_task = controls.map(|events| {
            spawn_control_loop(
                events,
                Arc::clone(&pause),
                Arc::clone(&limiter),
                Arc::clone(&manual_ceiling),
                options.max_parallelism,
            )
        });

        let shared = Arc::new(PoolShared {
            registry: Arc::clone(&registry),
            journal: Arc::clone(&journal),
            recovery: Arc::clone(&recovery),
            watchdog: Arc::clone(&watchdog),
            manual_ceiling,
            limiter,
            pause,
            cancel: cancel.clone(),
        });

        let (jobs_tx, jobs_rx) = mpsc::channel(JOB_QUEUE_DEPTH);
        let producer_task = {
            let source = options.source.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { producer::produce(source, jobs_tx, &cancel).await })
        };

        let executor =
            Arc::new(TransportExecutor::new(TransportFactory::new(options.transport.clone())));
        let pool_config = PoolConfig {
            max_parallelism: options.max_parallelism,
            max_retries: options.max_retries,
            stop_on_error: options.stop_on_error,
        };
        let pool_result = WorkerPool::run(executor, jobs_rx, pool_config, shared).await;

        let producer_result = match producer_task.await {
            Ok(result) => result,
            Err(join_error) => {
                warn!(%join_error, "job producer task did not complete");
                Ok(0)
            }
        };

        watchdog_task.abort();
        if let Some(task) = control_task {
            task.abort();
        }
        if let Err(error) = journal.flush() {
            warn!(%error, "journal flush failed");
        }
        if let Err(error) = recovery.flush() {
            warn!(%error, "recovery store flush failed");
        }

        let (report, outcome, first_error) = match pool_result {
            Ok(report) => {
                let outcome = if cancel.is_cancelled() {
                    RunOutcome::Cancelled
                } else {
                    RunOutcome::Completed
                };
                let first_error =
                    report.first_fatal.as_ref().map(|(_, error)| error.to_string());
                (report, outcome, first_error)
            }
            Err(aborted) => {
                let message = format!("{}: {}", aborted.source, aborted.error);
                (aborted.report, RunOutcome::Failed, Some(message))
            }
        };

        // Producer failures (unreadable job list, bad source) are fatal
        // once the pool has drained what was enumerated.
        let jobs_produced = match producer_result {
            Ok(count) => count,
            Err(error) if outcome == RunOutcome::Cancelled => {
                debug!(%error, "producer stopped by cancellation");
                0
            }
            Err(error) => return Err(error),
        };

        // Finalization fires only after a fully successful drain: a run
        // with dead-lettered jobs keeps its source and skips the
        // completion command.
        if outcome == RunOutcome::Completed && report.failed == 0 {
            finalize(&options).await;
        }

        let summary = RunSummary {
            outcome,
            jobs_produced,
            jobs_completed: report.completed,
            jobs_failed: report.failed,
            bytes_transferred: report.bytes_transferred,
            elapsed: started.elapsed(),
            recovery_path: (report.failed > 0).then_some(recovery_path),
            first_error,
        };
        info!(
            outcome = ?summary.outcome,
            produced = summary.jobs_produced,
            completed = summary.jobs_completed,
            failed = summary.jobs_failed,
            bytes = summary.bytes_transferred,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            rate = %bandwidth::format_rate(options.rate_limit),
            "run finished"
        );
        Ok(summary)
    }
}

/// Lists the in-flight entries a previous run left in its journal.
///
/// A front end can show these before a retry run; the offsets are
/// advisory (see the journal crate docs).
pub fn journal_entries(path: &Path) -> Result<Vec<journal::JournalEntry>, EngineError> {
    Ok(Journal::open(path)?.resume())
}

/// Enumerates without executing: the dry-run path.
async fn dry_run(
    options: RunOptions,
    cancel: &CancellationToken,
    started: Instant,
) -> Result<RunSummary, EngineError> {
    let (jobs_tx, mut jobs_rx) = mpsc::channel(JOB_QUEUE_DEPTH);
    let producer_task = {
        let source = options.source.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { producer::produce(source, jobs_tx, &cancel).await })
    };

    let mut bytes_planned = 0u64;
    while let Some(job) = jobs_rx.recv().await {
        bytes_planned += job.size.unwrap_or(0);
        info!(source = %job.source, destination = %job.destination, size = ?job.size, "would copy");
    }

    let jobs_produced = match producer_task.await {
        Ok(result) => result?,
        Err(join_error) => {
            warn!(%join_error, "job producer task did not complete");
            0
        }
    };

    let outcome =
        if cancel.is_cancelled() { RunOutcome::Cancelled } else { RunOutcome::Completed };
    Ok(RunSummary {
        outcome,
        jobs_produced,
        jobs_completed: 0,
        jobs_failed: 0,
        bytes_transferred: bytes_planned,
        elapsed: started.elapsed(),
        recovery_path: None,
        first_error: None,
    })
}

fn spawn_control_loop(
    mut events: mpsc::Receiver<ControlEvent>,
    pause: Arc<PauseGate>,
    limiter: Arc<RateLimiter>,
    manual_ceiling: Arc<AtomicUsize>,
    max_parallelism: usize,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ControlEvent::TogglePause => {
                    let paused = pause.toggle();
                    info!(paused, "pause toggled");
                }
                ControlEvent::SetRateLimit(rate) => {
                    limiter.set_limit(rate);
                    info!(rate = %bandwidth::format_rate(rate), "rate limit retargeted");
                }
                ControlEvent::AdjustParallelism(delta) => {
                    let current = manual_ceiling.load(Ordering::Acquire) as i64;
                    let adjusted =
                        current.saturating_add(i64::from(delta)).clamp(1, max_parallelism as i64);
                    manual_ceiling.store(adjusted as usize, Ordering::Release);
                    info!(ceiling = adjusted, "parallelism ceiling adjusted");
                }
            }
        }
    })
}

/// Post-drain finalization: completion command, then source deletion.
///
/// Reached only when every job completed; a partially failed run must
/// keep its source (the failed files exist nowhere else) and must not
/// signal success downstream.
async fn finalize(options: &RunOptions) {
    if let Some(command) = &options.on_completion {
        match tokio::process::Command::new("sh").arg("-c").arg(command).status().await {
            Ok(status) if status.success() => debug!(command, "completion command succeeded"),
            Ok(status) => warn!(command, %status, "completion command failed"),
            Err(error) => warn!(command, %error, "completion command did not start"),
        }
    }

    if options.delete_source {
        match &options.source {
            JobSource::SingleFile { source, .. } => {
                if let Err(error) = tokio::fs::remove_file(source).await {
                    warn!(%error, source = %source.display(), "delete-source failed");
                }
            }
            JobSource::Directory { root, .. } => {
                if let Err(error) = tokio::fs::remove_dir_all(root).await {
                    warn!(%error, root = %root.display(), "delete-source failed");
                }
            }
            JobSource::JobList { .. } | JobSource::RecoveryFile { .. } => {
                warn!("delete-source only applies to file and directory sources");
            }
        }
    }
}
