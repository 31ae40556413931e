//! Worker pool draining the job queue under a dynamic parallelism ceiling.
//!
//! The pool admits jobs against `min(max_parallelism, watchdog ceiling,
//! operator ceiling)`: a semaphore enforces the hard maximum while the two
//! dynamic ceilings are checked before each admission, so the pool never
//! rebuilds when a ceiling moves. Each job runs the per-job protocol:
//! registry entry, retry loop with classified errors and linear back-off,
//! journal upkeep, and dead-lettering into the recovery store when the
//! attempts are exhausted.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use bandwidth::RateLimiter;
use fastcopy_core::{CopyJob, PauseGate, ProgressRegistry, TransferError, TransferStatus};
use journal::Journal;
use recovery::RecoveryStore;
use transfer::{CopyContext, Progress};

use crate::executor::Executor;
use crate::watchdog::ResourceWatchdog;

/// Sleep between admission checks while over the dynamic ceiling.
const ADMISSION_POLL: Duration = Duration::from_millis(25);

/// Linear back-off step between retry attempts.
const RETRY_BACKOFF_STEP: Duration = Duration::from_millis(100);

/// Static pool parameters for one run.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Hard upper bound on concurrent jobs.
    pub max_parallelism: usize,
    /// Retries after the first attempt; a job gets `max_retries + 1`
    /// attempts in total.
    pub max_retries: u32,
    /// Abort the run (cancelling peers) on the first permanent failure.
    pub stop_on_error: bool,
}

/// Shared run services every worker uses.
#[derive(Debug)]
pub struct PoolShared {
    /// In-flight transfer registry.
    pub registry: Arc<ProgressRegistry>,
    /// Crash journal.
    pub journal: Arc<Journal>,
    /// Dead-letter store.
    pub recovery: Arc<RecoveryStore>,
    /// Resource-driven ceiling.
    pub watchdog: Arc<ResourceWatchdog>,
    /// Operator-driven ceiling (parallelism delta control).
    pub manual_ceiling: Arc<AtomicUsize>,
    /// Global rate limiter.
    pub limiter: Arc<RateLimiter>,
    /// Pause gate.
    pub pause: Arc<PauseGate>,
    /// Run-wide cancellation signal.
    pub cancel: CancellationToken,
}

/// Tallies returned when the pool drains.
#[derive(Debug, Default)]
pub struct PoolReport {
    /// Jobs that completed.
    pub completed: u64,
    /// Jobs that failed permanently.
    pub failed: u64,
    /// Jobs abandoned by cancellation.
    pub cancelled: u64,
    /// Bytes delivered by completed jobs.
    pub bytes_transferred: u64,
    /// First permanent failure, kept for the run summary.
    pub first_fatal: Option<(String, TransferError)>,
}

/// Raised when `stop_on_error` aborts the run on a permanent failure.
///
/// Carries the tallies of the work that finished before the abort, so
/// the run summary still accounts for jobs that landed successfully.
#[derive(Debug, thiserror::Error)]
#[error("job {source} failed: {error}")]
pub struct PoolAborted {
    /// Tallies up to the abort; `first_fatal` is moved into the fields
    /// below.
    pub report: PoolReport,
    /// Source URI of the fatal job.
    pub source: String,
    /// The fatal job's final error.
    #[source]
    pub error: TransferError,
}

enum JobOutcome {
    Completed(u64),
    Failed(String, TransferError),
    Cancelled,
}

/// The pool entry point.
#[derive(Debug)]
pub struct WorkerPool;

impl WorkerPool {
    /// Drains `jobs` until the channel closes or the run is cancelled.
    ///
    /// # Errors
    ///
    /// With `stop_on_error` set, the first permanent job failure cancels
    /// the remaining work and surfaces as [`PoolAborted`], which still
    /// carries the tallies of everything that completed beforehand.
    pub async fn run<E: Executor>(
        executor: Arc<E>,
        mut jobs: mpsc::Receiver<CopyJob>,
        config: PoolConfig,
        shared: Arc<PoolShared>,
    ) -> Result<PoolReport, PoolAborted> {
        let semaphore = Arc::new(Semaphore::new(config.max_parallelism.max(1)));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let mut tasks: JoinSet<JobOutcome> = JoinSet::new();
        let mut report = PoolReport::default();

        'accept: loop {
            // Admission: wait until we are inside the dynamic ceiling.
            loop {
                reap_finished(&mut tasks, &mut report);
                if config.stop_on_error && report.first_fatal.is_some() {
                    shared.cancel.cancel();
                    break 'accept;
                }
                if in_flight.load(Ordering::Acquire) < effective_ceiling(&config, &shared) {
                    break;
                }
                tokio::select! {
                    () = shared.cancel.cancelled() => break 'accept,
                    () = tokio::time::sleep(ADMISSION_POLL) => {}
                }
            }

            let job = tokio::select! {
                () = shared.cancel.cancelled() => break 'accept,
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break 'accept,
                },
            };

            let permit = tokio::select! {
                () = shared.cancel.cancelled() => break 'accept,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break 'accept,
                },
            };

            in_flight.fetch_add(1, Ordering::AcqRel);
            let worker = JobWorker {
                executor: Arc::clone(&executor),
                shared: Arc::clone(&shared),
                max_retries: config.max_retries,
            };
            let in_flight_count = Arc::clone(&in_flight);
            tasks.spawn(async move {
                let outcome = worker.run(job).await;
                drop(permit);
                in_flight_count.fetch_sub(1, Ordering::AcqRel);
                outcome
            });
        }

        while let Some(joined) = tasks.join_next().await {
            record_outcome(joined, &mut report);
            if config.stop_on_error && report.first_fatal.is_some() && !shared.cancel.is_cancelled()
            {
                shared.cancel.cancel();
            }
        }

        if config.stop_on_error {
            if let Some((source, error)) = report.first_fatal.take() {
                return Err(PoolAborted { report, source, error });
            }
        }
        debug!(
            completed = report.completed,
            failed = report.failed,
            cancelled = report.cancelled,
            "worker pool drained"
        );
        Ok(report)
    }
}

fn effective_ceiling(config: &PoolConfig, shared: &PoolShared) -> usize {
    config
        .max_parallelism
        .min(shared.watchdog.ceiling())
        .min(shared.manual_ceiling.load(Ordering::Acquire))
        .max(1)
}

fn reap_finished(tasks: &mut JoinSet<JobOutcome>, report: &mut PoolReport) {
    while let Some(joined) = tasks.try_join_next() {
        record_outcome(joined, report);
    }
}

fn record_outcome(joined: Result<JobOutcome, tokio::task::JoinError>, report: &mut PoolReport) {
    match joined {
        Ok(JobOutcome::Completed(bytes)) => {
            report.completed += 1;
            report.bytes_transferred += bytes;
        }
        Ok(JobOutcome::Failed(source, error)) => {
            report.failed += 1;
            if report.first_fatal.is_none() {
                report.first_fatal = Some((source, error));
            }
        }
        Ok(JobOutcome::Cancelled) => report.cancelled += 1,
        Err(join_error) => {
            warn!(%join_error, "worker task did not complete");
            report.failed += 1;
        }
    }
}

struct JobWorker<E> {
    executor: Arc<E>,
    shared: Arc<PoolShared>,
    max_retries: u32,
}

impl<E: Executor> JobWorker<E> {
    /// The per-job protocol: registry entry, retry loop, terminal
    /// bookkeeping.
    async fn run(&self, job: CopyJob) -> JobOutcome {
        let registry = &self.shared.registry;
        registry.insert(&job);
        let pause_mirror = self.spawn_pause_mirror(job.source.clone());

        let mut attempt: u32 = 0;
        let final_result = loop {
            attempt += 1;
            match self.attempt(&job).await {
                Ok(total) => break Ok(total),
                Err(error) if error.is_cancelled() => break Err(error),
                Err(error) if error.is_retryable() && attempt <= self.max_retries => {
                    warn!(source = %job.source, attempt, %error, "transient failure, retrying");
                    let backoff = RETRY_BACKOFF_STEP * attempt;
                    tokio::select! {
                        () = self.shared.cancel.cancelled() => break Err(TransferError::Cancelled),
                        () = tokio::time::sleep(backoff) => {}
                    }
                    registry.reset_bytes(&job.source);
                }
                Err(error) => break Err(error),
            }
        };
        pause_mirror.abort();

        match final_result {
            Ok(total) => {
                registry.set_status(&job.source, TransferStatus::Completed);
                self.shared.journal.complete(&job.source);
                registry.remove(&job.source);
                debug!(source = %job.source, total, "job completed");
                JobOutcome::Completed(total)
            }
            Err(error) if error.is_cancelled() => {
                // No dead-letter record for cancellations; the journal
                // entry stays behind for a crash-style resume.
                registry.remove(&job.source);
                JobOutcome::Cancelled
            }
            Err(error) => {
                registry.set_status(&job.source, TransferStatus::Failed);
                self.shared.recovery.log_failure(&job, &error, None);
                registry.remove(&job.source);
                warn!(source = %job.source, %error, "job failed permanently");
                JobOutcome::Failed(job.source.clone(), error)
            }
        }
    }

    /// One attempt: journal the in-flight entry, execute, stream progress
    /// into the registry and journal.
    async fn attempt(&self, job: &CopyJob) -> Result<u64, TransferError> {
        if let Err(error) = self.shared.journal.update(&job.source, &job.destination, 0) {
            warn!(%error, source = %job.source, "journal upsert failed");
        }

        let ctx = CopyContext {
            limiter: Some(Arc::clone(&self.shared.limiter)),
            pause: Some(Arc::clone(&self.shared.pause)),
            cancel: self.shared.cancel.clone(),
        };

        let registry = Arc::clone(&self.shared.registry);
        let journal = Arc::clone(&self.shared.journal);
        let source = job.source.clone();
        let destination = job.destination.clone();
        let mut on_progress = move |progress: Progress| {
            registry.record_progress(&source, progress.total_copied, progress.bytes_per_second);
            if let Err(error) = journal.update(&source, &destination, progress.total_copied) {
                warn!(%error, "journal update failed");
            }
        };

        self.executor.execute(job, &ctx, &mut on_progress).await
    }

    /// Mirrors the pause gate into this job's registry status.
    fn spawn_pause_mirror(&self, source: String) -> JoinHandle<()> {
        let registry = Arc::clone(&self.shared.registry);
        let mut paused = self.shared.pause.subscribe();
        tokio::spawn(async move {
            loop {
                if *paused.borrow_and_update() {
                    registry.transition(&source, TransferStatus::Copying, TransferStatus::Paused);
                    registry.transition(&source, TransferStatus::Pending, TransferStatus::Paused);
                } else {
                    registry.transition(&source, TransferStatus::Paused, TransferStatus::Copying);
                }
                if paused.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use transfer::ProgressFn;

    /// Result shape one scripted attempt produces.
    #[derive(Debug, Clone, Copy)]
    enum Step {
        Succeed(u64),
        FailNetwork,
        FailNotFound,
    }

    /// Executor with a scripted global attempt sequence and concurrency
    /// accounting.
    struct ScriptedExecutor {
        delay: Duration,
        script: Mutex<VecDeque<Step>>,
        attempts: AtomicUsize,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedExecutor {
        fn new(delay: Duration, script: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                delay,
                script: Mutex::new(script.into()),
                attempts: AtomicUsize::new(0),
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }

        fn always_ok(delay: Duration) -> Arc<Self> {
            Self::new(delay, Vec::new())
        }
    }

    impl Executor for ScriptedExecutor {
        fn execute<'a>(
            &'a self,
            _job: &'a CopyJob,
            ctx: &'a CopyContext,
            on_progress: ProgressFn<'a>,
        ) -> impl std::future::Future<Output = Result<u64, TransferError>> + Send + 'a {
            async move {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);

                let step = self
                    .script
                    .lock()
                    .expect("script lock")
                    .pop_front()
                    .unwrap_or(Step::Succeed(1_000));

                tokio::select! {
                    () = ctx.cancel.cancelled() => {
                        self.current.fetch_sub(1, Ordering::SeqCst);
                        return Err(TransferError::Cancelled);
                    }
                    () = tokio::time::sleep(self.delay) => {}
                }
                self.current.fetch_sub(1, Ordering::SeqCst);

                match step {
                    Step::Succeed(bytes) => {
                        on_progress(Progress {
                            total_copied: bytes,
                            total_known: Some(bytes),
                            bytes_per_second: bytes,
                        });
                        Ok(bytes)
                    }
                    Step::FailNetwork => Err(TransferError::network("connection reset by peer")),
                    Step::FailNotFound => Err(TransferError::Io(io::Error::new(
                        io::ErrorKind::NotFound,
                        "no such file",
                    ))),
                }
            }
        }
    }

    struct Fixture {
        shared: Arc<PoolShared>,
        _dir: TempDir,
    }

    fn fixture(max_parallelism: usize) -> Fixture {
        let dir = TempDir::new().expect("tempdir");
        let journal =
            Arc::new(Journal::open(&dir.path().join("fastcopy.journal")).expect("journal"));
        let recovery = Arc::new(RecoveryStore::create_in(dir.path()).expect("recovery"));
        let shared = Arc::new(PoolShared {
            registry: Arc::new(ProgressRegistry::new()),
            journal,
            recovery,
            watchdog: ResourceWatchdog::new(max_parallelism, None),
            manual_ceiling: Arc::new(AtomicUsize::new(max_parallelism)),
            limiter: Arc::new(RateLimiter::new(0)),
            pause: Arc::new(PauseGate::new()),
            cancel: CancellationToken::new(),
        });
        Fixture { shared, _dir: dir }
    }

    fn config(max_parallelism: usize, max_retries: u32, stop_on_error: bool) -> PoolConfig {
        PoolConfig { max_parallelism, max_retries, stop_on_error }
    }

    async fn send_jobs(count: usize) -> mpsc::Receiver<CopyJob> {
        let (tx, rx) = mpsc::channel(64);
        for index in 0..count {
            tx.send(CopyJob::with_size(format!("/src/{index}"), format!("/dst/{index}"), 1_000))
                .await
                .expect("queue job");
        }
        rx
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn in_flight_jobs_never_exceed_the_ceiling() {
        let fixture = fixture(4);
        let executor = ScriptedExecutor::always_ok(Duration::from_millis(30));
        let jobs = send_jobs(20).await;

        let report = WorkerPool::run(
            Arc::clone(&executor),
            jobs,
            config(4, 0, false),
            Arc::clone(&fixture.shared),
        )
        .await
        .expect("pool");

        assert_eq!(report.completed, 20);
        assert_eq!(report.failed, 0);
        assert!(executor.peak.load(Ordering::SeqCst) <= 4);
        assert!(fixture.shared.registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn watchdog_ceiling_caps_admission_below_the_maximum() {
        let fixture = fixture(8);
        // Resource-advised ceiling of 2 beats max_parallelism 8.
        let shared = Arc::new(PoolShared {
            watchdog: ResourceWatchdog::new(2, None),
            registry: Arc::clone(&fixture.shared.registry),
            journal: Arc::clone(&fixture.shared.journal),
            recovery: Arc::clone(&fixture.shared.recovery),
            manual_ceiling: Arc::clone(&fixture.shared.manual_ceiling),
            limiter: Arc::clone(&fixture.shared.limiter),
            pause: Arc::clone(&fixture.shared.pause),
            cancel: fixture.shared.cancel.clone(),
        });
        let executor = ScriptedExecutor::always_ok(Duration::from_millis(30));
        let jobs = send_jobs(10).await;

        let report = WorkerPool::run(Arc::clone(&executor), jobs, config(8, 0, false), shared)
            .await
            .expect("pool");

        assert_eq!(report.completed, 10);
        assert!(executor.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn throttled_to_one_then_restored_completes_without_deadlock() {
        let fixture = fixture(4);
        fixture.shared.manual_ceiling.store(1, Ordering::Release);
        let executor = ScriptedExecutor::always_ok(Duration::from_millis(20));
        let jobs = send_jobs(12).await;

        let manual = Arc::clone(&fixture.shared.manual_ceiling);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            manual.store(4, Ordering::Release);
        });

        let report = WorkerPool::run(
            Arc::clone(&executor),
            jobs,
            config(4, 0, false),
            Arc::clone(&fixture.shared),
        )
        .await
        .expect("pool");

        assert_eq!(report.completed, 12);
        assert!(executor.peak.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transient_failures_retry_until_success() {
        let fixture = fixture(1);
        let executor = ScriptedExecutor::new(
            Duration::from_millis(5),
            vec![Step::FailNetwork, Step::FailNetwork, Step::Succeed(777)],
        );
        let jobs = send_jobs(1).await;

        let report = WorkerPool::run(
            Arc::clone(&executor),
            jobs,
            config(1, 2, false),
            Arc::clone(&fixture.shared),
        )
        .await
        .expect("pool");

        assert_eq!(report.completed, 1);
        assert_eq!(report.bytes_transferred, 777);
        assert_eq!(executor.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(fixture.shared.recovery.record_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exhausted_retries_dead_letter_the_job() {
        let fixture = fixture(1);
        let executor = ScriptedExecutor::new(
            Duration::from_millis(5),
            vec![Step::FailNetwork, Step::FailNetwork, Step::FailNetwork],
        );
        let jobs = send_jobs(1).await;

        let report = WorkerPool::run(
            Arc::clone(&executor),
            jobs,
            config(1, 2, false),
            Arc::clone(&fixture.shared),
        )
        .await
        .expect("pool");

        assert_eq!(report.failed, 1);
        assert_eq!(executor.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(fixture.shared.recovery.record_count(), 1);
        assert!(fixture.shared.registry.is_empty());
        assert!(report.first_fatal.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn non_retryable_failure_skips_the_retry_loop() {
        let fixture = fixture(1);
        let executor =
            ScriptedExecutor::new(Duration::from_millis(5), vec![Step::FailNotFound]);
        let jobs = send_jobs(1).await;

        let report = WorkerPool::run(
            Arc::clone(&executor),
            jobs,
            config(1, 5, false),
            Arc::clone(&fixture.shared),
        )
        .await
        .expect("pool");

        assert_eq!(report.failed, 1);
        assert_eq!(executor.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.shared.recovery.record_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_on_error_cancels_the_remaining_work() {
        let fixture = fixture(1);
        let executor =
            ScriptedExecutor::new(Duration::from_millis(10), vec![Step::FailNotFound]);
        let jobs = send_jobs(20).await;

        let result = WorkerPool::run(
            Arc::clone(&executor),
            jobs,
            config(1, 0, true),
            Arc::clone(&fixture.shared),
        )
        .await;

        let aborted = result.expect_err("first failure aborts the run");
        assert_eq!(aborted.source, "/src/0");
        assert!(fixture.shared.cancel.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_on_error_keeps_the_tallies_of_finished_work() {
        let fixture = fixture(1);
        // Two jobs land before the third one is fatal.
        let executor = ScriptedExecutor::new(
            Duration::from_millis(5),
            vec![Step::Succeed(500), Step::Succeed(250), Step::FailNotFound],
        );
        let jobs = send_jobs(10).await;

        let result = WorkerPool::run(
            Arc::clone(&executor),
            jobs,
            config(1, 0, true),
            Arc::clone(&fixture.shared),
        )
        .await;

        let aborted = result.expect_err("third job aborts the run");
        assert_eq!(aborted.report.completed, 2);
        assert_eq!(aborted.report.bytes_transferred, 750);
        assert_eq!(aborted.report.failed, 1);
        assert!(aborted.report.first_fatal.is_none());
        assert_eq!(aborted.source, "/src/2");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancellation_mid_retry_writes_no_recovery_record() {
        let fixture = fixture(1);
        // Every attempt fails transiently; generous retries keep the job
        // inside its back-off when the cancel lands.
        let executor = ScriptedExecutor::new(
            Duration::from_millis(10),
            vec![Step::FailNetwork; 50],
        );
        let jobs = send_jobs(1).await;

        let cancel = fixture.shared.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            cancel.cancel();
        });

        let report = WorkerPool::run(
            Arc::clone(&executor),
            jobs,
            config(1, 50, false),
            Arc::clone(&fixture.shared),
        )
        .await
        .expect("pool");

        assert_eq!(report.cancelled, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(fixture.shared.recovery.record_count(), 0);
        assert!(fixture.shared.registry.is_empty());
    }
}
