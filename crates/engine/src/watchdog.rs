//! Resource watchdog advising the worker pool's parallelism ceiling.
//!
//! Every 500 ms the watchdog samples the process working set and CPU
//! fraction. When a memory cap is configured and exceeded, the ceiling
//! shrinks to three quarters (never below one worker); once usage falls
//! under 85 % of the cap the ceiling recovers one worker per sample up to
//! its initial value. The pool checks the ceiling before admitting each
//! job; nothing is rebuilt when the ceiling moves.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use sysinfo::System;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Sampling period.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Fraction of the memory cap under which the ceiling may recover.
const RECOVERY_FRACTION: f64 = 0.85;

/// Point-in-time resource reading published by the watchdog.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSnapshot {
    /// Process working set in bytes.
    pub memory_bytes: u64,
    /// Process CPU usage as a fraction of one core.
    pub cpu_fraction: f32,
    /// Current advised parallelism ceiling.
    pub current_parallelism_ceiling: usize,
    /// Whether the last sample shrank the ceiling.
    pub throttled: bool,
}

/// Samples process resources and advises a parallelism ceiling.
#[derive(Debug)]
pub struct ResourceWatchdog {
    initial_ceiling: usize,
    max_memory_bytes: Option<u64>,
    ceiling: AtomicUsize,
    snapshot: Mutex<ResourceSnapshot>,
}

impl ResourceWatchdog {
    /// Creates a watchdog advising at most `initial_ceiling` workers,
    /// throttling when the working set exceeds `max_memory_bytes`.
    #[must_use]
    pub fn new(initial_ceiling: usize, max_memory_bytes: Option<u64>) -> Arc<Self> {
        let initial_ceiling = initial_ceiling.max(1);
        Arc::new(Self {
            initial_ceiling,
            max_memory_bytes,
            ceiling: AtomicUsize::new(initial_ceiling),
            snapshot: Mutex::new(ResourceSnapshot {
                memory_bytes: 0,
                cpu_fraction: 0.0,
                current_parallelism_ceiling: initial_ceiling,
                throttled: false,
            }),
        })
    }

    /// The currently advised ceiling.
    #[must_use]
    pub fn ceiling(&self) -> usize {
        self.ceiling.load(Ordering::Acquire)
    }

    /// The latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ResourceSnapshot {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the sampling loop; it stops when `cancel` fires.
    pub fn run(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let watchdog = Arc::clone(self);
        tokio::spawn(async move {
            let Ok(pid) = sysinfo::get_current_pid() else {
                warn!("cannot determine own pid; resource watchdog disabled");
                return;
            };
            let mut system = System::new();
            let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                system.refresh_all();
                let Some(process) = system.process(pid) else { continue };
                watchdog.apply_sample(process.memory(), process.cpu_usage() / 100.0);
            }
        })
    }

    /// Folds one sample into the ceiling and publishes the snapshot.
    fn apply_sample(&self, memory_bytes: u64, cpu_fraction: f32) {
        let mut throttled = false;
        let mut ceiling = self.ceiling.load(Ordering::Acquire);

        if let Some(cap) = self.max_memory_bytes {
            if memory_bytes > cap {
                let reduced = (ceiling * 3 / 4).max(1);
                if reduced < ceiling {
                    debug!(ceiling = reduced, memory_bytes, "memory over cap, throttling");
                }
                ceiling = reduced;
                throttled = true;
            } else if (memory_bytes as f64) < cap as f64 * RECOVERY_FRACTION
                && ceiling < self.initial_ceiling
            {
                ceiling += 1;
                debug!(ceiling, "memory back under cap, raising ceiling");
            }
        }

        self.ceiling.store(ceiling, Ordering::Release);
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = ResourceSnapshot {
            memory_bytes,
            cpu_fraction,
            current_parallelism_ceiling: ceiling,
            throttled,
        };
    }
}
