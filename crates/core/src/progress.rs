//! In-flight transfer registry consumed by the external UI.
//!
//! Workers are the exclusive writers of their own entry; the UI reads
//! point-in-time snapshots. A snapshot taken while a worker is finishing
//! may briefly still show the finished entry.

use dashmap::DashMap;

use crate::job::CopyJob;

/// Lifecycle state of one in-flight transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    /// Queued on a worker but not yet copying.
    Pending,
    /// Bytes are flowing.
    Copying,
    /// Blocked on the pause gate.
    Paused,
    /// All bytes landed at the destination.
    Completed,
    /// All attempts failed.
    Failed,
}

/// Mutable per-transfer progress record.
///
/// The worker executing the job is the only writer; everyone else sees
/// cloned snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTransfer {
    /// Source URI, also the registry key.
    pub source: String,
    /// Destination URI.
    pub destination: String,
    /// Total size in bytes when known.
    pub total_bytes: Option<u64>,
    /// Bytes acknowledged by the destination so far.
    pub bytes_transferred: u64,
    /// Current transfer speed estimate.
    pub bytes_per_second: u64,
    /// Lifecycle state.
    pub status: TransferStatus,
}

impl ActiveTransfer {
    fn for_job(job: &CopyJob) -> Self {
        Self {
            source: job.source.clone(),
            destination: job.destination.clone(),
            total_bytes: job.size,
            bytes_transferred: 0,
            bytes_per_second: 0,
            status: TransferStatus::Pending,
        }
    }
}

/// Aggregated view over a registry snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferTotals {
    /// Entries per status, in declaration order of [`TransferStatus`].
    pub pending: usize,
    /// See [`TransferTotals::pending`].
    pub copying: usize,
    /// See [`TransferTotals::pending`].
    pub paused: usize,
    /// See [`TransferTotals::pending`].
    pub completed: usize,
    /// See [`TransferTotals::pending`].
    pub failed: usize,
    /// Sum of `bytes_transferred` across the snapshot.
    pub total_bytes_transferred: u64,
    /// Mean of the per-transfer speed estimates, zero for an empty snapshot.
    pub average_bytes_per_second: u64,
}

/// Thread-safe registry of in-flight transfers, keyed by source URI.
#[derive(Debug, Default)]
pub struct ProgressRegistry {
    entries: DashMap<String, ActiveTransfer>,
}

impl ProgressRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a `Pending` entry for a job a worker just took.
    pub fn insert(&self, job: &CopyJob) {
        self.entries.insert(job.source.clone(), ActiveTransfer::for_job(job));
    }

    /// Records progress for a transfer.
    pub fn record_progress(&self, source: &str, bytes_transferred: u64, bytes_per_second: u64) {
        if let Some(mut entry) = self.entries.get_mut(source) {
            entry.bytes_transferred = bytes_transferred;
            entry.bytes_per_second = bytes_per_second;
            entry.status = TransferStatus::Copying;
        }
    }

    /// Sets the status of a transfer.
    pub fn set_status(&self, source: &str, status: TransferStatus) {
        if let Some(mut entry) = self.entries.get_mut(source) {
            entry.status = status;
        }
    }

    /// Sets the status only when the entry currently has `from`.
    ///
    /// Used by observers that mirror an external state (the pause gate)
    /// without stomping terminal statuses.
    pub fn transition(&self, source: &str, from: TransferStatus, to: TransferStatus) {
        if let Some(mut entry) = self.entries.get_mut(source) {
            if entry.status == from {
                entry.status = to;
            }
        }
    }

    /// Resets the transferred byte count, used when a retry restarts a job.
    pub fn reset_bytes(&self, source: &str) {
        if let Some(mut entry) = self.entries.get_mut(source) {
            entry.bytes_transferred = 0;
            entry.bytes_per_second = 0;
        }
    }

    /// Removes a terminated transfer.
    pub fn remove(&self, source: &str) {
        self.entries.remove(source);
    }

    /// Number of registered transfers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clones the current entries into a point-in-time snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ActiveTransfer> {
        self.entries.iter().map(|entry| entry.value().clone()).collect()
    }
}

/// Aggregates a snapshot into totals; a pure function of its input.
#[must_use]
pub fn aggregate(snapshot: &[ActiveTransfer]) -> TransferTotals {
    let mut totals = TransferTotals::default();
    let mut speed_sum = 0u64;
    for transfer in snapshot {
        match transfer.status {
            TransferStatus::Pending => totals.pending += 1,
            TransferStatus::Copying => totals.copying += 1,
            TransferStatus::Paused => totals.paused += 1,
            TransferStatus::Completed => totals.completed += 1,
            TransferStatus::Failed => totals.failed += 1,
        }
        totals.total_bytes_transferred += transfer.bytes_transferred;
        speed_sum += transfer.bytes_per_second;
    }
    if !snapshot.is_empty() {
        totals.average_bytes_per_second = speed_sum / snapshot.len() as u64;
    }
    totals
}
