#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! Run orchestration for FastCopy.
//!
//! The [`Controller`] composes one copy run: it builds the shared rate
//! limiter, pause gate, journal, recovery store, and resource watchdog,
//! starts the [`pool`] of workers over a bounded job channel fed by the
//! [`producer`], wires the external control channel (pause toggle, rate
//! retarget, parallelism delta), and finalizes the run with a flush of
//! both persistent stores, the optional completion command, and the
//! optional source deletion.
//!
//! The command-line front end and the dashboard are external to this
//! workspace; they consume [`RunSummary`], the progress registry, and the
//! [`ControlEvent`] channel.

pub mod controller;
pub mod executor;
pub mod pool;
pub mod producer;
pub mod trace;
pub mod watchdog;

use std::io;

use fastcopy_core::TransferError;

pub use crate::controller::{
    ControlEvent, Controller, RunOptions, RunOutcome, RunSummary, journal_entries,
};
pub use crate::executor::{Executor, TransportExecutor};
pub use crate::pool::{PoolAborted, PoolConfig, PoolReport, WorkerPool};
pub use crate::producer::JobSource;
pub use crate::watchdog::{ResourceSnapshot, ResourceWatchdog};

/// Error surfaced at the controller boundary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A transfer-level failure escaped the run (bad input, fatal setup).
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// The journal could not be opened or maintained.
    #[error(transparent)]
    Journal(#[from] journal::JournalError),

    /// The recovery store could not be created or flushed.
    #[error(transparent)]
    Recovery(#[from] recovery::RecoveryError),

    /// Filesystem failure outside a transfer (enumeration, finalization).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
