#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! Shared model for the FastCopy transfer engine.
//!
//! This crate holds the vocabulary the rest of the workspace speaks:
//! [`CopyJob`] values produced by enumeration and consumed by the worker
//! pool, the [`TransferError`] taxonomy with its retry classification, the
//! [`PauseGate`] every I/O step observes, destination [`uri`] parsing, the
//! [`progress`] registry the UI snapshots, and the [`ExitCode`] mapping at
//! the controller boundary.
//!
//! Nothing here performs I/O; the components that do (transfer engine,
//! transports, journal, recovery store) depend on this crate rather than on
//! each other.

pub mod error;
pub mod exit_code;
pub mod job;
pub mod pause;
pub mod progress;
pub mod uri;

pub use crate::error::TransferError;
pub use crate::exit_code::ExitCode;
pub use crate::job::{CopyJob, format_job_line, parse_job_line};
pub use crate::pause::PauseGate;
pub use crate::progress::{ActiveTransfer, ProgressRegistry, TransferStatus, TransferTotals};
pub use crate::uri::{Destination, SftpTarget};
