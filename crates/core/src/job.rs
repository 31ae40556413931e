//! Copy jobs and the external job-list line format.

use serde::{Deserialize, Serialize};

use crate::error::TransferError;

/// One unit of work: copy a single source to a single destination.
///
/// Jobs are immutable values created by the job producer and moved exactly
/// once through the job channel to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyJob {
    /// Source URI (today always a local path).
    pub source: String,
    /// Destination URI in the grammar accepted by [`crate::uri`].
    pub destination: String,
    /// Size in bytes when known at enumeration time.
    pub size: Option<u64>,
}

impl CopyJob {
    /// Creates a job with an unknown source size.
    #[must_use]
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self { source: source.into(), destination: destination.into(), size: None }
    }

    /// Creates a job with a known source size.
    #[must_use]
    pub fn with_size(source: impl Into<String>, destination: impl Into<String>, size: u64) -> Self {
        Self { source: source.into(), destination: destination.into(), size: Some(size) }
    }
}

/// Parses one line of an external job list.
///
/// The format is `source|destination`, both sides trimmed. Lines starting
/// with `#` and all-whitespace lines are skipped and yield `Ok(None)`.
///
/// # Errors
///
/// Returns [`TransferError::BadInput`] when a non-comment line has no `|`
/// separator or an empty side.
pub fn parse_job_line(line: &str) -> Result<Option<CopyJob>, TransferError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let Some((source, destination)) = trimmed.split_once('|') else {
        return Err(TransferError::bad_input(format!(
            "job list line has no '|' separator: {trimmed:?}"
        )));
    };
    let source = source.trim();
    let destination = destination.trim();
    if source.is_empty() || destination.is_empty() {
        return Err(TransferError::bad_input(format!(
            "job list line has an empty side: {trimmed:?}"
        )));
    }
    Ok(Some(CopyJob::new(source, destination)))
}

/// Formats a job as an external job-list line.
///
/// Inverse of [`parse_job_line`] for sources and destinations containing
/// neither `|` nor newlines.
#[must_use]
pub fn format_job_line(job: &CopyJob) -> String {
    format!("{}|{}", job.source, job.destination)
}
