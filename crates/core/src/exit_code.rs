//! Process exit codes at the controller boundary.

use std::fmt;

/// Exit status a run maps to when embedded in a command-line front end.
///
/// A clean drain exits zero even when individual jobs were dead-lettered;
/// callers inspect the run summary for per-job outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ExitCode {
    /// The run drained normally.
    Success = 0,

    /// A worker surfaced an unrecoverable error while `stop_on_error` was
    /// set.
    Failure = 1,

    /// The run was cancelled, conventionally 128 + SIGINT.
    Interrupted = 130,
}

impl ExitCode {
    /// Returns the numeric status.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Short human-readable description.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Success => "completed",
            Self::Failure => "failed",
            Self::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_i32(), self.description())
    }
}
