//! Transfer error taxonomy and retry classification.
//!
//! Workers retry a job only when the error kind is transient; everything
//! else is dead-lettered (or surfaced immediately when `stop_on_error` is
//! set). Cancellation is propagated unchanged and never recorded.

use std::io;

/// Error raised while executing a single copy job.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// Local filesystem or stream I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Network-level failure: connect, handshake, socket I/O.
    #[error("network error: {message}")]
    Network {
        /// Description of the failure, as reported by the transport.
        message: String,
    },

    /// Remote command or remote-shell transport failure.
    #[error("remote error: {message}")]
    Remote {
        /// Remote diagnostics, reported verbatim.
        message: String,
    },

    /// Authentication or authorization was rejected.
    #[error("authentication failed: {message}")]
    Auth {
        /// Description of the rejected method(s).
        message: String,
    },

    /// Destination URI, size argument, or job input was malformed.
    #[error("invalid input: {message}")]
    BadInput {
        /// What was wrong with the input.
        message: String,
    },

    /// The source path does not exist.
    #[error("source not found: {path}")]
    SourceNotFound {
        /// The missing path or URI.
        path: String,
    },

    /// A source with a declared size ended before yielding all its bytes.
    #[error("source ended prematurely: expected {expected} bytes, got {actual}")]
    SourceTruncated {
        /// Declared size in bytes.
        expected: u64,
        /// Bytes actually produced.
        actual: u64,
    },

    /// An operation exceeded its transport timeout.
    #[error("operation timed out after {seconds}s")]
    Timeout {
        /// The configured timeout in whole seconds.
        seconds: u64,
    },

    /// The run was cancelled.
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// Convenience constructor for [`TransferError::Network`].
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Convenience constructor for [`TransferError::Remote`].
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote { message: message.into() }
    }

    /// Convenience constructor for [`TransferError::Auth`].
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth { message: message.into() }
    }

    /// Convenience constructor for [`TransferError::BadInput`].
    pub fn bad_input(message: impl Into<String>) -> Self {
        Self::BadInput { message: message.into() }
    }

    /// Whether a worker may retry the job after this error.
    ///
    /// Transient I/O, network, and remote-shell failures are retryable.
    /// Auth rejections, malformed input, missing or truncated sources, and
    /// cancellation are not. Missing files and permission errors surfaced
    /// as raw I/O errors classify the same way as their dedicated variants.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(error) => !matches!(
                error.kind(),
                io::ErrorKind::NotFound
                    | io::ErrorKind::PermissionDenied
                    | io::ErrorKind::UnexpectedEof
            ),
            Self::Network { .. } | Self::Remote { .. } | Self::Timeout { .. } => true,
            Self::Auth { .. }
            | Self::BadInput { .. }
            | Self::SourceNotFound { .. }
            | Self::SourceTruncated { .. }
            | Self::Cancelled => false,
        }
    }

    /// Whether this error is the cancellation signal.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<bandwidth::WaitCancelled> for TransferError {
    fn from(_: bandwidth::WaitCancelled) -> Self {
        Self::Cancelled
    }
}
