#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! Destination transports.
//!
//! A [`Transport`] consumes a byte stream and lands it at a parsed
//! [`Destination`]: the local filesystem, an SFTP host, a Docker
//! container, or a Kubernetes pod. The container and pod variants share
//! the streaming [`tar::TarFrame`] USTAR framer and an external extract
//! process; SFTP owns a per-host session pool.
//!
//! Construction goes through the [`TransportFactory`], which holds the
//! run-wide transport configuration and the shared SFTP pool. URI scheme
//! dispatch happens in `fastcopy_core::uri`; unknown schemes never reach
//! this crate.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;

use fastcopy_core::{Destination, TransferError};
use transfer::{CopyContext, ProgressFn};

mod local;
mod remote_exec;
mod sftp;
pub mod tar;

pub use crate::local::LocalTransport;
pub use crate::remote_exec::{ContainerTransport, PodTransport};
pub use crate::sftp::{SftpPool, SftpTransport};

/// Run-wide transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Verify SSH server keys against `known_hosts`. Off trusts any host
    /// key (test mode).
    pub verify_host_keys: bool,
    /// Explicit SSH private key tried before discovered keys.
    pub ssh_key_file: Option<PathBuf>,
    /// Timeout applied to individual SFTP operations.
    pub operation_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            verify_host_keys: true,
            ssh_key_file: None,
            operation_timeout: Duration::from_secs(30),
        }
    }
}

/// Builds transports for parsed destinations, sharing pooled resources
/// across a run.
#[derive(Debug)]
pub struct TransportFactory {
    sftp_pool: Arc<SftpPool>,
}

impl TransportFactory {
    /// Creates a factory with the given configuration.
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self { sftp_pool: Arc::new(SftpPool::new(config)) }
    }

    /// Maps a parsed destination to its transport.
    #[must_use]
    pub fn create(&self, destination: &Destination) -> Transport {
        match destination {
            Destination::Local(path) => Transport::Local(LocalTransport::new(path.clone())),
            Destination::Sftp(target) => {
                Transport::Sftp(SftpTransport::new(target.clone(), Arc::clone(&self.sftp_pool)))
            }
            Destination::Container { container_id, path } => Transport::Container(
                ContainerTransport::new(container_id.clone(), path.clone()),
            ),
            Destination::Pod { namespace, pod, path } => Transport::Pod(PodTransport::new(
                namespace.clone(),
                pod.clone(),
                path.clone(),
            )),
        }
    }

    /// Parses a destination URI and maps it to a transport.
    ///
    /// # Errors
    ///
    /// Rejects unknown schemes and malformed URIs with
    /// [`TransferError::BadInput`].
    pub fn create_for_uri(&self, uri: &str) -> Result<Transport, TransferError> {
        Ok(self.create(&Destination::parse(uri)?))
    }
}

impl Default for TransportFactory {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

/// The closed set of destination transports.
#[derive(Debug, Clone)]
pub enum Transport {
    /// Local filesystem.
    Local(LocalTransport),
    /// SFTP over SSH.
    Sftp(SftpTransport),
    /// Docker container.
    Container(ContainerTransport),
    /// Kubernetes pod.
    Pod(PodTransport),
}

impl Transport {
    /// Streams `source` to this transport's destination.
    ///
    /// `size` is the declared source size; the container and pod variants
    /// require it for archive framing, the others use it for
    /// pre-allocation when present.
    pub async fn copy_stream_to<R>(
        &self,
        source: R,
        size: Option<u64>,
        ctx: &CopyContext,
        on_progress: Option<ProgressFn<'_>>,
    ) -> Result<u64, TransferError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        match self {
            Self::Local(transport) => transport.copy_stream_to(source, size, ctx, on_progress).await,
            Self::Sftp(transport) => transport.copy_stream_to(source, size, ctx, on_progress).await,
            Self::Container(transport) => {
                transport.copy_stream_to(source, size, ctx, on_progress).await
            }
            Self::Pod(transport) => transport.copy_stream_to(source, size, ctx, on_progress).await,
        }
    }
}
