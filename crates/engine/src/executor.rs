//! Job execution seam between the worker pool and the transports.
//!
//! The pool only knows how to drive an [`Executor`]; the production
//! implementation opens the local source and hands it to the transport
//! selected by the destination URI. Tests substitute their own executors
//! to exercise retry and classification behavior without touching real
//! destinations.

use std::future::Future;
use std::io;
use std::path::Path;

use tokio::fs;

use fastcopy_core::{CopyJob, TransferError};
use transfer::{CopyContext, ProgressFn};
use transport::TransportFactory;

/// Executes one job attempt.
pub trait Executor: Send + Sync + 'static {
    /// Runs the job once, reporting progress through `on_progress`.
    ///
    /// Returns the number of bytes delivered to the destination.
    fn execute<'a>(
        &'a self,
        job: &'a CopyJob,
        ctx: &'a CopyContext,
        on_progress: ProgressFn<'a>,
    ) -> impl Future<Output = Result<u64, TransferError>> + Send + 'a;
}

/// Production executor: local source file, transport chosen by the
/// destination URI.
#[derive(Debug, Default)]
pub struct TransportExecutor {
    factory: TransportFactory,
}

impl TransportExecutor {
    /// Creates an executor sharing the given transport factory state.
    #[must_use]
    pub fn new(factory: TransportFactory) -> Self {
        Self { factory }
    }
}

impl Executor for TransportExecutor {
    fn execute<'a>(
        &'a self,
        job: &'a CopyJob,
        ctx: &'a CopyContext,
        on_progress: ProgressFn<'a>,
    ) -> impl Future<Output = Result<u64, TransferError>> + Send + 'a {
        async move {
            let transport = self.factory.create_for_uri(&job.destination)?;

            let source = match fs::File::open(Path::new(&job.source)).await {
                Ok(file) => file,
                Err(error) if error.kind() == io::ErrorKind::NotFound => {
                    return Err(TransferError::SourceNotFound { path: job.source.clone() });
                }
                Err(error) => return Err(error.into()),
            };
            let size = match job.size {
                Some(size) => size,
                None => source.metadata().await?.len(),
            };

            transport.copy_stream_to(source, Some(size), ctx, Some(on_progress)).await
        }
    }
}
