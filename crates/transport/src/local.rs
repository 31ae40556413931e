//! Local filesystem transport.

use std::path::PathBuf;

use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::debug;

use fastcopy_core::TransferError;
use transfer::{CopyContext, ProgressFn, copy_stream};

/// Lands a byte stream at a local path.
///
/// Parent directories are created, the destination is opened in
/// create/truncate mode, and the file is pre-allocated when the source
/// size is known.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    path: PathBuf,
}

impl LocalTransport {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Streams `source` into the destination file.
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
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let mut sink =
            fs::OpenOptions::new().create(true).truncate(true).write(true).open(&self.path).await?;
        if let Some(size) = size {
            if size > 0 {
                sink.set_len(size).await?;
            }
        }

        let total = copy_stream(source, &mut sink, size, ctx, on_progress).await?;
        sink.shutdown().await?;
        debug!(path = %self.path.display(), total, "local transport delivered");
        Ok(total)
    }
}
