//! The copy loop: source -> bounded pipe -> sink.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use bytes::BufMut;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use bandwidth::RateLimiter;
use fastcopy_core::{PauseGate, TransferError};

use crate::pool::{BufferPool, PooledBuf, SEGMENT_SIZE};

/// Segments the pipe holds before the producer is parked.
///
/// Together with [`SEGMENT_SIZE`] this bounds the memory one in-flight
/// transfer can pin: 16 x 64 KiB = 1 MiB.
const PIPE_SEGMENTS: usize = 16;

/// Progress sample emitted after each segment is acknowledged by the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Bytes the sink has acknowledged so far. Non-decreasing.
    pub total_copied: u64,
    /// Declared source size, when known.
    pub total_known: Option<u64>,
    /// `total_copied / elapsed` over the whole transfer.
    pub bytes_per_second: u64,
}

/// Callback receiving [`Progress`] samples.
pub type ProgressFn<'a> = &'a mut (dyn FnMut(Progress) + Send);

/// Shared controls threaded through one copy.
///
/// The limiter and gate are optional so the engine can be exercised
/// standalone; the worker pool always provides both.
#[derive(Debug, Clone, Default)]
pub struct CopyContext {
    /// Global token bucket debited per segment.
    pub limiter: Option<Arc<RateLimiter>>,
    /// Pause gate observed before each segment write.
    pub pause: Option<Arc<PauseGate>>,
    /// Cancellation signal observed at every suspension point.
    pub cancel: CancellationToken,
}

impl CopyContext {
    /// Context with only a cancellation token, no pacing.
    #[must_use]
    pub fn unpaced(cancel: CancellationToken) -> Self {
        Self { limiter: None, pause: None, cancel }
    }
}

/// Streams all bytes of `source` into `sink` through the bounded pipe.
///
/// Per segment, in order: pause gate, rate limiter, sink write, progress
/// callback. Returns the total number of bytes written.
///
/// # Errors
///
/// The first fatal error from either side of the pipe: source read
/// failures, sink write failures, or [`TransferError::Cancelled`].
pub async fn copy_stream<R, W>(
    source: R,
    sink: &mut W,
    total_known: Option<u64>,
    ctx: &CopyContext,
    mut on_progress: Option<ProgressFn<'_>>,
) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + ?Sized,
{
    let (tx, mut rx) = mpsc::channel::<Result<PooledBuf, io::Error>>(PIPE_SEGMENTS);
    let producer = tokio::spawn(produce(source, tx));

    let started = Instant::now();
    let mut total: u64 = 0;
    let mut failure: Option<TransferError> = None;

    loop {
        let segment = tokio::select! {
            () = ctx.cancel.cancelled() => {
                failure = Some(TransferError::Cancelled);
                break;
            }
            segment = rx.recv() => segment,
        };
        let Some(segment) = segment else {
            // Producer completed and the pipe drained.
            break;
        };
        let buf = match segment {
            Ok(buf) => buf,
            Err(error) => {
                failure = Some(error.into());
                break;
            }
        };

        if let Err(error) = deliver(&buf, sink, ctx).await {
            failure = Some(error);
            break;
        }
        total += buf.len() as u64;
        drop(buf);

        if let Some(callback) = on_progress.as_deref_mut() {
            callback(progress_sample(total, total_known, started));
        }
    }

    // Closing the receiver unblocks a producer parked on a full pipe;
    // aborting covers one parked in a source read.
    rx.close();
    producer.abort();
    let _ = producer.await;

    if let Some(error) = failure {
        return Err(error);
    }

    sink.flush().await.map_err(TransferError::from)?;
    if let Some(callback) = on_progress.as_deref_mut() {
        callback(progress_sample(total, total_known, started));
    }
    trace!(total, "copy stream complete");
    Ok(total)
}

/// Producer half: fill pooled buffers from the source and push them into
/// the pipe until EOF or error.
async fn produce<R>(mut source: R, tx: mpsc::Sender<Result<PooledBuf, io::Error>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    loop {
        let mut buf = BufferPool::global().rent();
        let read = {
            let mut limited = (&mut *buf).limit(SEGMENT_SIZE);
            source.read_buf(&mut limited).await
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(Ok(buf)).await.is_err() {
                    // Consumer went away; its error wins.
                    break;
                }
            }
            Err(error) => {
                let _ = tx.send(Err(error)).await;
                break;
            }
        }
    }
}

/// Consumer steps for one segment: gate, limiter, write.
async fn deliver<W>(segment: &PooledBuf, sink: &mut W, ctx: &CopyContext) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if let Some(gate) = &ctx.pause {
        gate.wait_while_paused(&ctx.cancel).await?;
    }
    if let Some(limiter) = &ctx.limiter {
        limiter.consume(segment.len() as u64, &ctx.cancel).await?;
    }
    sink.write_all(segment).await?;
    Ok(())
}

fn progress_sample(total: u64, total_known: Option<u64>, started: Instant) -> Progress {
    let elapsed = started.elapsed().as_secs_f64();
    let bytes_per_second = if elapsed > 0.0 { (total as f64 / elapsed) as u64 } else { 0 };
    Progress { total_copied: total, total_known, bytes_per_second }
}

/// Copies a local file to a local path through the streaming engine.
///
/// Creates the destination's parent directories, opens it in
/// create/truncate mode, and pre-allocates it when the source size is
/// known so large destinations land without incremental growth.
///
/// # Errors
///
/// [`TransferError::SourceNotFound`] when the source path does not exist,
/// otherwise the first error from the copy loop.
pub async fn copy_file(
    source: &Path,
    destination: &Path,
    ctx: &CopyContext,
    on_progress: Option<ProgressFn<'_>>,
) -> Result<u64, TransferError> {
    let file = match fs::File::open(source).await {
        Ok(file) => file,
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            return Err(TransferError::SourceNotFound { path: source.display().to_string() });
        }
        Err(error) => return Err(error.into()),
    };
    let size = file.metadata().await?.len();

    if let Some(parent) = destination.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let mut sink = fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(destination)
        .await?;
    if size > 0 {
        sink.set_len(size).await?;
    }

    let total = copy_stream(file, &mut sink, Some(size), ctx, on_progress).await?;
    sink.shutdown().await?;
    Ok(total)
}
