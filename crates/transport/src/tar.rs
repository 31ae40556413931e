//! Streaming USTAR framer.
//!
//! Wraps a byte stream and a `(name, size)` pair as a POSIX-1988 tar
//! archive containing exactly one regular file: a 512-byte header, `size`
//! content bytes, zero padding to the next 512-byte boundary, and two
//! 512-byte zero blocks terminating the archive. The container and pod
//! transports pipe this stream into their respective extract operations.
//!
//! The framer is a state machine over four phases; each successful read
//! emits bytes from exactly one phase.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;

use bandwidth::RateLimiter;

/// Tar block size; every archive structure is padded to this.
pub const BLOCK_SIZE: usize = 512;

/// Length of the two-block end-of-archive marker.
const TERMINATOR_LEN: usize = 2 * BLOCK_SIZE;

/// Largest name the USTAR `name` field holds; longer names are truncated.
const NAME_FIELD_LEN: usize = 100;

/// Tokens requested from the integrated limiter per grant.
const RATE_CHUNK: u64 = 32 * 1024;

const ZERO_BLOCK: [u8; BLOCK_SIZE] = [0u8; BLOCK_SIZE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Header,
    Content,
    Padding,
    Terminator,
    Done,
}

type RateWait = Pin<Box<dyn Future<Output = Result<(), bandwidth::WaitCancelled>> + Send>>;

/// Total bytes the archive stream for a `size`-byte file emits.
#[must_use]
pub fn framed_size(size: u64) -> u64 {
    BLOCK_SIZE as u64 + size + pad_len(size) as u64 + TERMINATOR_LEN as u64
}

fn pad_len(size: u64) -> usize {
    ((BLOCK_SIZE as u64 - size % BLOCK_SIZE as u64) % BLOCK_SIZE as u64) as usize
}

/// A readable stream that frames `inner` as a single-entry USTAR archive.
///
/// `inner` must yield exactly `size` bytes; an early end of stream fails
/// the frame with [`io::ErrorKind::UnexpectedEof`] ("source ended
/// prematurely"). An optional integrated rate limit paces the content
/// phase only; header, padding, and terminator bytes are never throttled.
pub struct TarFrame<R> {
    inner: R,
    header: Box<[u8; BLOCK_SIZE]>,
    phase: Phase,
    /// Progress inside the current phase, in bytes.
    cursor: usize,
    size: u64,
    produced: u64,
    scratch: Box<[u8]>,
    rate: Option<(Arc<RateLimiter>, CancellationToken)>,
    rate_wait: Option<RateWait>,
    /// Content bytes the limiter has already granted.
    granted: u64,
    /// Size of the grant an in-flight `rate_wait` will deliver.
    pending_grant: u64,
}

impl<R> TarFrame<R> {
    /// Frames `inner` as an archive holding one regular file `name` of
    /// exactly `size` bytes.
    pub fn new(inner: R, name: &str, size: u64) -> Self {
        let mtime = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs());
        Self {
            inner,
            header: Box::new(build_header(name, size, mtime)),
            phase: Phase::Header,
            cursor: 0,
            size,
            produced: 0,
            scratch: vec![0u8; RATE_CHUNK as usize].into_boxed_slice(),
            rate: None,
            rate_wait: None,
            granted: 0,
            pending_grant: 0,
        }
    }

    /// Applies a content-phase rate limit to the frame.
    #[must_use]
    pub fn with_rate_limit(mut self, limiter: Arc<RateLimiter>, cancel: CancellationToken) -> Self {
        self.rate = Some((limiter, cancel));
        self
    }

    /// The declared content size.
    #[must_use]
    pub fn content_size(&self) -> u64 {
        self.size
    }

    /// Drives the integrated limiter until content bytes are granted.
    ///
    /// `Ready(Ok(()))` means the content read may proceed; errors mean the
    /// wait was cancelled.
    fn poll_rate_grant(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.granted > 0 {
            return Poll::Ready(Ok(()));
        }
        let Some((limiter, cancel)) = self.rate.as_ref() else {
            return Poll::Ready(Ok(()));
        };

        if self.rate_wait.is_none() {
            let chunk = RATE_CHUNK.min(self.size - self.produced).max(1);
            let limiter = Arc::clone(limiter);
            let cancel = cancel.clone();
            self.pending_grant = chunk;
            self.rate_wait = Some(Box::pin(async move { limiter.consume(chunk, &cancel).await }));
        }
        let Some(wait) = self.rate_wait.as_mut() else {
            return Poll::Ready(Ok(()));
        };

        match wait.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(())) => {
                self.rate_wait = None;
                self.granted = self.pending_grant;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(_)) => {
                self.rate_wait = None;
                Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "rate limiter wait cancelled",
                )))
            }
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for TarFrame<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        match this.phase {
            Phase::Header => {
                let n = buf.remaining().min(BLOCK_SIZE - this.cursor);
                buf.put_slice(&this.header[this.cursor..this.cursor + n]);
                this.cursor += n;
                if this.cursor == BLOCK_SIZE {
                    this.cursor = 0;
                    this.phase = if this.size == 0 { Phase::Terminator } else { Phase::Content };
                }
                Poll::Ready(Ok(()))
            }
            Phase::Content => {
                ready!(this.poll_rate_grant(cx))?;

                let remaining_content = usize::try_from(this.size - this.produced)
                    .unwrap_or(usize::MAX);
                let mut n = buf.remaining().min(remaining_content).min(this.scratch.len());
                if this.rate.is_some() {
                    n = n.min(this.granted as usize);
                }

                let mut scratch_buf = ReadBuf::new(&mut this.scratch[..n]);
                ready!(Pin::new(&mut this.inner).poll_read(cx, &mut scratch_buf))?;
                let read = scratch_buf.filled().len();
                if read == 0 {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "source ended prematurely: expected {} bytes, got {}",
                            this.size, this.produced
                        ),
                    )));
                }

                buf.put_slice(&this.scratch[..read]);
                this.produced += read as u64;
                this.granted = this.granted.saturating_sub(read as u64);
                if this.produced == this.size {
                    this.cursor = 0;
                    this.phase =
                        if pad_len(this.size) == 0 { Phase::Terminator } else { Phase::Padding };
                }
                Poll::Ready(Ok(()))
            }
            Phase::Padding => {
                let pad = pad_len(this.size);
                let n = buf.remaining().min(pad - this.cursor);
                buf.put_slice(&ZERO_BLOCK[..n]);
                this.cursor += n;
                if this.cursor == pad {
                    this.cursor = 0;
                    this.phase = Phase::Terminator;
                }
                Poll::Ready(Ok(()))
            }
            Phase::Terminator => {
                let n = buf.remaining().min(TERMINATOR_LEN - this.cursor).min(BLOCK_SIZE);
                buf.put_slice(&ZERO_BLOCK[..n]);
                this.cursor += n;
                if this.cursor == TERMINATOR_LEN {
                    this.phase = Phase::Done;
                }
                Poll::Ready(Ok(()))
            }
            Phase::Done => Poll::Ready(Ok(())),
        }
    }
}

/// Builds the 512-byte USTAR header for one regular file.
///
/// Mode `0644`, uid/gid `0`, octal size and mtime, typeflag `'0'`, magic
/// `"ustar\0"`, version `"00"`. The checksum is the unsigned sum of all
/// header bytes with the checksum field read as eight spaces, written as
/// six octal digits, NUL, space.
fn build_header(name: &str, size: u64, mtime: u64) -> [u8; BLOCK_SIZE] {
    let mut header = [0u8; BLOCK_SIZE];

    let name = truncate_name(name);
    header[..name.len()].copy_from_slice(name.as_bytes());

    write_octal(&mut header[100..108], 0o644, 7);
    write_octal(&mut header[108..116], 0, 7);
    write_octal(&mut header[116..124], 0, 7);
    write_octal(&mut header[124..136], size, 11);
    write_octal(&mut header[136..148], mtime, 11);

    // The checksum field counts as eight spaces while the sum is computed.
    header[148..156].copy_from_slice(b"        ");
    header[156] = b'0';
    header[257..263].copy_from_slice(b"ustar\0");
    header[263..265].copy_from_slice(b"00");

    let checksum: u32 = header.iter().map(|byte| u32::from(*byte)).sum();
    let mut field = [0u8; 8];
    write_octal_digits(&mut field[..6], u64::from(checksum));
    field[6] = 0;
    field[7] = b' ';
    header[148..156].copy_from_slice(&field);

    header
}

/// Writes `value` into `field` as zero-padded octal digits followed by a
/// NUL; `digits` is the digit count, `field` must be one byte longer.
fn write_octal(field: &mut [u8], value: u64, digits: usize) {
    write_octal_digits(&mut field[..digits], value);
    field[digits] = 0;
}

fn write_octal_digits(field: &mut [u8], mut value: u64) {
    for slot in field.iter_mut().rev() {
        *slot = b'0' + (value % 8) as u8;
        value /= 8;
    }
}

/// Truncates a name to the 100-byte USTAR field on a char boundary.
fn truncate_name(name: &str) -> &str {
    if name.len() <= NAME_FIELD_LEN {
        return name;
    }
    let mut end = NAME_FIELD_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}
