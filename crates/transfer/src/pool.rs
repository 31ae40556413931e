//! Process-wide pool of copy buffers.
//!
//! Every in-flight segment borrows one buffer; the pool caps how much
//! buffer memory the process retains across transfers. Buffers return to
//! the pool on drop, which covers error paths and cancelled transfers
//! without any bookkeeping at the call sites.

use std::ops::{Deref, DerefMut};
use std::sync::OnceLock;

use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;

/// Size of one pipe segment.
pub const SEGMENT_SIZE: usize = 64 * 1024;

/// Buffers retained when idle; excess buffers are simply freed.
const POOL_CAPACITY: usize = 256;

/// Shared pool of [`SEGMENT_SIZE`] byte buffers.
#[derive(Debug)]
pub struct BufferPool {
    buffers: ArrayQueue<BytesMut>,
}

impl BufferPool {
    fn new() -> Self {
        Self { buffers: ArrayQueue::new(POOL_CAPACITY) }
    }

    /// Returns the process-wide pool.
    pub fn global() -> &'static Self {
        static POOL: OnceLock<BufferPool> = OnceLock::new();
        POOL.get_or_init(Self::new)
    }

    /// Rents an empty buffer with [`SEGMENT_SIZE`] capacity.
    #[must_use]
    pub fn rent(&'static self) -> PooledBuf {
        let buf = self
            .buffers
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(SEGMENT_SIZE));
        PooledBuf { pool: self, buf: Some(buf) }
    }

    fn give_back(&self, mut buf: BytesMut) {
        buf.clear();
        // At capacity the buffer is dropped instead of retained.
        let _ = self.buffers.push(buf);
    }

    #[cfg(test)]
    pub(crate) fn idle_for_testing(&self) -> usize {
        self.buffers.len()
    }
}

/// A rented buffer that returns itself to the pool on drop.
#[derive(Debug)]
pub struct PooledBuf {
    pool: &'static BufferPool,
    buf: Option<BytesMut>,
}

impl Deref for PooledBuf {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().expect("buffer present until drop")
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer present until drop")
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(buf);
        }
    }
}
