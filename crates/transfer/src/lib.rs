#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

//! Streaming copy engine.
//!
//! One transfer is a producer/consumer pair joined by a bounded in-memory
//! pipe. The producer reads the source into buffers rented from a
//! process-wide pool and pushes them through the pipe; the consumer
//! observes the pause gate, debits the rate limiter, writes the segment to
//! the sink, and publishes progress - in that order, for every segment.
//! The pipe's bound is the only synchronisation between the two sides:
//! a full pipe parks the producer, an empty pipe parks the consumer, and
//! neither ever polls.
//!
//! [`copy_stream`] is the transport-facing entry point; [`copy_file`] is
//! the local-filesystem convenience that opens both ends and pre-allocates
//! the destination when the size is known.

mod copy;
mod pool;

pub use crate::copy::{CopyContext, Progress, ProgressFn, copy_file, copy_stream};
pub use crate::pool::{BufferPool, PooledBuf, SEGMENT_SIZE};
