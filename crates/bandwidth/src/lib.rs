#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `bandwidth` centralises FastCopy's throughput control. The crate exposes
//! a parser for textual rate arguments together with a [`RateLimiter`] token
//! bucket that every concurrent transfer debits before writing a segment to
//! its destination. The controller owns one limiter per run and hands out
//! shared references; there are no process globals.
//!
//! # Design
//!
//! - [`parse_rate_limit`] accepts `<number>[unit]` specifications with
//!   optional decimals and binary (1024-based) units from `B` through `TB`,
//!   returning a byte-per-second rate or a [`RateParseError`]. A rate of `0`
//!   means unlimited.
//! - [`RateLimiter`] keeps its bucket in fixed-point atomics so `consume` can
//!   be called from any number of workers without taking a lock. Refill
//!   intervals are claimed with a compare-and-swap on the last-refill
//!   timestamp, debits are a `fetch_sub` that rolls back on overdraft, and
//!   blocked callers park with a bounded, deficit-scaled back-off.
//!
//! # Invariants
//!
//! - Bytes admitted over any window of at least one second never exceed the
//!   configured limit by more than the one-second burst allowance.
//! - [`RateLimiter::set_limit`] takes effect without waking every caller
//!   explicitly: parked callers re-read the configuration after at most one
//!   back-off interval, so retargeting to `0` (bypass) cannot deadlock them.

mod limiter;
mod parse;

pub use crate::limiter::{RateLimiter, WaitCancelled};
pub use crate::parse::{RateParseError, format_rate, parse_rate_limit};
