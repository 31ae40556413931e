use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Fixed-point scale applied to token counts for sub-byte refill precision.
const SCALE: u64 = 1000;

const MICROS_PER_SECOND: u64 = 1_000_000;

/// First back-off interval for a caller that found the bucket empty.
const INITIAL_BACKOFF_US: u64 = 1_000;

/// Upper bound on a single park so limit retargets and cancellation become
/// visible promptly.
const MAX_BACKOFF_US: u64 = 50_000;

/// Error returned when a [`RateLimiter::consume`] wait is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rate limiter wait cancelled")]
pub struct WaitCancelled;

/// Process-wide token bucket shared by every concurrent transfer.
///
/// All state lives in atomics: `consume` never takes a lock. Refill
/// intervals are claimed by a compare-and-swap on the last-refill timestamp
/// so exactly one caller accounts for each stretch of elapsed time, debits
/// are a `fetch_sub` rolled back on overdraft, and callers that cannot be
/// served park with a deficit-scaled back-off bounded by
/// [`MAX_BACKOFF_US`].
///
/// The bucket capacity equals one second of the configured rate, which is
/// the burst allowance the throughput invariant permits.
#[derive(Debug)]
pub struct RateLimiter {
    /// Available tokens, scaled by [`SCALE`]. May transiently exceed
    /// `max_scaled` while an overdrawn debit is rolled back.
    tokens: AtomicI64,
    /// Bucket capacity, scaled.
    max_scaled: AtomicI64,
    /// Refill rate in scaled tokens per second.
    refill_per_second: AtomicU64,
    /// Microseconds since `epoch` at which the bucket was last refilled.
    last_refill_us: AtomicU64,
    /// When set, `consume` returns immediately without debiting.
    bypass: AtomicBool,
    epoch: Instant,
}

impl RateLimiter {
    /// Creates a limiter for the given rate in bytes per second.
    ///
    /// A rate of `0` constructs the limiter in bypass mode; a later
    /// [`set_limit`](Self::set_limit) can enable throttling.
    #[must_use]
    pub fn new(bytes_per_second: u64) -> Self {
        let scaled = scale_rate(bytes_per_second);
        Self {
            tokens: AtomicI64::new(scaled as i64),
            max_scaled: AtomicI64::new(scaled as i64),
            refill_per_second: AtomicU64::new(scaled),
            last_refill_us: AtomicU64::new(0),
            bypass: AtomicBool::new(bytes_per_second == 0),
            epoch: Instant::now(),
        }
    }

    /// Returns the configured rate in bytes per second, `0` when unlimited.
    #[must_use]
    pub fn limit(&self) -> u64 {
        if self.bypass.load(Ordering::Acquire) {
            0
        } else {
            self.refill_per_second.load(Ordering::Acquire) / SCALE
        }
    }

    /// Returns `true` when the limiter is in bypass mode.
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.bypass.load(Ordering::Acquire)
    }

    /// Atomically retargets the limiter to a new rate in bytes per second.
    ///
    /// `0` enables bypass mode. Shrinking the rate caps the bucket to the
    /// new capacity so the change takes effect immediately rather than
    /// after the old burst drains. Callers parked in
    /// [`consume`](Self::consume) observe the new configuration within one
    /// back-off interval.
    pub fn set_limit(&self, bytes_per_second: u64) {
        if bytes_per_second == 0 {
            self.bypass.store(true, Ordering::Release);
            return;
        }

        let scaled = scale_rate(bytes_per_second);
        self.refill_per_second.store(scaled, Ordering::Release);
        self.max_scaled.store(scaled as i64, Ordering::Release);
        self.cap_tokens(scaled as i64);
        self.bypass.store(false, Ordering::Release);
    }

    /// Blocks the caller until `bytes` may be debited from the bucket.
    ///
    /// Safe to call from any number of workers concurrently. Returns
    /// promptly in bypass mode and for zero-byte requests. Requests larger
    /// than the bucket capacity are admitted in capacity-sized instalments
    /// so the throughput bound holds for any segment size.
    ///
    /// # Errors
    ///
    /// Returns [`WaitCancelled`] if `cancel` fires before the next debit
    /// attempt succeeds.
    pub async fn consume(&self, bytes: u64, cancel: &CancellationToken) -> Result<(), WaitCancelled> {
        if bytes == 0 {
            return Ok(());
        }

        let mut remaining = bytes.saturating_mul(SCALE).min(i64::MAX as u64);
        while remaining > 0 {
            if self.bypass.load(Ordering::Acquire) {
                return Ok(());
            }
            let capacity = self.max_scaled.load(Ordering::Acquire).max(SCALE as i64) as u64;
            let instalment = remaining.min(capacity);
            self.debit(instalment as i64, cancel).await?;
            remaining -= instalment;
        }
        Ok(())
    }

    async fn debit(&self, required: i64, cancel: &CancellationToken) -> Result<(), WaitCancelled> {
        let mut backoff_us = INITIAL_BACKOFF_US;
        loop {
            if cancel.is_cancelled() {
                return Err(WaitCancelled);
            }
            if self.bypass.load(Ordering::Acquire) {
                return Ok(());
            }

            self.refill();

            let after = self.tokens.fetch_sub(required, Ordering::AcqRel) - required;
            if after >= 0 {
                return Ok(());
            }
            // Overdrawn: return the tokens and wait for refill.
            self.tokens.fetch_add(required, Ordering::AcqRel);

            let deficit = after.unsigned_abs();
            let rate = self.refill_per_second.load(Ordering::Acquire).max(1);
            let estimate_us =
                (u128::from(deficit) * u128::from(MICROS_PER_SECOND) / u128::from(rate)) as u64;
            let wait_us = estimate_us.clamp(backoff_us, MAX_BACKOFF_US);

            tokio::select! {
                () = cancel.cancelled() => return Err(WaitCancelled),
                () = tokio::time::sleep(Duration::from_micros(wait_us)) => {}
            }
            backoff_us = (backoff_us * 2).min(MAX_BACKOFF_US);
        }
    }

    /// Credits the bucket for the elapsed time since the last refill.
    ///
    /// The interval is claimed with a CAS on the timestamp so concurrent
    /// callers never double-count it. Intervals too short to yield a whole
    /// scaled token are left unclaimed to avoid losing fractional credit at
    /// very low rates.
    fn refill(&self) {
        let now = self.elapsed_micros();
        let last = self.last_refill_us.load(Ordering::Acquire);
        if now <= last {
            return;
        }

        let rate = self.refill_per_second.load(Ordering::Acquire);
        let earned = (u128::from(now - last) * u128::from(rate) / u128::from(MICROS_PER_SECOND))
            .min(i64::MAX as u128) as i64;
        if earned == 0 {
            return;
        }

        if self
            .last_refill_us
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let max = self.max_scaled.load(Ordering::Acquire);
        let mut current = self.tokens.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(earned).min(max);
            match self
                .tokens
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    fn cap_tokens(&self, cap: i64) {
        let mut current = self.tokens.load(Ordering::Acquire);
        while current > cap {
            match self
                .tokens
                .compare_exchange_weak(current, cap, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    fn elapsed_micros(&self) -> u64 {
        self.epoch.elapsed().as_micros().min(u128::from(u64::MAX)) as u64
    }

    #[cfg(test)]
    pub(crate) fn tokens_for_testing(&self) -> i64 {
        self.tokens.load(Ordering::Acquire)
    }
}

fn scale_rate(bytes_per_second: u64) -> u64 {
    bytes_per_second.saturating_mul(SCALE).min(i64::MAX as u64)
}
