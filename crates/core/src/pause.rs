//! Pause gate observed at every I/O step.
//!
//! The gate is a latch over a [`tokio::sync::watch`] channel: pausing
//! publishes `true`, resuming publishes `false`, and waiters park on the
//! channel without spinning. Waiters arriving during a pause attach to the
//! same channel; a resume wakes all of them at once.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::TransferError;

/// Observable paused/running latch shared by the controller and workers.
///
/// All operations are thread-safe and idempotent. A `pause` published
/// before a worker reaches [`wait_while_paused`](Self::wait_while_paused)
/// guarantees that worker blocks; a pause published after it already
/// passed the gate lets the in-flight segment complete first.
#[derive(Debug)]
pub struct PauseGate {
    paused: watch::Sender<bool>,
}

impl PauseGate {
    /// Creates a gate in the running state.
    #[must_use]
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self { paused }
    }

    /// Pauses the gate. Idempotent.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    /// Resumes the gate, waking every parked waiter. Idempotent.
    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Flips the gate and returns the new paused state.
    pub fn toggle(&self) -> bool {
        let mut now_paused = false;
        self.paused.send_modify(|paused| {
            *paused = !*paused;
            now_paused = *paused;
        });
        now_paused
    }

    /// Returns the current paused state.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Subscribes to pause state changes, for observers that mirror the
    /// gate (e.g. marking in-flight transfers paused).
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.paused.subscribe()
    }

    /// Returns immediately while running; parks without spinning while
    /// paused, until resumed or cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Cancelled`] if `cancel` fires while the
    /// gate is paused.
    pub async fn wait_while_paused(&self, cancel: &CancellationToken) -> Result<(), TransferError> {
        if !self.is_paused() {
            return Ok(());
        }

        let mut rx = self.paused.subscribe();
        loop {
            if !*rx.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(TransferError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}
