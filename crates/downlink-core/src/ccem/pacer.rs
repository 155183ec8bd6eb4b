//! Transmit pacing.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Spaces emissions at a target inter-packet interval.
///
/// If less than the interval has elapsed since the last emission, the
/// pacer sleeps the difference; otherwise it proceeds immediately. The
/// sleep honors cancellation, and a cancelled pace does not count as an
/// emission.
#[derive(Debug)]
pub struct TxPacer {
    interval: Duration,
    last_emission: Option<Instant>,
}

impl TxPacer {
    /// Create a pacer with the given target interval.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self { interval, last_emission: None }
    }

    /// The configured inter-packet interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// How long an emission at `now` would have to wait.
    #[must_use]
    pub fn delay_needed_at(&self, now: Instant) -> Duration {
        match self.last_emission {
            Some(last) => (last + self.interval).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    /// Record an emission at `now` without sleeping (for tests and manual
    /// driving).
    pub fn mark_emitted_at(&mut self, now: Instant) {
        self.last_emission = Some(now);
    }

    /// Wait until the next emission slot, then claim it.
    ///
    /// Returns `false` without claiming the slot when `cancel` fires
    /// first.
    pub async fn pace(&mut self, cancel: &CancellationToken) -> bool {
        let delay = self.delay_needed_at(Instant::now());

        if !delay.is_zero() {
            tokio::select! {
                () = cancel.cancelled() => return false,
                () = tokio::time::sleep(delay) => {},
            }
        }

        self.mark_emitted_at(Instant::now());
        true
    }
}
