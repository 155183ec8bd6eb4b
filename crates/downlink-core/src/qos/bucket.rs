//! Token bucket rate limiter.
//!
//! Tokens refill continuously at a fixed rate up to the burst capacity;
//! consuming one token succeeds iff at least one whole token is present.
//! Refill is driven by the monotonic instants callers pass in, which keeps
//! the bucket deterministic under test.

use std::time::{Duration, Instant};

/// Classic token bucket over packet tokens.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate_pps: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket that starts full.
    #[must_use]
    pub fn new(rate_pps: f64, burst: f64) -> Self {
        Self::new_at(rate_pps, burst, Instant::now())
    }

    /// Create a bucket that starts full, anchored at `now`.
    #[must_use]
    pub fn new_at(rate_pps: f64, burst: f64, now: Instant) -> Self {
        Self { rate_pps, burst, tokens: burst, last_refill: now }
    }

    /// Try to consume one token at the current time.
    pub fn try_consume(&mut self) -> bool {
        self.try_consume_at(Instant::now())
    }

    /// Try to consume one token at `now`.
    ///
    /// Returns `true` and deducts the token when at least one is present
    /// after refill; otherwise leaves the bucket unchanged.
    pub fn try_consume_at(&mut self, now: Instant) -> bool {
        self.refill_at(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Whether a token is available at `now`, without consuming it.
    pub fn has_token_at(&mut self, now: Instant) -> bool {
        self.refill_at(now);
        self.tokens >= 1.0
    }

    /// Current token count after refilling at `now`.
    pub fn tokens_at(&mut self, now: Instant) -> f64 {
        self.refill_at(now);
        self.tokens
    }

    /// The refill rate in packets per second.
    #[must_use]
    pub fn rate(&self) -> f64 {
        self.rate_pps
    }

    /// Change the refill rate. Tokens accrued under the old rate are
    /// settled first.
    pub fn set_rate_at(&mut self, rate_pps: f64, now: Instant) {
        self.refill_at(now);
        self.rate_pps = rate_pps.max(0.0);
    }

    /// Time until a token will be available, measured from `now`.
    pub fn time_until_token_at(&mut self, now: Instant) -> Duration {
        self.refill_at(now);
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        if self.rate_pps <= 0.0 {
            return Duration::MAX;
        }
        Duration::from_secs_f64((1.0 - self.tokens) / self.rate_pps)
    }

    fn refill_at(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate_pps).min(self.burst);
        self.last_refill = now;
    }
}
