//! Sender/receiver clock drift compensation.

use std::collections::VecDeque;

/// Samples required before the fit replaces the identity mapping.
const MIN_SAMPLES: usize = 10;

/// Default sliding-window size.
const DEFAULT_WINDOW: usize = 100;

/// Maps sender timestamps into the receiver's timebase.
///
/// Keeps a sliding window of `(sender_ts, receiver_ts)` pairs and fits
/// `receiver = a · sender + b` by least squares; `a` approximates the
/// relative clock rate and `b` the offset. Until [`MIN_SAMPLES`] pairs are
/// present, [`DriftCompensator::compensate`] is the identity.
#[derive(Debug)]
pub struct DriftCompensator {
    window: usize,
    samples: VecDeque<(f64, f64)>,
}

impl DriftCompensator {
    /// Create with an explicit window size.
    #[must_use]
    pub fn new(window: usize) -> Self {
        Self { window: window.max(2), samples: VecDeque::new() }
    }

    /// Record one `(sender_ts, receiver_ts)` observation, in seconds.
    pub fn update(&mut self, sender_ts: f64, receiver_ts: f64) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back((sender_ts, receiver_ts));
    }

    /// Number of observations currently held.
    #[must_use]
    pub fn samples(&self) -> usize {
        self.samples.len()
    }

    /// Current fit as `(drift_rate, offset)`; `(1.0, 0.0)` before enough
    /// samples exist.
    #[must_use]
    pub fn params(&self) -> (f64, f64) {
        if self.samples.len() < MIN_SAMPLES {
            return (1.0, 0.0);
        }

        let n = self.samples.len() as f64;
        let (mut sx, mut sy, mut sxx, mut sxy) = (0.0, 0.0, 0.0, 0.0);
        for &(x, y) in &self.samples {
            sx += x;
            sy += y;
            sxx += x * x;
            sxy += x * y;
        }

        let denom = n * sxx - sx * sx;
        if denom.abs() < f64::EPSILON {
            // All sender timestamps identical; fall back to a pure offset.
            return (1.0, (sy - sx) / n);
        }

        let a = (n * sxy - sx * sy) / denom;
        let b = (sy - a * sx) / n;
        (a, b)
    }

    /// Translate a sender timestamp into the receiver's timebase.
    #[must_use]
    pub fn compensate(&self, sender_ts: f64) -> f64 {
        let (a, b) = self.params();
        a * sender_ts + b
    }
}

impl Default for DriftCompensator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
