//! XOR delta coding between equal-sized successive payloads.
//!
//! For slowly-changing sensor frames the XOR of consecutive payloads is
//! mostly zeros and compresses far better than the frames themselves. The
//! encoder emits `(bytes, is_delta)` pairs; `is_delta == false` marks a
//! full frame that becomes the new reference on both sides.
//!
//! Encoder and decoder stay in lock-step as long as no emitted frame is
//! lost between them; a loss desynchronizes the pair until the next full
//! frame resyncs it. [`DeltaEncoder::reset`] forces the next frame to be
//! full.

use thiserror::Error;

/// Errors from delta decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeltaError {
    /// A delta frame arrived but no reference frame is held.
    #[error("cannot decode delta without a reference frame")]
    MissingReference,

    /// A delta frame's size does not match the held reference.
    #[error("delta size mismatch: got {got}, reference is {expected}")]
    LengthMismatch {
        /// Size of the arriving delta frame.
        got: usize,
        /// Size of the held reference.
        expected: usize,
    },
}

/// Delta coding policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeltaMode {
    /// Always emit full frames; keep no reference.
    Off,
    /// Emit a delta whenever a same-sized reference exists.
    Simple,
    /// Emit a delta only when the fraction of non-zero delta bytes is
    /// below `threshold`; otherwise fall back to a full frame.
    Adaptive {
        /// Non-zero-byte fraction at or above which a full frame is sent.
        threshold: f64,
    },
}

impl DeltaMode {
    /// Default cutoff for [`DeltaMode::Adaptive`].
    pub const DEFAULT_THRESHOLD: f64 = 0.9;
}

/// Producer-side delta encoder.
#[derive(Debug)]
pub struct DeltaEncoder {
    mode: DeltaMode,
    previous: Option<Vec<u8>>,
}

impl DeltaEncoder {
    /// Create an encoder with no reference frame.
    #[must_use]
    pub fn new(mode: DeltaMode) -> Self {
        Self { mode, previous: None }
    }

    /// The configured mode.
    #[must_use]
    pub fn mode(&self) -> DeltaMode {
        self.mode
    }

    /// Encode the next payload.
    ///
    /// Returns `(bytes, is_delta)`. A full frame is emitted when the mode
    /// is off, no reference exists, sizes differ, or (adaptive) the delta
    /// is too dense to be worth it. The input always becomes the new
    /// reference for stateful modes.
    pub fn encode(&mut self, data: &[u8]) -> (Vec<u8>, bool) {
        if matches!(self.mode, DeltaMode::Off) {
            return (data.to_vec(), false);
        }

        let Some(previous) = self.previous.replace(data.to_vec()) else {
            return (data.to_vec(), false);
        };

        if previous.len() != data.len() {
            return (data.to_vec(), false);
        }

        let delta = xor(&previous, data);

        if let DeltaMode::Adaptive { threshold } = self.mode {
            let changed = delta.iter().filter(|&&b| b != 0).count();
            let ratio = if delta.is_empty() { 0.0 } else { changed as f64 / delta.len() as f64 };
            if ratio >= threshold {
                return (data.to_vec(), false);
            }
        }

        (delta, true)
    }

    /// Discard the reference frame. The next output is guaranteed full.
    pub fn reset(&mut self) {
        self.previous = None;
    }
}

/// Consumer-side delta decoder.
#[derive(Debug, Default)]
pub struct DeltaDecoder {
    previous: Option<Vec<u8>>,
}

impl DeltaDecoder {
    /// Create a decoder with no reference frame.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the next frame.
    ///
    /// Full frames replace the reference and pass through; delta frames
    /// are XOR-ed against it, and the result becomes the new reference.
    ///
    /// # Errors
    ///
    /// - `DeltaError::MissingReference` for a delta with no reference
    /// - `DeltaError::LengthMismatch` for a delta sized unlike the
    ///   reference
    pub fn decode(&mut self, data: &[u8], is_delta: bool) -> Result<Vec<u8>, DeltaError> {
        if !is_delta {
            self.previous = Some(data.to_vec());
            return Ok(data.to_vec());
        }

        let previous = self.previous.as_ref().ok_or(DeltaError::MissingReference)?;
        if previous.len() != data.len() {
            return Err(DeltaError::LengthMismatch {
                got: data.len(),
                expected: previous.len(),
            });
        }

        let current = xor(previous, data);
        self.previous = Some(current.clone());
        Ok(current)
    }

    /// Discard the reference frame.
    pub fn reset(&mut self) {
        self.previous = None;
    }
}

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}
