//! Error types for the wire formats.
//!
//! Strongly-typed errors split by layer: [`CodecError`] for the bit-exact
//! envelope serialization and [`FrameError`] for the length-framed stream
//! protocol. Parsing never panics and never corrupts caller state; a
//! malformed input is reported and the input is left untouched.

use thiserror::Error;

/// Errors produced while encoding or decoding an [`crate::Envelope`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input does not start with the protocol magic bytes.
    #[error("bad magic: expected aa bb, found {found:02x?}")]
    BadMagic {
        /// The first two bytes that were actually present.
        found: [u8; 2],
    },

    /// Version byte is not one this implementation understands.
    #[error("unsupported envelope version: {0:#04x}")]
    UnsupportedVersion(u8),

    /// Input ended before a field could be read in full.
    #[error("truncated input: needed {needed} more bytes for {field}")]
    Truncated {
        /// Field being read when the input ran out.
        field: &'static str,
        /// Bytes still required to complete the read.
        needed: usize,
    },

    /// A length-prefixed field exceeds its hard cap.
    #[error("oversized field {field}: {len} bytes (max {max})")]
    OversizedField {
        /// Field whose declared length is out of range.
        field: &'static str,
        /// Declared length.
        len: usize,
        /// Maximum permitted length.
        max: usize,
    },

    /// Priority byte outside `0..=3`.
    #[error("invalid priority byte: {0}")]
    InvalidPriority(u8),

    /// A string field does not hold valid UTF-8.
    #[error("invalid utf-8 in {field}")]
    InvalidUtf8 {
        /// Field that failed UTF-8 validation.
        field: &'static str,
    },

    /// The `has_frag` marker byte is neither 0 nor 1.
    #[error("invalid fragment marker: {0}")]
    InvalidFragmentMarker(u8),
}

/// Errors produced by the length-framed stream protocol.
#[derive(Error, Debug)]
pub enum FrameError {
    /// Frame length prefix exceeds the protocol maximum.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Declared or computed frame size.
        size: usize,
        /// Maximum permitted frame size.
        max: usize,
    },

    /// Frame body is structurally invalid (missing delimiter, bad UTF-8,
    /// malformed metadata JSON).
    #[error("bad frame: {reason}")]
    BadFrame {
        /// Human-readable description of the violation.
        reason: String,
    },
}

impl FrameError {
    /// Build a [`FrameError::BadFrame`] from any displayable cause.
    pub fn bad(reason: impl std::fmt::Display) -> Self {
        Self::BadFrame { reason: reason.to_string() }
    }
}
