//! Pluggable block compression.
//!
//! Two variants cover the latency/ratio trade-off:
//!
//! - [`Lz4Compressor`] ("fast"): LZ4 block format with a prepended size,
//!   roughly 2-3x on repetitive telemetry at memory-bandwidth speeds.
//! - [`ZstdCompressor`] ("balanced"): Zstandard at levels 1..=22, roughly
//!   3-5x at a fraction of the throughput.
//!
//! Both are lossless for every byte sequence including the empty one. The
//! pipeline never retries a failed (de)compression; the item is dropped and
//! counted by the caller.

use thiserror::Error;

/// Errors from the compression stage.
#[derive(Error, Debug)]
pub enum CompressionError {
    /// Compressing failed (out of memory, internal codec error).
    #[error("{algorithm} compression failed: {reason}")]
    Compress {
        /// Algorithm tag (`lz4`, `zstd`).
        algorithm: &'static str,
        /// Underlying cause.
        reason: String,
    },

    /// Decompressing failed (corrupt or truncated frame).
    #[error("{algorithm} decompression failed: {reason}")]
    Decompress {
        /// Algorithm tag (`lz4`, `zstd`).
        algorithm: &'static str,
        /// Underlying cause.
        reason: String,
    },
}

/// A lossless block compressor.
///
/// `decompress(compress(x)) == x` for all `x`. Implementations are
/// stateless and shareable across calls.
pub trait Compressor: Send + Sync {
    /// Wire tag naming the algorithm (`lz4`, `zstd`, `none`). Travels in
    /// the stream-frame metadata so the receiver can pick the inverse.
    fn algorithm(&self) -> &'static str;

    /// Compress a block.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;

    /// Decompress a block produced by [`Compressor::compress`].
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;
}

/// LZ4 block compression, latency-optimized.
///
/// The configured level is carried for config parity but does not change
/// the encoding: the LZ4 block path here has a single fast mode.
#[derive(Debug, Clone, Copy)]
pub struct Lz4Compressor {
    #[allow(dead_code)]
    level: u32,
}

impl Lz4Compressor {
    /// Create with the given (informational) level.
    #[must_use]
    pub fn new(level: u32) -> Self {
        Self { level }
    }
}

impl Default for Lz4Compressor {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Compressor for Lz4Compressor {
    fn algorithm(&self) -> &'static str {
        "lz4"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        Ok(lz4_flex::block::compress_prepend_size(data))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        lz4_flex::block::decompress_size_prepended(data).map_err(|e| {
            CompressionError::Decompress { algorithm: "lz4", reason: e.to_string() }
        })
    }
}

/// Zstandard compression, ratio-optimized.
#[derive(Debug, Clone, Copy)]
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    /// Default Zstandard level.
    pub const DEFAULT_LEVEL: i32 = 3;

    /// Create with the given level, clamped into `1..=22`.
    #[must_use]
    pub fn new(level: i32) -> Self {
        Self { level: level.clamp(1, 22) }
    }

    /// The clamped level in effect.
    #[must_use]
    pub fn level(&self) -> i32 {
        self.level
    }
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::new(Self::DEFAULT_LEVEL)
    }
}

impl Compressor for ZstdCompressor {
    fn algorithm(&self) -> &'static str {
        "zstd"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        zstd::stream::encode_all(data, self.level).map_err(|e| CompressionError::Compress {
            algorithm: "zstd",
            reason: e.to_string(),
        })
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        zstd::stream::decode_all(data).map_err(|e| CompressionError::Decompress {
            algorithm: "zstd",
            reason: e.to_string(),
        })
    }
}

/// Identity "compressor" for frames tagged `none`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoneCompressor;

impl Compressor for NoneCompressor {
    fn algorithm(&self) -> &'static str {
        "none"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        Ok(data.to_vec())
    }
}

/// Look up the inverse codec for a frame metadata tag.
#[must_use]
pub fn for_algorithm(tag: &str) -> Option<Box<dyn Compressor>> {
    match tag {
        "lz4" => Some(Box::new(Lz4Compressor::default())),
        "zstd" => Some(Box::new(ZstdCompressor::default())),
        "none" => Some(Box::new(NoneCompressor)),
        _ => None,
    }
}
