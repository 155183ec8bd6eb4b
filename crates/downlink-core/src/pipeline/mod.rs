//! Pipeline composition: the producer and consumer processing chains.
//!
//! The producer side ([`TxPipeline`]) turns one domain envelope into one or
//! more ready-to-send stream frames:
//!
//! ```text
//! Envelope -> codec -> (delta) -> compress -> (crypto) -> packetize (+FEC)
//!          -> StreamFrame*
//! ```
//!
//! The frames then flow through the QoS shaper, the TX pacer and the
//! transport, which live with the driver (client crate). The consumer side
//! ([`RxPipeline`]) mirrors the chain:
//!
//! ```text
//! StreamFrame -> codec -> de-jitter -> (FEC recover) -> defragment
//!             -> (crypto) -> decompress -> (delta⁻¹) -> codec -> Envelope
//! ```
//!
//! The processed blob travels inside *carrier* envelopes: the original
//! envelope's identity fields plus the blob as payload, split into
//! fragments when it exceeds the MTU budget. The stream-frame metadata
//! carries what the inverse stages need (compression tag, delta flag, blob
//! size, FEC geometry).
//!
//! Error propagation follows the send/receive asymmetry: a failing send is
//! fatal for that envelope and surfaces to the caller; failures on
//! received data are confined to the offending item, counted, and logged.

mod recovery;
mod rx;
mod tx;

use downlink_crypto::{CryptoBox, CryptoError, PeerCryptoBox, SealedBox};
use downlink_proto::{CodecError, FrameError};
pub use recovery::ShardCollector;
pub use rx::RxPipeline;
use thiserror::Error;
pub use tx::TxPipeline;

use crate::{
    compress::CompressionError, config::ConfigError, delta::DeltaError, fec::FecError,
    packetize::FragmentError,
};

/// Any error a pipeline stage can produce.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Envelope serialization failed.
    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    /// Stream framing failed.
    #[error("frame: {0}")]
    Frame(#[from] FrameError),

    /// Compression stage failed.
    #[error("compression: {0}")]
    Compression(#[from] CompressionError),

    /// Delta stage failed.
    #[error("delta: {0}")]
    Delta(#[from] DeltaError),

    /// FEC stage failed.
    #[error("fec: {0}")]
    Fec(#[from] FecError),

    /// Crypto stage failed.
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),

    /// Fragmentation stage failed.
    #[error("fragmentation: {0}")]
    Fragment(#[from] FragmentError),

    /// The pipeline configuration is invalid.
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    /// A received frame names a compression algorithm we do not know.
    #[error("unknown compression tag {tag:?}")]
    UnknownCompression {
        /// The offending tag.
        tag: String,
    },
}

/// The security configuration of a pipeline endpoint.
///
/// Crypto sits between compression and packetization: the sender signs and
/// seals the compressed blob, the receiver opens and verifies it before
/// decompressing.
pub enum CryptoStage {
    /// Plaintext pipeline.
    None,
    /// Pre-shared symmetric key.
    Symmetric(CryptoBox),
    /// X25519 key agreement with an installed peer.
    Asymmetric(PeerCryptoBox),
}

impl CryptoStage {
    /// Whether payloads are sealed at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Label of the active key, if any.
    #[must_use]
    pub fn key_id(&self) -> Option<&str> {
        match self {
            Self::None => None,
            Self::Symmetric(cb) => Some(cb.key_id()),
            Self::Asymmetric(pb) => Some(pb.key_id()),
        }
    }

    /// Seal a blob. `None` when crypto is disabled.
    pub(crate) fn seal(&self, plaintext: &[u8]) -> Result<Option<SealedBox>, CryptoError> {
        match self {
            Self::None => Ok(None),
            Self::Symmetric(cb) => Ok(Some(cb.encrypt(plaintext))),
            Self::Asymmetric(pb) => pb.encrypt(plaintext).map(Some),
        }
    }

    /// Open a blob; identity when crypto is disabled.
    pub(crate) fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            Self::None => Ok(sealed.to_vec()),
            Self::Symmetric(cb) => cb.decrypt(sealed),
            Self::Asymmetric(pb) => pb.decrypt(sealed),
        }
    }
}

impl std::fmt::Debug for CryptoStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("CryptoStage::None"),
            Self::Symmetric(_) => f.write_str("CryptoStage::Symmetric"),
            Self::Asymmetric(_) => f.write_str("CryptoStage::Asymmetric"),
        }
    }
}
