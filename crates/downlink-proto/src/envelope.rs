//! The envelope model: the typed unit of transport.
//!
//! An [`Envelope`] wraps an opaque payload with identity (`id`,
//! `timestamp`), routing hints (`topic`, `priority`, `schema_id`) and
//! per-producer bookkeeping ([`EnvelopeMetadata`]). Pipeline stages attach
//! optional fragment, FEC and crypto metadata as they transform the
//! payload; the consumer-facing envelope never carries fragment metadata.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message priority class. Lower numeric value is more urgent.
///
/// - `P0`: commands, acks, safety
/// - `P1`: state updates, control
/// - `P2`: perception data
/// - `P3`: logs, diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// Critical.
    P0,
    /// High.
    P1,
    /// Medium (default for sensor data).
    P2,
    /// Low.
    P3,
}

impl Priority {
    /// All priorities, highest first. Dequeue scans in this order.
    pub const ALL: [Self; 4] = [Self::P0, Self::P1, Self::P2, Self::P3];

    /// Numeric wire value (`0..=3`).
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::P0 => 0,
            Self::P1 => 1,
            Self::P2 => 2,
            Self::P3 => 3,
        }
    }

    /// Parse a wire value. Returns `None` for bytes outside `0..=3`.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::P0),
            1 => Some(Self::P1),
            2 => Some(Self::P2),
            3 => Some(Self::P3),
            _ => None,
        }
    }

    /// Index into per-priority arrays (same as the wire value).
    #[must_use]
    pub fn index(self) -> usize {
        self.as_u8() as usize
    }
}

/// Absolute creation time, carried as its original ISO-8601 rendering.
///
/// The wire contract requires the timestamp *string* to round-trip
/// byte-for-byte, so the envelope stores the rendering rather than a parsed
/// instant. Consumers that need arithmetic parse it themselves (see the
/// drift compensator in the core crate).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(String);

impl Timestamp {
    /// Current UTC time with microsecond precision and an explicit offset,
    /// e.g. `2026-08-01T12:34:56.789012+00:00`.
    #[must_use]
    pub fn now() -> Self {
        Self(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false))
    }

    /// The exact string as produced by the sender.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Timestamp {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Timestamp {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fragmentation metadata, present only on fragments of a split payload.
///
/// # Invariants
///
/// - `fragment_id < total_fragments`
/// - `length == payload.len()` of the fragment envelope
/// - the `[offset, offset + length)` ranges of all fragments sharing a
///   `message_id` tile the original payload exactly (no gaps, no overlap)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentInfo {
    /// Index of this fragment within the message (0-based).
    pub fragment_id: u32,
    /// Total number of fragments in the message (>= 1).
    pub total_fragments: u32,
    /// Byte offset of this fragment into the original payload.
    pub offset: u32,
    /// Byte length of this fragment's payload.
    pub length: u32,
    /// Identifier shared by every fragment of one original message.
    pub message_id: Uuid,
}

/// Forward-error-correction block membership.
///
/// Exactly `k + m` shards share one `block_id`; shards `0..k` are data and
/// shards `k..k + m` are parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecInfo {
    /// Number of data shards in the block.
    pub k: u32,
    /// Number of parity shards in the block.
    pub m: u32,
    /// Block identifier, unique per producer.
    pub block_id: u64,
}

/// Cryptographic metadata, set once encryption has been applied.
///
/// Absence means the envelope is plaintext.
#[derive(Clone, PartialEq, Eq)]
pub struct CryptoInfo {
    /// Label of the key the payload was sealed under.
    pub key_id: String,
    /// 24-byte secret-box nonce.
    pub nonce: [u8; 24],
    /// 64-byte Ed25519 signature over the plaintext.
    pub signature: [u8; 64],
}

// Nonce and signature are public values, but dumping 88 bytes of hex into
// every log line helps nobody.
impl std::fmt::Debug for CryptoInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoInfo").field("key_id", &self.key_id).finish_non_exhaustive()
    }
}

/// Per-producer bookkeeping attached to every envelope.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnvelopeMetadata {
    /// Producer identity. Sequence numbers are scoped to this value.
    pub source_node: String,
    /// Monotonically increasing per `source_node` (gaps permitted).
    pub sequence_number: u32,
    /// Set only on fragments.
    pub fragment_info: Option<FragmentInfo>,
    /// Set on shards of a FEC block.
    pub fec_info: Option<FecInfo>,
    /// Set once encryption has been applied.
    pub crypto_info: Option<CryptoInfo>,
}

/// The unit of transport: an opaque payload plus identity and metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Unique within a producer's lifetime. Generated at creation.
    pub id: Uuid,
    /// Creation time as an ISO-8601 string; preserved exactly end to end.
    pub timestamp: Timestamp,
    /// Names the payload type family. Opaque to the pipeline.
    pub schema_id: u32,
    /// Scheduling class.
    pub priority: Priority,
    /// Hierarchical by convention (`a/b/c`), opaque to the core.
    /// At most 65 535 bytes of UTF-8.
    pub topic: String,
    /// Opaque payload bytes.
    pub payload: Bytes,
    /// Producer bookkeeping and stage metadata.
    pub metadata: EnvelopeMetadata,
}

impl Envelope {
    /// Default schema family for untyped payloads.
    pub const DEFAULT_SCHEMA_ID: u32 = 1;

    /// Create an envelope with a fresh id and the current timestamp.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Timestamp::now(),
            schema_id: Self::DEFAULT_SCHEMA_ID,
            priority,
            topic: topic.into(),
            payload: payload.into(),
            metadata: EnvelopeMetadata::default(),
        }
    }

    /// Set the producer identity and sequence number.
    #[must_use]
    pub fn with_source(mut self, source_node: impl Into<String>, sequence_number: u32) -> Self {
        self.metadata.source_node = source_node.into();
        self.metadata.sequence_number = sequence_number;
        self
    }

    /// Set the payload schema family.
    #[must_use]
    pub fn with_schema_id(mut self, schema_id: u32) -> Self {
        self.schema_id = schema_id;
        self
    }

    /// True when this envelope is a fragment of a larger message.
    #[must_use]
    pub fn is_fragment(&self) -> bool {
        self.metadata.fragment_info.is_some()
    }
}
