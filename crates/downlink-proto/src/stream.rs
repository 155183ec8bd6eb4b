//! Length-framed stream protocol between producer and consumer.
//!
//! Wire frame over a reliable byte stream:
//!
//! ```text
//! length_prefix 4 bytes u32 (network byte order)
//! metadata_json bytes up to the first ASCII LF (0x0A)
//! '\n'          1 byte
//! payload_blob  remaining bytes
//! ```
//!
//! The total frame (metadata + LF + blob) must equal `length_prefix` in
//! length and must not exceed [`MAX_FRAME_SIZE`]. The blob is a
//! codec-encoded carrier envelope, ready for the inverse pipeline. The same
//! byte sequence, prefix included, is the persisted on-disk record format.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{envelope::Priority, errors::FrameError};

/// Maximum size of one frame body (metadata + LF + blob): 16 MiB.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// FEC block geometry attached to shard frames.
///
/// The envelope wire format carries no FEC fields, so shard frames describe
/// their block here. Receivers group shards by `block_id` and reconstruct
/// once `k` distinct shards of a block have arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FecShardMetadata {
    /// Data shards in the block.
    pub k: u32,
    /// Parity shards in the block.
    pub m: u32,
    /// Block identifier, unique per producer.
    pub block_id: u64,
    /// Index of this shard within the block (`0..k + m`).
    pub shard_index: u32,
    /// Padded shard length used when the block was encoded.
    pub shard_len: u32,
}

/// The metadata object carried as the frame's JSON line.
///
/// `payload_size` is the size of the complete processed blob before any
/// fragmentation, which lets the receiver size reassembly buffers and
/// truncate FEC-recovered final fragments. `delta` and `fec` are optional
/// extensions beyond the required minimum set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrameMetadata {
    /// Id of the carrier envelope in the blob.
    pub envelope_id: Uuid,
    /// Topic of the original envelope.
    pub topic: String,
    /// Priority class of the original envelope.
    pub priority: Priority,
    /// Timestamp string of the original envelope.
    pub timestamp: String,
    /// Compression algorithm applied to the inner blob (`lz4`, `zstd`,
    /// `none`).
    pub compression: String,
    /// Size of the full pre-fragmentation blob in bytes.
    pub payload_size: u64,
    /// True when the inner blob is an XOR delta against the previous frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<bool>,
    /// FEC block geometry, present on shard frames only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fec: Option<FecShardMetadata>,
}

/// One frame of the stream protocol: a metadata line plus an opaque blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    /// Parsed metadata line.
    pub metadata: FrameMetadata,
    /// Codec-encoded carrier envelope bytes.
    pub blob: Bytes,
}

impl StreamFrame {
    /// Serialize the frame including its length prefix.
    ///
    /// # Errors
    ///
    /// - `FrameError::FrameTooLarge` when metadata + LF + blob exceeds
    ///   [`MAX_FRAME_SIZE`]
    /// - `FrameError::BadFrame` when the metadata fails to serialize
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let metadata = serde_json::to_vec(&self.metadata).map_err(FrameError::bad)?;

        let body_len = metadata.len() + 1 + self.blob.len();
        if body_len > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge { size: body_len, max: MAX_FRAME_SIZE });
        }

        let mut buf = BytesMut::with_capacity(4 + body_len);
        buf.put_u32(body_len as u32);
        buf.put_slice(&metadata);
        buf.put_u8(b'\n');
        buf.put_slice(&self.blob);
        Ok(buf.freeze())
    }

    /// Parse a frame body (the bytes *after* the length prefix).
    ///
    /// Splits on the first LF, parses the metadata JSON, and takes the rest
    /// as the blob.
    ///
    /// # Errors
    ///
    /// - `FrameError::FrameTooLarge` when the body exceeds [`MAX_FRAME_SIZE`]
    /// - `FrameError::BadFrame` on a missing delimiter or malformed metadata
    pub fn from_body(body: &[u8]) -> Result<Self, FrameError> {
        if body.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge { size: body.len(), max: MAX_FRAME_SIZE });
        }

        let lf = body
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| FrameError::bad("missing metadata delimiter"))?;

        let metadata: FrameMetadata =
            serde_json::from_slice(&body[..lf]).map_err(FrameError::bad)?;

        Ok(Self { metadata, blob: Bytes::copy_from_slice(&body[lf + 1..]) })
    }

    /// Parse a complete frame (length prefix included), returning the frame
    /// and the total number of bytes consumed. Used when reading persisted
    /// frame files.
    ///
    /// # Errors
    ///
    /// - `FrameError::BadFrame` when the input ends before the declared
    ///   extent
    /// - everything [`StreamFrame::from_body`] reports
    pub fn decode(input: &[u8]) -> Result<(Self, usize), FrameError> {
        if input.len() < 4 {
            return Err(FrameError::bad("truncated length prefix"));
        }
        let body_len = u32::from_be_bytes([input[0], input[1], input[2], input[3]]) as usize;
        if body_len > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge { size: body_len, max: MAX_FRAME_SIZE });
        }
        if input.len() < 4 + body_len {
            return Err(FrameError::bad(format!(
                "truncated frame body: declared {body_len}, have {}",
                input.len() - 4
            )));
        }
        let frame = Self::from_body(&input[4..4 + body_len])?;
        Ok((frame, 4 + body_len))
    }
}
