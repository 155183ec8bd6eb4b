//! Bit-exact envelope serialization.
//!
//! Wire format (all integers big-endian):
//!
//! ```text
//! magic       2 bytes  = 0xAA 0xBB
//! version     1 byte   = 0x01
//! body_len    4 bytes  u32          length of BODY that follows
//! -- BODY --
//! env_id      16 bytes              UUID raw
//! ts_len      2 bytes  u16
//! timestamp   ts_len bytes UTF-8    ISO-8601 with offset
//! schema_id   4 bytes  u32
//! priority    1 byte   (0..=3)
//! topic_len   2 bytes  u16
//! topic       topic_len bytes UTF-8
//! payload_len 4 bytes  u32
//! payload     payload_len bytes
//! src_len     2 bytes  u16
//! src_node    src_len bytes UTF-8
//! seq_num     4 bytes  u32
//! has_frag    1 byte   (0 | 1)
//! if has_frag:
//!   frag_id          4 bytes u32
//!   total_fragments  4 bytes u32
//!   frag_offset      4 bytes u32
//!   frag_length      4 bytes u32
//!   message_id       16 bytes
//! ```
//!
//! The codec is stateless: [`encode`] and [`decode`] are free functions with
//! no shared state across calls. Decoding validates cheapest-first (magic,
//! version, body length) and rejects malformed input without touching caller
//! state. FEC and crypto metadata do not appear on the envelope wire; they
//! travel in the stream-frame metadata (see [`crate::stream`]).

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::{
    envelope::{Envelope, EnvelopeMetadata, FragmentInfo, Priority, Timestamp},
    errors::CodecError,
};

/// Framing-detection magic bytes.
pub const MAGIC: [u8; 2] = [0xAA, 0xBB];

/// Current envelope format version.
pub const VERSION: u8 = 0x01;

/// Hard cap on the timestamp string (bytes).
pub const MAX_TIMESTAMP_LEN: usize = 256;

/// Hard cap on the topic string (bytes).
pub const MAX_TOPIC_LEN: usize = u16::MAX as usize;

/// Hard cap on the source-node string (bytes).
pub const MAX_SOURCE_LEN: usize = u16::MAX as usize;

/// Hard cap on the payload (2 GiB).
pub const MAX_PAYLOAD_LEN: usize = 2 * 1024 * 1024 * 1024;

/// Fixed header size: magic + version + body_len.
const HEADER_LEN: usize = 7;

/// Body size of the optional fragment block.
const FRAG_BLOCK_LEN: usize = 4 + 4 + 4 + 4 + 16;

/// Serialize an envelope to its wire representation.
///
/// # Errors
///
/// `CodecError::OversizedField` when a field exceeds its hard cap. Encoding
/// is otherwise infallible.
pub fn encode(envelope: &Envelope) -> Result<Bytes, CodecError> {
    let ts = envelope.timestamp.as_str().as_bytes();
    check_len("timestamp", ts.len(), MAX_TIMESTAMP_LEN)?;
    check_len("topic", envelope.topic.len(), MAX_TOPIC_LEN)?;
    check_len("src_node", envelope.metadata.source_node.len(), MAX_SOURCE_LEN)?;
    check_len("payload", envelope.payload.len(), MAX_PAYLOAD_LEN)?;

    let frag = envelope.metadata.fragment_info;
    let body_len = 16
        + 2
        + ts.len()
        + 4
        + 1
        + 2
        + envelope.topic.len()
        + 4
        + envelope.payload.len()
        + 2
        + envelope.metadata.source_node.len()
        + 4
        + 1
        + if frag.is_some() { FRAG_BLOCK_LEN } else { 0 };

    let mut buf = BytesMut::with_capacity(HEADER_LEN + body_len);
    buf.put_slice(&MAGIC);
    buf.put_u8(VERSION);
    buf.put_u32(body_len as u32);

    buf.put_slice(envelope.id.as_bytes());
    buf.put_u16(ts.len() as u16);
    buf.put_slice(ts);
    buf.put_u32(envelope.schema_id);
    buf.put_u8(envelope.priority.as_u8());
    buf.put_u16(envelope.topic.len() as u16);
    buf.put_slice(envelope.topic.as_bytes());
    buf.put_u32(envelope.payload.len() as u32);
    buf.put_slice(&envelope.payload);
    buf.put_u16(envelope.metadata.source_node.len() as u16);
    buf.put_slice(envelope.metadata.source_node.as_bytes());
    buf.put_u32(envelope.metadata.sequence_number);

    match frag {
        Some(info) => {
            buf.put_u8(1);
            buf.put_u32(info.fragment_id);
            buf.put_u32(info.total_fragments);
            buf.put_u32(info.offset);
            buf.put_u32(info.length);
            buf.put_slice(info.message_id.as_bytes());
        },
        None => buf.put_u8(0),
    }

    debug_assert_eq!(buf.len(), HEADER_LEN + body_len);

    Ok(buf.freeze())
}

/// Parse an envelope from its wire representation.
///
/// Reads exactly the declared body; trailing bytes beyond it are ignored
/// (outer framing guarantees exact extents on every transport path).
///
/// # Errors
///
/// - `CodecError::BadMagic` / `UnsupportedVersion` on a foreign header
/// - `CodecError::Truncated` when the input ends inside a field
/// - `CodecError::OversizedField` when a declared length exceeds its cap
/// - `CodecError::InvalidPriority` / `InvalidUtf8` / `InvalidFragmentMarker`
///   on corrupt field content
pub fn decode(input: &[u8]) -> Result<Envelope, CodecError> {
    if input.len() < 2 {
        return Err(CodecError::Truncated { field: "magic", needed: 2 - input.len() });
    }
    if input[..2] != MAGIC {
        return Err(CodecError::BadMagic { found: [input[0], input[1]] });
    }
    if input.len() < 3 {
        return Err(CodecError::Truncated { field: "version", needed: 1 });
    }
    if input[2] != VERSION {
        return Err(CodecError::UnsupportedVersion(input[2]));
    }

    let mut header = Reader::new(&input[3..]);
    let body_len = header.read_u32("body_len")? as usize;

    let after_header = &input[HEADER_LEN..];
    if after_header.len() < body_len {
        return Err(CodecError::Truncated {
            field: "body",
            needed: body_len - after_header.len(),
        });
    }

    let mut r = Reader::new(&after_header[..body_len]);

    let id = r.read_uuid("env_id")?;
    let ts_len = r.read_u16("ts_len")? as usize;
    check_len("timestamp", ts_len, MAX_TIMESTAMP_LEN)?;
    let timestamp = Timestamp::from(r.read_str("timestamp", ts_len)?);
    let schema_id = r.read_u32("schema_id")?;

    let priority_byte = r.read_u8("priority")?;
    let priority =
        Priority::from_u8(priority_byte).ok_or(CodecError::InvalidPriority(priority_byte))?;

    let topic_len = r.read_u16("topic_len")? as usize;
    check_len("topic", topic_len, MAX_TOPIC_LEN)?;
    let topic = r.read_str("topic", topic_len)?;

    let payload_len = r.read_u32("payload_len")? as usize;
    check_len("payload", payload_len, MAX_PAYLOAD_LEN)?;
    let payload = Bytes::copy_from_slice(r.read_bytes("payload", payload_len)?);

    let src_len = r.read_u16("src_len")? as usize;
    check_len("src_node", src_len, MAX_SOURCE_LEN)?;
    let source_node = r.read_str("src_node", src_len)?;
    let sequence_number = r.read_u32("seq_num")?;

    let fragment_info = match r.read_u8("has_frag")? {
        0 => None,
        1 => Some(FragmentInfo {
            fragment_id: r.read_u32("frag_id")?,
            total_fragments: r.read_u32("total_fragments")?,
            offset: r.read_u32("frag_offset")?,
            length: r.read_u32("frag_length")?,
            message_id: r.read_uuid("message_id")?,
        }),
        other => return Err(CodecError::InvalidFragmentMarker(other)),
    };

    Ok(Envelope {
        id,
        timestamp,
        schema_id,
        priority,
        topic,
        payload,
        metadata: EnvelopeMetadata {
            source_node,
            sequence_number,
            fragment_info,
            fec_info: None,
            crypto_info: None,
        },
    })
}

fn check_len(field: &'static str, len: usize, max: usize) -> Result<(), CodecError> {
    if len > max {
        return Err(CodecError::OversizedField { field, len, max });
    }
    Ok(())
}

/// Bounds-checked big-endian cursor over a byte slice.
struct Reader<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    fn read_bytes(&mut self, field: &'static str, len: usize) -> Result<&'a [u8], CodecError> {
        let remaining = self.input.len() - self.pos;
        if remaining < len {
            return Err(CodecError::Truncated { field, needed: len - remaining });
        }
        let out = &self.input[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn read_u8(&mut self, field: &'static str) -> Result<u8, CodecError> {
        Ok(self.read_bytes(field, 1)?[0])
    }

    fn read_u16(&mut self, field: &'static str) -> Result<u16, CodecError> {
        let b = self.read_bytes(field, 2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self, field: &'static str) -> Result<u32, CodecError> {
        let b = self.read_bytes(field, 4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_uuid(&mut self, field: &'static str) -> Result<Uuid, CodecError> {
        let b = self.read_bytes(field, 16)?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(b);
        Ok(Uuid::from_bytes(raw))
    }

    fn read_str(&mut self, field: &'static str, len: usize) -> Result<String, CodecError> {
        let b = self.read_bytes(field, len)?;
        std::str::from_utf8(b)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8 { field })
    }
}
