//! Wire formats for the downlink telemetry pipeline.
//!
//! This crate defines the two byte-level contracts shared by producer and
//! consumer:
//!
//! - The **envelope codec** ([`codec`]): a bit-exact binary serialization of
//!   [`Envelope`] used as the unit of processing throughout the pipeline.
//! - The **stream frame** ([`stream`]): the length-prefixed
//!   `metadata-JSON + LF + blob` framing exchanged over a reliable byte
//!   stream (and persisted verbatim when frames are stored to disk).
//!
//! Everything here is pure data and parsing; transport I/O lives in the
//! client and server crates.

#![forbid(unsafe_code)]

pub mod codec;
pub mod envelope;
pub mod errors;
pub mod stream;

pub use codec::{decode, encode};
pub use envelope::{
    CryptoInfo, Envelope, EnvelopeMetadata, FecInfo, FragmentInfo, Priority, Timestamp,
};
pub use errors::{CodecError, FrameError};
pub use stream::{FecShardMetadata, FrameMetadata, StreamFrame, MAX_FRAME_SIZE};
