//! Pipeline-wide statistics counters.
//!
//! The single piece of cross-stage shared state. Counters are independent
//! relaxed atomics; a snapshot is therefore not a consistent cut, which is
//! fine for monitoring.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters shared between pipeline stages and drivers.
#[derive(Debug, Default)]
pub struct PipelineStats {
    envelopes_sent: AtomicU64,
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    envelopes_received: AtomicU64,
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
    decode_failures: AtomicU64,
    decrypt_failures: AtomicU64,
    decompress_failures: AtomicU64,
    reassembly_timeouts: AtomicU64,
    observed_loss: AtomicU64,
    fec_blocks_recovered: AtomicU64,
    fec_blocks_unrecoverable: AtomicU64,
}

/// A point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct StatsSnapshot {
    pub envelopes_sent: u64,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub envelopes_received: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub decode_failures: u64,
    pub decrypt_failures: u64,
    pub decompress_failures: u64,
    pub reassembly_timeouts: u64,
    pub observed_loss: u64,
    pub fec_blocks_recovered: u64,
    pub fec_blocks_unrecoverable: u64,
}

macro_rules! bump {
    ($($(#[$doc:meta])* $record:ident => $field:ident),* $(,)?) => {
        $(
            $(#[$doc])*
            pub fn $record(&self, n: u64) {
                self.$field.fetch_add(n, Ordering::Relaxed);
            }
        )*
    };
}

impl PipelineStats {
    /// Fresh zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    bump! {
        /// Count envelopes handed to the TX pipeline.
        record_envelopes_sent => envelopes_sent,
        /// Count frames produced for the transport.
        record_frames_sent => frames_sent,
        /// Count bytes written to the transport.
        record_bytes_sent => bytes_sent,
        /// Count envelopes delivered to the consumer.
        record_envelopes_received => envelopes_received,
        /// Count frames read from the transport.
        record_frames_received => frames_received,
        /// Count bytes read from the transport.
        record_bytes_received => bytes_received,
        /// Count received items that failed envelope decoding.
        record_decode_failures => decode_failures,
        /// Count received items that failed decryption or verification.
        record_decrypt_failures => decrypt_failures,
        /// Count received items that failed decompression or delta decode.
        record_decompress_failures => decompress_failures,
        /// Count messages evicted on the reassembly deadline.
        record_reassembly_timeouts => reassembly_timeouts,
        /// Count sequence slots declared lost by the de-jitter buffer.
        record_observed_loss => observed_loss,
        /// Count FEC blocks repaired from parity.
        record_fec_blocks_recovered => fec_blocks_recovered,
        /// Count FEC blocks that could not be repaired.
        record_fec_blocks_unrecoverable => fec_blocks_unrecoverable,
    }

    /// Copy every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            envelopes_sent: self.envelopes_sent.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            envelopes_received: self.envelopes_received.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            decrypt_failures: self.decrypt_failures.load(Ordering::Relaxed),
            decompress_failures: self.decompress_failures.load(Ordering::Relaxed),
            reassembly_timeouts: self.reassembly_timeouts.load(Ordering::Relaxed),
            observed_loss: self.observed_loss.load(Ordering::Relaxed),
            fec_blocks_recovered: self.fec_blocks_recovered.load(Ordering::Relaxed),
            fec_blocks_unrecoverable: self.fec_blocks_unrecoverable.load(Ordering::Relaxed),
        }
    }
}
