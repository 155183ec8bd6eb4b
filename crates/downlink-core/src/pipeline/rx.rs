//! The consumer-side processing chain.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use downlink_proto::{codec, Envelope, FrameMetadata, StreamFrame};
use uuid::Uuid;

use super::{recovery::ShardCollector, CryptoStage, PipelineError};
use crate::{
    ccem::{DriftCompensator, RxDejitter},
    compress::{Compressor, Lz4Compressor, NoneCompressor, ZstdCompressor},
    config::PipelineConfig,
    delta::DeltaDecoder,
    packetize::Defragmenter,
    stats::PipelineStats,
};

/// A decoded carrier waiting in the de-jitter buffer with its frame
/// metadata.
struct InboundFrame {
    metadata: FrameMetadata,
    carrier: Envelope,
}

/// Per-message blob parameters remembered across its fragments.
struct BlobMeta {
    compression: String,
    delta: Option<bool>,
}

/// Consumer-side pipeline: stream frame in, original envelopes out.
///
/// Failures on received data never propagate: the offending item is
/// dropped, a counter is bumped, and a warning is logged. The emitted
/// envelopes are in per-producer sequence order except across declared
/// gaps.
pub struct RxPipeline {
    crypto: CryptoStage,
    delta: DeltaDecoder,
    dejitter: RxDejitter<InboundFrame>,
    defrag: Defragmenter,
    collector: ShardCollector,
    drift: DriftCompensator,
    blob_meta: HashMap<Uuid, BlobMeta>,
    lz4: Lz4Compressor,
    zstd: ZstdCompressor,
    stats: Arc<PipelineStats>,
    reported_loss: u64,
    reported_unrecoverable: u64,
}

impl RxPipeline {
    /// Build a pipeline from a validated configuration.
    ///
    /// # Errors
    ///
    /// `PipelineError::Config` when the configuration fails validation.
    pub fn new(
        config: &PipelineConfig,
        crypto: CryptoStage,
        stats: Arc<PipelineStats>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        Ok(Self {
            crypto,
            delta: DeltaDecoder::new(),
            dejitter: RxDejitter::new(config.rx_dejitter_size, config.rx_dejitter_max_wait),
            defrag: Defragmenter::new(config.reassembly_timeout, config.max_in_flight_messages),
            collector: ShardCollector::new(config.reassembly_timeout),
            drift: DriftCompensator::default(),
            blob_meta: HashMap::new(),
            lz4: Lz4Compressor::default(),
            zstd: ZstdCompressor::default(),
            stats,
            reported_loss: 0,
            reported_unrecoverable: 0,
        })
    }

    /// Process one received frame, stamped with the current time.
    pub fn process(&mut self, frame: StreamFrame) -> Vec<Envelope> {
        self.process_at(frame, Instant::now())
    }

    /// Process one received frame at `now`, returning every envelope that
    /// became deliverable.
    pub fn process_at(&mut self, frame: StreamFrame, now: Instant) -> Vec<Envelope> {
        self.stats.record_frames_received(1);
        self.stats.record_bytes_received(frame.blob.len() as u64);
        self.sweep_at(now);

        let carrier = match codec::decode(&frame.blob) {
            Ok(carrier) => carrier,
            Err(e) => {
                self.stats.record_decode_failures(1);
                tracing::warn!(error = %e, "dropping undecodable frame blob");
                return Vec::new();
            },
        };

        let seq = carrier.metadata.sequence_number;
        let released =
            self.dejitter.insert_at(InboundFrame { metadata: frame.metadata, carrier }, seq, now);

        let mut out = Vec::new();
        for inbound in released {
            out.extend(self.route(inbound, now));
        }
        out.extend(self.flush_at(now));
        out
    }

    /// Release de-jitter entries past their residence limit and run timer
    /// sweeps. Called from [`RxPipeline::process_at`] and by drivers on an
    /// idle tick.
    pub fn flush_at(&mut self, now: Instant) -> Vec<Envelope> {
        let released = self.dejitter.flush_expired_at(now);
        let mut out = Vec::new();
        for inbound in released {
            out.extend(self.route(inbound, now));
        }
        self.publish_loss_counters();
        out
    }

    /// Idle housekeeping: run the timer sweeps and release expired
    /// de-jitter entries. Drivers call this on a periodic tick so
    /// deadlines fire even when no frames arrive.
    pub fn tick(&mut self) -> Vec<Envelope> {
        let now = Instant::now();
        self.sweep_at(now);
        self.flush_at(now)
    }

    /// Sender-clock mapping built from observed timestamps.
    #[must_use]
    pub fn drift(&self) -> &DriftCompensator {
        &self.drift
    }

    fn sweep_at(&mut self, now: Instant) {
        let evicted = self.defrag.sweep_at(now);
        if !evicted.is_empty() {
            self.stats.record_reassembly_timeouts(evicted.len() as u64);
            for id in &evicted {
                self.blob_meta.remove(id);
                self.collector.discard(id);
            }
        }

        self.collector.sweep_at(now);
        let unrecoverable = self.collector.unrecoverable_count();
        self.stats
            .record_fec_blocks_unrecoverable(unrecoverable - self.reported_unrecoverable);
        self.reported_unrecoverable = unrecoverable;

        self.publish_loss_counters();
    }

    fn publish_loss_counters(&mut self) {
        let loss = self.dejitter.observed_loss();
        self.stats.record_observed_loss(loss - self.reported_loss);
        self.reported_loss = loss;
    }

    /// Route one in-order carrier through recovery, reassembly and
    /// unwrapping. Failures are confined to this item.
    fn route(&mut self, inbound: InboundFrame, now: Instant) -> Vec<Envelope> {
        let InboundFrame { metadata, carrier } = inbound;

        let Some(frag) = carrier.metadata.fragment_info else {
            return match self.unwrap_blob(&carrier.payload, &metadata.compression, metadata.delta)
            {
                Ok(envelope) => vec![envelope],
                Err(e) => {
                    self.count_failure(&e);
                    Vec::new()
                },
            };
        };

        let message_id = frag.message_id;
        self.blob_meta.entry(message_id).or_insert_with(|| BlobMeta {
            compression: metadata.compression.clone(),
            delta: metadata.delta,
        });

        let mut completed = Vec::new();

        if let Some(fec) = metadata.fec {
            let synthesized =
                match self.collector.insert_at(&fec, &carrier, metadata.payload_size, now) {
                    Ok(fragments) => {
                        if !fragments.is_empty() {
                            self.stats.record_fec_blocks_recovered(1);
                        }
                        fragments
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, message_id = %message_id, "dropping bad shard");
                        Vec::new()
                    },
                };

            let is_parity = fec.shard_index >= fec.k;
            if !is_parity {
                self.defragment_into(carrier, now, &mut completed);
            }
            for fragment in synthesized {
                self.defragment_into(fragment, now, &mut completed);
            }
        } else {
            self.defragment_into(carrier, now, &mut completed);
        }

        let mut out = Vec::new();
        for blob_envelope in completed {
            let meta = self.blob_meta.remove(&message_id);
            self.collector.discard(&message_id);

            let (compression, delta) = match &meta {
                Some(m) => (m.compression.as_str(), m.delta),
                None => (metadata.compression.as_str(), metadata.delta),
            };

            match self.unwrap_blob(&blob_envelope.payload, compression, delta) {
                Ok(envelope) => out.push(envelope),
                Err(e) => self.count_failure(&e),
            }
        }
        out
    }

    fn defragment_into(&mut self, envelope: Envelope, now: Instant, completed: &mut Vec<Envelope>) {
        match self.defrag.insert_at(envelope, now) {
            Ok(Some(done)) => completed.push(done),
            Ok(None) => {},
            Err(e) => {
                self.stats.record_decode_failures(1);
                tracing::warn!(error = %e, "dropping inconsistent fragment");
            },
        }
    }

    /// Invert crypto, compression, delta and the envelope codec on a
    /// complete blob.
    fn unwrap_blob(
        &mut self,
        blob: &[u8],
        compression: &str,
        delta: Option<bool>,
    ) -> Result<Envelope, PipelineError> {
        let opened = self.crypto.open(blob)?;

        let decompressor: &dyn Compressor = match compression {
            "lz4" => &self.lz4,
            "zstd" => &self.zstd,
            "none" => &NoneCompressor,
            other => {
                return Err(PipelineError::UnknownCompression { tag: other.to_string() });
            },
        };
        let decompressed = decompressor.decompress(&opened)?;

        let wire = match delta {
            Some(is_delta) => self.delta.decode(&decompressed, is_delta)?,
            None => decompressed,
        };

        let envelope = codec::decode(&wire)?;
        self.observe_drift(&envelope);
        self.stats.record_envelopes_received(1);
        Ok(envelope)
    }

    fn observe_drift(&mut self, envelope: &Envelope) {
        let Ok(sender) = chrono::DateTime::parse_from_rfc3339(envelope.timestamp.as_str()) else {
            return;
        };
        let Ok(receiver) = SystemTime::now().duration_since(UNIX_EPOCH) else {
            return;
        };
        let sender_secs = sender.timestamp_micros() as f64 / 1e6;
        self.drift.update(sender_secs, receiver.as_secs_f64());
    }

    fn count_failure(&self, error: &PipelineError) {
        match error {
            PipelineError::Crypto(_) => self.stats.record_decrypt_failures(1),
            PipelineError::Compression(_) | PipelineError::Delta(_) => {
                self.stats.record_decompress_failures(1);
            },
            _ => self.stats.record_decode_failures(1),
        }
        tracing::warn!(error = %error, "dropping undeliverable item");
    }
}

impl std::fmt::Debug for RxPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RxPipeline")
            .field("crypto", &self.crypto)
            .field("pending_messages", &self.defrag.stats().pending_messages)
            .field("pending_frames", &self.dejitter.pending())
            .finish_non_exhaustive()
    }
}
