//! The producer-side processing chain.

use std::sync::Arc;

use bytes::Bytes;
use downlink_proto::{
    codec, CryptoInfo, Envelope, EnvelopeMetadata, FecInfo, FragmentInfo, FecShardMetadata,
    FrameMetadata, StreamFrame,
};
use uuid::Uuid;

use super::{CryptoStage, PipelineError};
use crate::{
    compress::{Compressor, Lz4Compressor, ZstdCompressor},
    config::{CompressionAlgorithm, FecConfig, PipelineConfig},
    delta::{DeltaEncoder, DeltaMode},
    fec::{parity_for_loss, RsFec},
    packetize::Packetizer,
    stats::PipelineStats,
};

/// Parity policy applied to fragmented messages.
enum FecPolicy {
    Off,
    Fixed { m: usize },
    Adaptive { m_min: usize, m_max: usize, loss_rate: f64 },
}

impl FecPolicy {
    fn parity_for(&self, k: usize) -> usize {
        let m = match *self {
            Self::Off => 0,
            Self::Fixed { m } => m,
            Self::Adaptive { m_min, m_max, loss_rate } => {
                parity_for_loss(k, loss_rate, m_min, m_max)
            },
        };
        // GF(2^8) bounds the block; shrink parity rather than fail.
        m.min(255_usize.saturating_sub(k))
    }
}

/// Producer-side pipeline: envelope in, ready-to-send frames out.
///
/// Owns all stage state for one producer. Each processed envelope is
/// encoded exactly once; every derived carrier (fragment, parity shard, or
/// the whole blob) is assigned the next sequence number for this
/// `source_node` and rendered as one stream frame.
pub struct TxPipeline {
    source_node: String,
    next_seq: u32,
    next_block_id: u64,
    compressor: Box<dyn Compressor>,
    delta: DeltaEncoder,
    crypto: CryptoStage,
    packetizer: Packetizer,
    fec: FecPolicy,
    stats: Arc<PipelineStats>,
}

impl TxPipeline {
    /// Build a pipeline from a validated configuration.
    ///
    /// # Errors
    ///
    /// `PipelineError::Config` when the configuration fails validation.
    pub fn new(
        config: &PipelineConfig,
        source_node: impl Into<String>,
        crypto: CryptoStage,
        stats: Arc<PipelineStats>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let compressor: Box<dyn Compressor> = match config.compression.algorithm {
            CompressionAlgorithm::Fast => {
                Box::new(Lz4Compressor::new(config.compression.level.unwrap_or(0).max(0) as u32))
            },
            CompressionAlgorithm::Balanced => Box::new(
                config.compression.level.map_or_else(ZstdCompressor::default, ZstdCompressor::new),
            ),
        };

        let fec = match config.fec {
            FecConfig::Off => FecPolicy::Off,
            FecConfig::Fixed { m, .. } => FecPolicy::Fixed { m },
            FecConfig::Adaptive { m_min, m_max, .. } => {
                FecPolicy::Adaptive { m_min, m_max, loss_rate: 0.0 }
            },
        };

        Ok(Self {
            source_node: source_node.into(),
            next_seq: 0,
            next_block_id: 0,
            compressor,
            delta: DeltaEncoder::new(config.delta.mode()),
            crypto,
            packetizer: Packetizer::with_header_reserve(config.mtu, config.header_reserve)?,
            fec,
            stats,
        })
    }

    /// Feed back a downstream loss estimate for the adaptive FEC policy.
    pub fn update_loss_rate(&mut self, p: f64) {
        if let FecPolicy::Adaptive { loss_rate, .. } = &mut self.fec {
            *loss_rate = p.clamp(0.0, 1.0);
        }
    }

    /// Run one envelope through the chain.
    ///
    /// Returns the frames to transmit, in emission order (data fragments
    /// ascending, then parity shards). Failures here are fatal for this
    /// envelope and surface to the caller; pipeline state stays valid.
    ///
    /// # Errors
    ///
    /// Any stage error, wrapped in [`PipelineError`].
    pub fn process(&mut self, envelope: Envelope) -> Result<Vec<StreamFrame>, PipelineError> {
        let delta_enabled = !matches!(self.delta.mode(), DeltaMode::Off);

        let wire = codec::encode(&envelope)?;
        let (encoded, is_delta) =
            if delta_enabled { self.delta.encode(&wire) } else { (wire.to_vec(), false) };
        let compressed = self.compressor.compress(&encoded)?;

        let (blob, crypto_info) = match self.crypto.seal(&compressed)? {
            Some(sealed) => {
                let info = CryptoInfo {
                    key_id: self.crypto.key_id().unwrap_or_default().to_string(),
                    nonce: sealed.nonce,
                    signature: sealed.signature,
                };
                (sealed.into_bytes(), Some(info))
            },
            None => (compressed, None),
        };

        let payload_size = blob.len() as u64;

        let carrier = Envelope {
            id: envelope.id,
            timestamp: envelope.timestamp.clone(),
            schema_id: envelope.schema_id,
            priority: envelope.priority,
            topic: envelope.topic.clone(),
            payload: Bytes::from(blob),
            metadata: EnvelopeMetadata {
                source_node: self.source_node.clone(),
                sequence_number: 0, // assigned per carrier below
                fragment_info: None,
                fec_info: None,
                crypto_info,
            },
        };

        let mut carriers = self.packetizer.packetize(carrier);
        let shard_len = self.protect_block(&mut carriers)?;

        let mut frames = Vec::with_capacity(carriers.len());
        for mut carrier in carriers {
            carrier.metadata.sequence_number = self.next_seq;
            self.next_seq = self.next_seq.wrapping_add(1);

            let fec = carrier.metadata.fec_info.map(|info| FecShardMetadata {
                k: info.k,
                m: info.m,
                block_id: info.block_id,
                shard_index: carrier
                    .metadata
                    .fragment_info
                    .map_or(0, |frag| frag.fragment_id),
                shard_len: shard_len as u32,
            });

            let metadata = FrameMetadata {
                envelope_id: carrier.id,
                topic: carrier.topic.clone(),
                priority: carrier.priority,
                timestamp: carrier.timestamp.as_str().to_string(),
                compression: self.compressor.algorithm().to_string(),
                payload_size,
                delta: delta_enabled.then_some(is_delta),
                fec,
            };

            let blob = codec::encode(&carrier)?;
            self.stats.record_bytes_sent(blob.len() as u64);
            frames.push(StreamFrame { metadata, blob });
        }

        self.stats.record_envelopes_sent(1);
        self.stats.record_frames_sent(frames.len() as u64);
        Ok(frames)
    }

    /// Append parity carriers for a fragmented message, tagging every
    /// carrier with the block geometry. Returns the padded shard length
    /// (0 when no FEC was applied).
    fn protect_block(&mut self, carriers: &mut Vec<Envelope>) -> Result<usize, PipelineError> {
        let k = carriers.len();
        if k < 2 {
            return Ok(0);
        }
        let m = self.fec.parity_for(k);
        if m == 0 {
            return Ok(0);
        }

        let Some(first_frag) = carriers[0].metadata.fragment_info else {
            return Ok(0);
        };
        let message_id = first_frag.message_id;

        let block_id = self.next_block_id;
        self.next_block_id = self.next_block_id.wrapping_add(1);

        let payloads: Vec<Vec<u8>> = carriers.iter().map(|c| c.payload.to_vec()).collect();
        let shards = RsFec::new(k, m)?.encode(&payloads)?;
        let shard_len = shards[k].len();

        let fec_info = FecInfo { k: k as u32, m: m as u32, block_id };
        for carrier in carriers.iter_mut() {
            carrier.metadata.fec_info = Some(fec_info);
        }

        let template = carriers[0].clone();
        for (j, parity) in shards.into_iter().skip(k).enumerate() {
            carriers.push(Envelope {
                id: Uuid::new_v4(),
                timestamp: template.timestamp.clone(),
                schema_id: template.schema_id,
                priority: template.priority,
                topic: template.topic.clone(),
                payload: Bytes::from(parity),
                metadata: EnvelopeMetadata {
                    source_node: self.source_node.clone(),
                    sequence_number: 0,
                    fragment_info: Some(FragmentInfo {
                        fragment_id: (k + j) as u32,
                        total_fragments: k as u32,
                        offset: 0,
                        length: shard_len as u32,
                        message_id,
                    }),
                    fec_info: Some(fec_info),
                    crypto_info: None,
                },
            });
        }

        Ok(shard_len)
    }
}

impl std::fmt::Debug for TxPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxPipeline")
            .field("source_node", &self.source_node)
            .field("next_seq", &self.next_seq)
            .field("compression", &self.compressor.algorithm())
            .field("crypto", &self.crypto)
            .finish_non_exhaustive()
    }
}
