//! Receive-side FEC shard collection and recovery.

use std::{
    collections::{BTreeMap, HashMap},
    time::{Duration, Instant},
};

use bytes::Bytes;
use downlink_proto::{
    Envelope, EnvelopeMetadata, FecShardMetadata, FragmentInfo, Priority, Timestamp,
};
use uuid::Uuid;

use crate::fec::{FecError, RsFec};

/// Collects the shards of FEC-protected messages and reconstructs missing
/// data fragments.
///
/// Keyed by `message_id`; the block geometry (`k`, `m`, `shard_len`) and
/// the full blob size arrive with every shard frame. Once any `k` of the
/// `k + m` shards are present and a data shard is missing, the block is
/// reconstructed and the missing data fragments are synthesized for the
/// defragmenter, truncated back to their true lengths.
pub struct ShardCollector {
    timeout: Duration,
    pending: HashMap<Uuid, Block>,
    recovered: u64,
    unrecoverable: u64,
}

struct Block {
    k: usize,
    m: usize,
    shard_len: usize,
    payload_size: u64,
    timestamp: Timestamp,
    schema_id: u32,
    priority: Priority,
    topic: String,
    source_node: String,
    sequence_number: u32,
    shards: BTreeMap<u32, Vec<u8>>,
    recovered: bool,
    first_arrival: Instant,
}

impl ShardCollector {
    /// Create a collector whose stale blocks expire after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, pending: HashMap::new(), recovered: 0, unrecoverable: 0 }
    }

    /// Blocks repaired so far.
    #[must_use]
    pub fn recovered_count(&self) -> u64 {
        self.recovered
    }

    /// Blocks evicted with unrecoverable data loss.
    #[must_use]
    pub fn unrecoverable_count(&self) -> u64 {
        self.unrecoverable
    }

    /// Blocks currently collecting shards.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Record one shard carrier.
    ///
    /// `payload_size` is the full pre-fragmentation blob size from the
    /// frame metadata. Returns any data fragments newly reconstructed for
    /// the defragmenter (empty for most arrivals).
    ///
    /// # Errors
    ///
    /// `FecError` when the shard contradicts its block's geometry or the
    /// reconstruction itself fails; the shard is dropped, the block kept.
    pub fn insert_at(
        &mut self,
        fec: &FecShardMetadata,
        carrier: &Envelope,
        payload_size: u64,
        now: Instant,
    ) -> Result<Vec<Envelope>, FecError> {
        let (k, m) = (fec.k as usize, fec.m as usize);
        let shard_len = fec.shard_len as usize;

        if k == 0 || m == 0 || k + m > 255 {
            return Err(bad(format!("bad block geometry k={k} m={m}")));
        }
        if fec.shard_index as usize >= k + m {
            return Err(bad(format!("shard index {} out of range", fec.shard_index)));
        }
        if shard_len == 0 || carrier.payload.len() > shard_len {
            return Err(bad(format!(
                "shard payload {} exceeds shard_len {shard_len}",
                carrier.payload.len()
            )));
        }

        let Some(frag) = carrier.metadata.fragment_info else {
            return Err(bad("shard carrier without fragment metadata"));
        };
        let message_id = frag.message_id;

        let block = self.pending.entry(message_id).or_insert_with(|| Block {
            k,
            m,
            shard_len,
            payload_size,
            timestamp: carrier.timestamp.clone(),
            schema_id: carrier.schema_id,
            priority: carrier.priority,
            topic: carrier.topic.clone(),
            source_node: carrier.metadata.source_node.clone(),
            sequence_number: carrier.metadata.sequence_number,
            shards: BTreeMap::new(),
            recovered: false,
            first_arrival: now,
        });

        if block.recovered {
            return Ok(Vec::new());
        }
        if block.k != k || block.m != m || block.shard_len != shard_len {
            return Err(bad("shard geometry changed within a block"));
        }

        let mut padded = carrier.payload.to_vec();
        padded.resize(shard_len, 0);
        block.shards.entry(fec.shard_index).or_insert(padded);

        if block.shards.len() < block.k {
            return Ok(Vec::new());
        }

        let missing_data: Vec<usize> =
            (0..block.k).filter(|i| !block.shards.contains_key(&(*i as u32))).collect();
        if missing_data.is_empty() {
            return Ok(Vec::new());
        }

        let options: Vec<Option<Vec<u8>>> =
            (0..block.k + block.m).map(|i| block.shards.get(&(i as u32)).cloned()).collect();
        let erasures: Vec<usize> =
            options.iter().enumerate().filter(|(_, s)| s.is_none()).map(|(i, _)| i).collect();

        let data = RsFec::new(block.k, block.m)?.decode(options, &erasures)?;

        let fragments = missing_data
            .iter()
            .map(|&i| synthesize_fragment(block, message_id, i, &data[i]))
            .collect::<Result<Vec<_>, _>>()?;

        block.recovered = true;
        self.recovered += 1;
        tracing::debug!(
            message_id = %message_id,
            recovered = fragments.len(),
            "FEC block reconstructed"
        );

        Ok(fragments)
    }

    /// Drop a block (its message completed or was evicted elsewhere).
    pub fn discard(&mut self, message_id: &Uuid) {
        self.pending.remove(message_id);
    }

    /// Evict stale blocks; returns how many were unrecoverable.
    pub fn sweep_at(&mut self, now: Instant) -> u64 {
        let expired: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|(_, b)| now.duration_since(b.first_arrival) >= self.timeout)
            .map(|(id, _)| *id)
            .collect();

        let mut lost = 0;
        for id in expired {
            if let Some(block) = self.pending.remove(&id) {
                let data_present =
                    (0..block.k).filter(|i| block.shards.contains_key(&(*i as u32))).count();
                if !block.recovered && data_present < block.k {
                    lost += 1;
                    tracing::warn!(
                        message_id = %id,
                        shards = block.shards.len(),
                        k = block.k,
                        "FEC block expired unrecoverable"
                    );
                }
            }
        }
        self.unrecoverable += lost;
        lost
    }
}

fn bad(reason: impl Into<String>) -> FecError {
    FecError::BadParameters { reason: reason.into() }
}

/// Rebuild the fragment envelope for recovered data shard `i`.
fn synthesize_fragment(
    block: &Block,
    message_id: Uuid,
    i: usize,
    shard: &[u8],
) -> Result<Envelope, FecError> {
    // Every fragment but the last fills the whole budget (= shard_len);
    // the last holds the remainder of the blob.
    let true_len = if i + 1 < block.k {
        block.shard_len
    } else {
        let tail = block.payload_size as usize;
        let head = (block.k - 1) * block.shard_len;
        tail.checked_sub(head).ok_or_else(|| bad("blob size inconsistent with block geometry"))?
    };
    if true_len > shard.len() {
        return Err(bad("recovered shard shorter than its true length"));
    }

    Ok(Envelope {
        id: Uuid::new_v4(),
        timestamp: block.timestamp.clone(),
        schema_id: block.schema_id,
        priority: block.priority,
        topic: block.topic.clone(),
        payload: Bytes::copy_from_slice(&shard[..true_len]),
        metadata: EnvelopeMetadata {
            source_node: block.source_node.clone(),
            sequence_number: block.sequence_number,
            fragment_info: Some(FragmentInfo {
                fragment_id: i as u32,
                total_fragments: block.k as u32,
                offset: (i * block.shard_len) as u32,
                length: true_len as u32,
                message_id,
            }),
            fec_info: None,
            crypto_info: None,
        },
    })
}
