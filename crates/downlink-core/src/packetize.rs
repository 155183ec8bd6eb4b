//! MTU-aware fragmentation and reassembly.
//!
//! [`Packetizer`] splits an envelope whose payload exceeds the per-fragment
//! budget (`mtu - header_reserve`) into fragment envelopes sharing a fresh
//! `message_id`. [`Defragmenter`] collects fragments per message, emits the
//! reassembled envelope once complete, and garbage-collects incomplete
//! messages on a deadline. A dropped middle fragment times the message out;
//! recovery belongs to FEC or the layers above.
//!
//! Time is passed in explicitly (`*_at(now)`) so eviction behavior is
//! testable on virtual instants; the plain methods sample `Instant::now()`.

use std::{
    collections::{BTreeMap, HashMap},
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use downlink_proto::{Envelope, EnvelopeMetadata, FragmentInfo, Priority, Timestamp};
use thiserror::Error;
use uuid::Uuid;

/// Bytes reserved per fragment for envelope framing overhead.
pub const DEFAULT_HEADER_RESERVE: usize = 100;

/// Default deadline for incomplete messages.
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default cap on concurrently reassembling messages.
pub const DEFAULT_MAX_MESSAGES: usize = 100;

/// Errors from fragmentation and reassembly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FragmentError {
    /// MTU leaves no room for payload after the header reserve.
    #[error("mtu {mtu} too small: minimum 64, header reserve {reserve}")]
    MtuTooSmall {
        /// Configured MTU.
        mtu: usize,
        /// Configured header reserve.
        reserve: usize,
    },

    /// A fragment's byte range collides with one already recorded.
    #[error("overlapping fragment {fragment_id} of message {message_id}")]
    OverlappingFragment {
        /// Message the fragment belongs to.
        message_id: Uuid,
        /// Offending fragment index.
        fragment_id: u32,
    },

    /// A fragment contradicts the recorded geometry of its message
    /// (different total, out-of-range id, or length mismatch).
    #[error("inconsistent fragment metadata for message {message_id}: {reason}")]
    InconsistentTotal {
        /// Message the fragment belongs to.
        message_id: Uuid,
        /// What was contradicted.
        reason: &'static str,
    },
}

/// Splits payloads into MTU-bounded fragment envelopes.
#[derive(Debug, Clone, Copy)]
pub struct Packetizer {
    mtu: usize,
    reserve: usize,
}

impl Packetizer {
    /// Create with the default header reserve.
    ///
    /// # Errors
    ///
    /// `FragmentError::MtuTooSmall` when `mtu < 64` or no payload budget
    /// remains after the reserve.
    pub fn new(mtu: usize) -> Result<Self, FragmentError> {
        Self::with_header_reserve(mtu, DEFAULT_HEADER_RESERVE)
    }

    /// Create with an explicit header reserve.
    ///
    /// # Errors
    ///
    /// `FragmentError::MtuTooSmall` when `mtu < 64` or `mtu <= reserve`.
    pub fn with_header_reserve(mtu: usize, reserve: usize) -> Result<Self, FragmentError> {
        if mtu < 64 || mtu <= reserve {
            return Err(FragmentError::MtuTooSmall { mtu, reserve });
        }
        Ok(Self { mtu, reserve })
    }

    /// Maximum payload bytes per fragment.
    #[must_use]
    pub fn payload_budget(&self) -> usize {
        self.mtu - self.reserve
    }

    /// Split an envelope into fragments if its payload exceeds the budget.
    ///
    /// Identity for payloads within budget (no fragment metadata attached).
    /// Fragments get fresh envelope ids, inherit `timestamp`, `priority`,
    /// `topic` and the producer identity, and share one fresh `message_id`.
    /// They are returned in ascending `fragment_id` order.
    #[must_use]
    pub fn packetize(&self, envelope: Envelope) -> Vec<Envelope> {
        let budget = self.payload_budget();
        let payload_size = envelope.payload.len();

        if payload_size <= budget {
            return vec![envelope];
        }

        let message_id = Uuid::new_v4();
        let total_fragments = payload_size.div_ceil(budget) as u32;

        (0..total_fragments)
            .map(|fragment_id| {
                let offset = fragment_id as usize * budget;
                let end = (offset + budget).min(payload_size);
                let payload = envelope.payload.slice(offset..end);

                Envelope {
                    id: Uuid::new_v4(),
                    timestamp: envelope.timestamp.clone(),
                    schema_id: envelope.schema_id,
                    priority: envelope.priority,
                    topic: envelope.topic.clone(),
                    metadata: EnvelopeMetadata {
                        source_node: envelope.metadata.source_node.clone(),
                        sequence_number: envelope.metadata.sequence_number,
                        fragment_info: Some(FragmentInfo {
                            fragment_id,
                            total_fragments,
                            offset: offset as u32,
                            length: payload.len() as u32,
                            message_id,
                        }),
                        fec_info: None,
                        crypto_info: None,
                    },
                    payload,
                }
            })
            .collect()
    }
}

struct StoredFragment {
    payload: Bytes,
    offset: u32,
    arrival: Instant,
}

struct PendingMessage {
    total_fragments: u32,
    timestamp: Timestamp,
    priority: Priority,
    topic: String,
    schema_id: u32,
    source_node: String,
    sequence_number: u32,
    fragments: BTreeMap<u32, StoredFragment>,
}

impl PendingMessage {
    fn oldest_arrival(&self) -> Option<Instant> {
        self.fragments.values().map(|f| f.arrival).min()
    }
}

/// Counters exposed by [`Defragmenter::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DefragStats {
    /// Messages currently awaiting fragments.
    pub pending_messages: usize,
    /// Fragments currently buffered.
    pub pending_fragments: usize,
    /// Messages evicted on the reassembly deadline.
    pub timeouts: u64,
    /// Messages evicted to respect the capacity cap.
    pub evictions: u64,
    /// Duplicate fragments ignored.
    pub duplicates: u64,
}

/// Reassembles fragmented envelopes, order-insensitively.
pub struct Defragmenter {
    timeout: Duration,
    max_messages: usize,
    pending: HashMap<Uuid, PendingMessage>,
    timeouts: u64,
    evictions: u64,
    duplicates: u64,
}

impl Defragmenter {
    /// Create with explicit deadline and capacity.
    #[must_use]
    pub fn new(timeout: Duration, max_messages: usize) -> Self {
        Self {
            timeout,
            max_messages,
            pending: HashMap::new(),
            timeouts: 0,
            evictions: 0,
            duplicates: 0,
        }
    }

    /// Process one arriving envelope, stamped with the current time.
    ///
    /// See [`Defragmenter::insert_at`].
    pub fn insert(&mut self, envelope: Envelope) -> Result<Option<Envelope>, FragmentError> {
        self.insert_at(envelope, Instant::now())
    }

    /// Process one arriving envelope.
    ///
    /// - An envelope without fragment metadata is emitted unchanged.
    /// - A duplicate `(message_id, fragment_id)` keeps the first copy and
    ///   ignores the newcomer.
    /// - The final fragment of a message triggers reassembly: payloads are
    ///   concatenated in `fragment_id` order into an envelope with a fresh
    ///   id, no fragment metadata, and the original timestamp, priority and
    ///   topic.
    /// - When the table is at capacity, the message whose oldest fragment
    ///   is oldest is evicted to admit the newcomer.
    ///
    /// # Errors
    ///
    /// - `FragmentError::InconsistentTotal` when the fragment contradicts
    ///   recorded geometry
    /// - `FragmentError::OverlappingFragment` when its byte range collides
    ///
    /// Either error rejects the fragment; previously buffered fragments of
    /// the message are kept.
    pub fn insert_at(
        &mut self,
        envelope: Envelope,
        now: Instant,
    ) -> Result<Option<Envelope>, FragmentError> {
        let Some(info) = envelope.metadata.fragment_info else {
            return Ok(Some(envelope));
        };

        let message_id = info.message_id;

        if info.total_fragments == 0 || info.fragment_id >= info.total_fragments {
            return Err(FragmentError::InconsistentTotal {
                message_id,
                reason: "fragment id out of range",
            });
        }
        if info.length as usize != envelope.payload.len() {
            return Err(FragmentError::InconsistentTotal {
                message_id,
                reason: "declared length does not match payload",
            });
        }

        if !self.pending.contains_key(&message_id) && self.pending.len() >= self.max_messages {
            self.evict_oldest();
        }

        let entry = self.pending.entry(message_id).or_insert_with(|| PendingMessage {
            total_fragments: info.total_fragments,
            timestamp: envelope.timestamp.clone(),
            priority: envelope.priority,
            topic: envelope.topic.clone(),
            schema_id: envelope.schema_id,
            source_node: envelope.metadata.source_node.clone(),
            sequence_number: envelope.metadata.sequence_number,
            fragments: BTreeMap::new(),
        });

        if entry.total_fragments != info.total_fragments {
            return Err(FragmentError::InconsistentTotal {
                message_id,
                reason: "total_fragments changed between fragments",
            });
        }

        if entry.fragments.contains_key(&info.fragment_id) {
            self.duplicates += 1;
            return Ok(None);
        }

        let start = info.offset as u64;
        let end = start + u64::from(info.length);
        for stored in entry.fragments.values() {
            let s = u64::from(stored.offset);
            let e = s + stored.payload.len() as u64;
            if start < e && s < end {
                return Err(FragmentError::OverlappingFragment {
                    message_id,
                    fragment_id: info.fragment_id,
                });
            }
        }

        entry.fragments.insert(
            info.fragment_id,
            StoredFragment { payload: envelope.payload, offset: info.offset, arrival: now },
        );

        if entry.fragments.len() as u32 == entry.total_fragments {
            // Remove first so a reassembly failure cannot wedge the slot.
            let message = match self.pending.remove(&message_id) {
                Some(message) => message,
                None => return Ok(None),
            };
            return Ok(Some(reassemble(message_id, message)?));
        }

        Ok(None)
    }

    /// Evict every message whose oldest fragment predates the deadline.
    ///
    /// Timeouts are observability events, not consumer-visible errors:
    /// each eviction is logged and counted. Returns the evicted message
    /// ids so callers can clean up per-message side tables.
    pub fn sweep_at(&mut self, now: Instant) -> Vec<Uuid> {
        let expired: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|(_, msg)| {
                msg.oldest_arrival()
                    .is_some_and(|oldest| now.duration_since(oldest) >= self.timeout)
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(msg) = self.pending.remove(id) {
                self.timeouts += 1;
                tracing::warn!(
                    message_id = %id,
                    received = msg.fragments.len(),
                    total = msg.total_fragments,
                    "reassembly timeout, dropping incomplete message"
                );
            }
        }

        expired
    }

    /// [`Defragmenter::sweep_at`] stamped with the current time.
    pub fn sweep(&mut self) -> Vec<Uuid> {
        self.sweep_at(Instant::now())
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> DefragStats {
        DefragStats {
            pending_messages: self.pending.len(),
            pending_fragments: self.pending.values().map(|m| m.fragments.len()).sum(),
            timeouts: self.timeouts,
            evictions: self.evictions,
            duplicates: self.duplicates,
        }
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .pending
            .iter()
            .filter_map(|(id, msg)| msg.oldest_arrival().map(|arrival| (*id, arrival)))
            .min_by_key(|&(_, arrival)| arrival)
            .map(|(id, _)| id);

        if let Some(id) = oldest {
            self.pending.remove(&id);
            self.evictions += 1;
            tracing::warn!(message_id = %id, "defragmenter at capacity, evicting oldest message");
        }
    }
}

impl Default for Defragmenter {
    fn default() -> Self {
        Self::new(DEFAULT_REASSEMBLY_TIMEOUT, DEFAULT_MAX_MESSAGES)
    }
}

fn reassemble(message_id: Uuid, message: PendingMessage) -> Result<Envelope, FragmentError> {
    let mut payload = BytesMut::new();
    let mut expected_offset: u64 = 0;

    for fragment in message.fragments.values() {
        if u64::from(fragment.offset) != expected_offset {
            return Err(FragmentError::InconsistentTotal {
                message_id,
                reason: "fragment ranges do not tile the payload",
            });
        }
        expected_offset += fragment.payload.len() as u64;
        payload.extend_from_slice(&fragment.payload);
    }

    Ok(Envelope {
        id: Uuid::new_v4(),
        timestamp: message.timestamp,
        schema_id: message.schema_id,
        priority: message.priority,
        topic: message.topic,
        payload: payload.freeze(),
        metadata: EnvelopeMetadata {
            source_node: message.source_node,
            sequence_number: message.sequence_number,
            fragment_info: None,
            fec_info: None,
            crypto_info: None,
        },
    })
}
