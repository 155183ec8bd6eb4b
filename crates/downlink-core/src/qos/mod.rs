//! Priority queueing with per-class token-bucket rate limiting.
//!
//! Four queues, one per [`Priority`] class, each paired with a
//! [`TokenBucket`]. Dequeue scans P0 to P3 and returns the first item whose
//! queue is non-empty and whose bucket holds a token. Lower classes may be
//! starved arbitrarily long by higher traffic; the per-class rate limits
//! bound how hard any one class can dominate.
//!
//! [`QosShaper`] is generic over the queued item: the spec-level contract
//! queues envelopes, the pipeline queues ready-to-send stream frames. Both
//! carry a [`Priority`] via [`Prioritized`].

mod bucket;
mod shaper;

pub use bucket::TokenBucket;
use downlink_proto::{Envelope, Priority, StreamFrame};
use serde::Deserialize;
pub use shaper::{AdaptiveQos, QosShaper, QosStatsSnapshot};

/// Anything that can be scheduled by priority class.
pub trait Prioritized {
    /// The scheduling class of this item.
    fn priority(&self) -> Priority;
}

impl Prioritized for Envelope {
    fn priority(&self) -> Priority {
        self.priority
    }
}

impl Prioritized for StreamFrame {
    fn priority(&self) -> Priority {
        self.metadata.priority
    }
}

/// Rate limiting and capacity for one priority class.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QosClassConfig {
    /// Token refill rate in packets per second.
    pub max_rate_pps: f64,
    /// Token bucket capacity (burst allowance).
    pub burst: f64,
    /// Maximum queued items before new arrivals are dropped.
    pub max_queue_len: usize,
}

/// Per-class configuration for the shaper.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QosConfig {
    /// Class configs indexed by priority (`P0` first).
    pub classes: [QosClassConfig; 4],
}

impl QosConfig {
    /// Config for one priority class.
    #[must_use]
    pub fn class(&self, priority: Priority) -> &QosClassConfig {
        &self.classes[priority.index()]
    }
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            classes: [
                QosClassConfig { max_rate_pps: 1000.0, burst: 100.0, max_queue_len: 1000 },
                QosClassConfig { max_rate_pps: 500.0, burst: 50.0, max_queue_len: 500 },
                QosClassConfig { max_rate_pps: 200.0, burst: 20.0, max_queue_len: 200 },
                QosClassConfig { max_rate_pps: 50.0, burst: 10.0, max_queue_len: 100 },
            ],
        }
    }
}
