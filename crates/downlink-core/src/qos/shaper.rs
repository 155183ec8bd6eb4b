//! The four-class shaper and its adaptive wrapper.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use downlink_proto::Priority;
use tokio_util::sync::CancellationToken;

use super::{bucket::TokenBucket, Prioritized, QosConfig};

/// Upper bound on the `dequeue_wait` poll tick.
const MAX_POLL_TICK: Duration = Duration::from_millis(10);

/// Per-class counters, readable as a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QosStatsSnapshot {
    /// Accepted items per class.
    pub enqueued: [u64; 4],
    /// Emitted items per class.
    pub dequeued: [u64; 4],
    /// Items dropped because a queue was full, per class.
    pub dropped: [u64; 4],
    /// Current queue depths per class.
    pub queue_lens: [usize; 4],
}

/// Four priority queues with per-class token buckets.
///
/// Owned by exactly one pipeline; nothing here is shared or locked.
pub struct QosShaper<T> {
    config: QosConfig,
    queues: [VecDeque<T>; 4],
    buckets: [TokenBucket; 4],
    enqueued: [u64; 4],
    dequeued: [u64; 4],
    dropped: [u64; 4],
}

impl<T: Prioritized> QosShaper<T> {
    /// Create a shaper from per-class configuration.
    #[must_use]
    pub fn new(config: QosConfig) -> Self {
        Self::new_at(config, Instant::now())
    }

    /// Create a shaper with its buckets anchored at `now`.
    #[must_use]
    pub fn new_at(config: QosConfig, now: Instant) -> Self {
        let buckets = std::array::from_fn(|i| {
            TokenBucket::new_at(config.classes[i].max_rate_pps, config.classes[i].burst, now)
        });
        Self {
            config,
            queues: std::array::from_fn(|_| VecDeque::new()),
            buckets,
            enqueued: [0; 4],
            dequeued: [0; 4],
            dropped: [0; 4],
        }
    }

    /// Append an item to its priority queue.
    ///
    /// Returns `false` (and counts a drop) when the class queue is at
    /// capacity; a full queue is a normal outcome, not an error.
    pub fn enqueue(&mut self, item: T) -> bool {
        let class = item.priority().index();
        if self.queues[class].len() >= self.config.classes[class].max_queue_len {
            self.dropped[class] += 1;
            return false;
        }
        self.queues[class].push_back(item);
        self.enqueued[class] += 1;
        true
    }

    /// Dequeue the highest-priority item that has a token, at the current
    /// time. Does not block.
    pub fn dequeue(&mut self) -> Option<T> {
        self.dequeue_at(Instant::now())
    }

    /// Dequeue the highest-priority item that has a token, at `now`.
    ///
    /// Scans P0 to P3; a class is skipped when its queue is empty or its
    /// bucket is dry, so a lower class may be served while a higher one is
    /// rate-limited.
    pub fn dequeue_at(&mut self, now: Instant) -> Option<T> {
        for priority in Priority::ALL {
            let class = priority.index();
            if !self.queues[class].is_empty() && self.buckets[class].try_consume_at(now) {
                let item = self.queues[class].pop_front();
                debug_assert!(item.is_some());
                if item.is_some() {
                    self.dequeued[class] += 1;
                }
                return item;
            }
        }
        None
    }

    /// Dequeue, polling on a bounded tick until an item is ready, the
    /// timeout elapses, or `cancel` fires.
    ///
    /// Cancellation is clean: no token is consumed and no item is removed
    /// on the cancel path.
    pub async fn dequeue_wait(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Option<T> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(item) = self.dequeue() {
                return Some(item);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            let tick = MAX_POLL_TICK.min(deadline - now);
            tokio::select! {
                () = cancel.cancelled() => return None,
                () = tokio::time::sleep(tick) => {},
            }
        }
    }

    /// Depth of one class queue.
    #[must_use]
    pub fn queue_len(&self, priority: Priority) -> usize {
        self.queues[priority.index()].len()
    }

    /// Total queued items across classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    /// Whether every queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> QosStatsSnapshot {
        QosStatsSnapshot {
            enqueued: self.enqueued,
            dequeued: self.dequeued,
            dropped: self.dropped,
            queue_lens: std::array::from_fn(|i| self.queues[i].len()),
        }
    }

    /// Drop all queued items.
    pub fn clear(&mut self) {
        for queue in &mut self.queues {
            queue.clear();
        }
    }

    /// Base rate of one class as configured.
    #[must_use]
    pub fn base_rate(&self, priority: Priority) -> f64 {
        self.config.classes[priority.index()].max_rate_pps
    }

    /// Override one class's live bucket rate (used by [`AdaptiveQos`]).
    pub fn set_class_rate_at(&mut self, priority: Priority, rate_pps: f64, now: Instant) {
        self.buckets[priority.index()].set_rate_at(rate_pps, now);
    }
}

/// Shaper wrapper that rescales class rates to an observed bandwidth.
///
/// Given downstream bandwidth `B` (bits/s) and average packet size `S`
/// (bytes), the scale is `B / (8 · S · Σ base_rate)`, clamped into
/// `[0.1, 2.0]`, applied to every class rate.
pub struct AdaptiveQos<T> {
    shaper: QosShaper<T>,
    scale: f64,
}

impl<T: Prioritized> AdaptiveQos<T> {
    /// Scale clamp bounds.
    pub const SCALE_RANGE: (f64, f64) = (0.1, 2.0);

    /// Wrap a shaper at scale 1.0.
    #[must_use]
    pub fn new(shaper: QosShaper<T>) -> Self {
        Self { shaper, scale: 1.0 }
    }

    /// Current scale factor.
    #[must_use]
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Recompute the scale from observed channel capacity.
    pub fn update_channel_capacity(&mut self, bandwidth_bps: f64, avg_packet_size: usize) {
        self.update_channel_capacity_at(bandwidth_bps, avg_packet_size, Instant::now());
    }

    /// [`AdaptiveQos::update_channel_capacity`] at an explicit instant.
    pub fn update_channel_capacity_at(
        &mut self,
        bandwidth_bps: f64,
        avg_packet_size: usize,
        now: Instant,
    ) {
        let total_base: f64 = Priority::ALL.iter().map(|&p| self.shaper.base_rate(p)).sum();
        if total_base <= 0.0 || avg_packet_size == 0 {
            return;
        }

        let sustainable_pps = bandwidth_bps / (8.0 * avg_packet_size as f64);
        let (lo, hi) = Self::SCALE_RANGE;
        self.scale = (sustainable_pps / total_base).clamp(lo, hi);

        for priority in Priority::ALL {
            let rate = self.shaper.base_rate(priority) * self.scale;
            self.shaper.set_class_rate_at(priority, rate, now);
        }

        tracing::debug!(
            scale = self.scale,
            bandwidth_mbps = bandwidth_bps / 1e6,
            "QoS rates rescaled to channel capacity"
        );
    }

    /// The wrapped shaper.
    #[must_use]
    pub fn shaper(&self) -> &QosShaper<T> {
        &self.shaper
    }

    /// The wrapped shaper, mutably.
    pub fn shaper_mut(&mut self) -> &mut QosShaper<T> {
        &mut self.shaper
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use downlink_proto::Envelope;

    use super::*;
    use crate::qos::QosClassConfig;

    fn envelope(priority: Priority) -> Envelope {
        Envelope::new("t", Bytes::from_static(b"x"), priority)
    }

    fn generous_config() -> QosConfig {
        QosConfig {
            classes: [QosClassConfig { max_rate_pps: 1000.0, burst: 100.0, max_queue_len: 100 };
                4],
        }
    }

    #[test]
    fn priority_overtake() {
        let t0 = Instant::now();
        let mut shaper = QosShaper::new_at(generous_config(), t0);

        // Enqueue order: P3, P3, P0, P3. Dequeue order: P0, P3, P3, P3.
        shaper.enqueue(envelope(Priority::P3));
        shaper.enqueue(envelope(Priority::P3));
        shaper.enqueue(envelope(Priority::P0));
        shaper.enqueue(envelope(Priority::P3));

        let order: Vec<Priority> =
            std::iter::from_fn(|| shaper.dequeue_at(t0)).map(|e| e.priority).collect();
        assert_eq!(order, [Priority::P0, Priority::P3, Priority::P3, Priority::P3]);
    }

    #[test]
    fn fifo_within_a_class() {
        let t0 = Instant::now();
        let mut shaper = QosShaper::new_at(generous_config(), t0);

        let envs: Vec<Envelope> = (0..4).map(|_| envelope(Priority::P1)).collect();
        for env in &envs {
            shaper.enqueue(env.clone());
        }

        for expected in &envs {
            assert_eq!(shaper.dequeue_at(t0).unwrap().id, expected.id);
        }
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let mut config = generous_config();
        config.classes[Priority::P2.index()].max_queue_len = 2;
        let mut shaper = QosShaper::new(config);

        assert!(shaper.enqueue(envelope(Priority::P2)));
        assert!(shaper.enqueue(envelope(Priority::P2)));
        assert!(!shaper.enqueue(envelope(Priority::P2)));

        let stats = shaper.stats();
        assert_eq!(stats.dropped[Priority::P2.index()], 1);
        assert_eq!(stats.enqueued[Priority::P2.index()], 2);
        assert_eq!(shaper.queue_len(Priority::P2), 2);
    }

    #[test]
    fn dry_bucket_lets_lower_class_through() {
        let t0 = Instant::now();
        let mut config = generous_config();
        config.classes[Priority::P0.index()].burst = 1.0;
        config.classes[Priority::P0.index()].max_rate_pps = 1.0;
        let mut shaper = QosShaper::new_at(config, t0);

        shaper.enqueue(envelope(Priority::P0));
        shaper.enqueue(envelope(Priority::P0));
        shaper.enqueue(envelope(Priority::P2));

        assert_eq!(shaper.dequeue_at(t0).unwrap().priority, Priority::P0);
        // P0 bucket is dry; P2 is served instead of blocking.
        assert_eq!(shaper.dequeue_at(t0).unwrap().priority, Priority::P2);
        assert!(shaper.dequeue_at(t0).is_none());
    }

    #[test]
    fn rate_limit_holds_over_one_second_window() {
        let t0 = Instant::now();
        let mut config = generous_config();
        config.classes[Priority::P1.index()] =
            QosClassConfig { max_rate_pps: 10.0, burst: 5.0, max_queue_len: 100 };
        let mut shaper = QosShaper::new_at(config, t0);

        for _ in 0..100 {
            shaper.enqueue(envelope(Priority::P1));
        }

        let mut first_second = 0;
        let mut total = 0;
        for ms in 0..10_000 {
            if shaper.dequeue_at(t0 + Duration::from_millis(ms)).is_some() {
                total += 1;
                if ms < 1000 {
                    first_second += 1;
                }
            }
        }

        assert!(first_second <= 15, "first second emitted {first_second}");
        assert!((95..=106).contains(&total), "ten seconds emitted {total}");
        assert!(shaper.queue_len(Priority::P1) <= 100);
    }

    #[tokio::test(start_paused = true)]
    async fn dequeue_wait_returns_when_token_refills() {
        let mut config = generous_config();
        config.classes[Priority::P0.index()] =
            QosClassConfig { max_rate_pps: 100.0, burst: 1.0, max_queue_len: 10 };
        let mut shaper = QosShaper::new(config);

        shaper.enqueue(envelope(Priority::P0));
        shaper.enqueue(envelope(Priority::P0));
        assert!(shaper.dequeue().is_some());

        let cancel = CancellationToken::new();
        // Second item must wait ~10ms for a token; virtual time makes this
        // deterministic.
        let item = shaper.dequeue_wait(Duration::from_secs(1), &cancel).await;
        assert!(item.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn dequeue_wait_times_out_empty() {
        let mut shaper: QosShaper<Envelope> = QosShaper::new(generous_config());
        let cancel = CancellationToken::new();
        let item = shaper.dequeue_wait(Duration::from_millis(50), &cancel).await;
        assert!(item.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dequeue_wait_honors_cancellation() {
        let mut shaper: QosShaper<Envelope> = QosShaper::new(generous_config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let item = shaper.dequeue_wait(Duration::from_secs(3600), &cancel).await;
        assert!(item.is_none());
    }

    #[test]
    fn adaptive_scales_and_clamps() {
        let t0 = Instant::now();
        let shaper: QosShaper<Envelope> = QosShaper::new_at(QosConfig::default(), t0);
        let mut adaptive = AdaptiveQos::new(shaper);

        // Sum of base rates is 1750 pps. 14 Mbps at 1000-byte packets
        // sustains 1750 pps: scale stays 1.0.
        adaptive.update_channel_capacity_at(14.0e6, 1000, t0);
        assert!((adaptive.scale() - 1.0).abs() < 1e-6);

        // A starved channel clamps at the lower bound.
        adaptive.update_channel_capacity_at(1_000.0, 1000, t0);
        assert!((adaptive.scale() - 0.1).abs() < 1e-9);

        // An over-provisioned channel clamps at the upper bound.
        adaptive.update_channel_capacity_at(1.0e12, 1000, t0);
        assert!((adaptive.scale() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn adaptive_rescales_live_buckets() {
        let t0 = Instant::now();
        let mut config = generous_config();
        config.classes[Priority::P0.index()] =
            QosClassConfig { max_rate_pps: 10.0, burst: 1.0, max_queue_len: 100 };
        let shaper: QosShaper<Envelope> = QosShaper::new_at(config, t0);
        let mut adaptive = AdaptiveQos::new(shaper);

        // Clamped to 0.1: P0 refills at 1 pps now.
        adaptive.update_channel_capacity_at(8.0, 1, t0);
        let shaper = adaptive.shaper_mut();

        shaper.enqueue(envelope(Priority::P0));
        shaper.enqueue(envelope(Priority::P0));
        assert!(shaper.dequeue_at(t0).is_some());
        assert!(shaper.dequeue_at(t0 + Duration::from_millis(500)).is_none());
        assert!(shaper.dequeue_at(t0 + Duration::from_millis(1001)).is_some());
    }
}
