//! Receive-side reorder buffer.

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

/// Reorder buffer keyed by sequence number.
///
/// Items are released strictly in ascending sequence order, starting from
/// sequence zero. An arrival more than `buffer_size` slots past the next
/// expected sequence declares a gap: everything buffered is flushed in
/// order and the missing slots are counted as observed loss. Entries that
/// sit longer than `max_wait` are flushed the same way by
/// [`RxDejitter::flush_expired_at`].
///
/// A sequence below the expected one is a retransmission and is dropped
/// (idempotent delivery), unless it is so far below that the producer must
/// have wrapped, in which case the buffer resynchronizes.
#[derive(Debug)]
pub struct RxDejitter<T> {
    buffer_size: u32,
    max_wait: Duration,
    next_expected: u32,
    buffer: BTreeMap<u32, (T, Instant)>,
    observed_loss: u64,
    duplicates: u64,
}

impl<T> RxDejitter<T> {
    /// Create a buffer holding up to `buffer_size` out-of-order slots.
    #[must_use]
    pub fn new(buffer_size: u32, max_wait: Duration) -> Self {
        Self {
            buffer_size,
            max_wait,
            next_expected: 0,
            buffer: BTreeMap::new(),
            observed_loss: 0,
            duplicates: 0,
        }
    }

    /// Missing sequence slots observed so far.
    #[must_use]
    pub fn observed_loss(&self) -> u64 {
        self.observed_loss
    }

    /// Retransmissions and duplicates dropped so far.
    #[must_use]
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Items currently held out of order.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Record an arrival stamped with the current time.
    pub fn insert(&mut self, item: T, seq: u32) -> Vec<T> {
        self.insert_at(item, seq, Instant::now())
    }

    /// Record an arrival and release everything now in order.
    pub fn insert_at(&mut self, item: T, seq: u32, now: Instant) -> Vec<T> {
        if seq < self.next_expected {
            // Far below the horizon means the producer wrapped; resync.
            if self.next_expected - seq > u32::MAX / 2 {
                self.observed_loss += u64::from(u32::MAX - self.next_expected) + 1;
                self.next_expected = seq;
            } else {
                self.duplicates += 1;
                return Vec::new();
            }
        }

        if self.buffer.contains_key(&seq) {
            self.duplicates += 1;
            return Vec::new();
        }
        self.buffer.insert(seq, (item, now));

        if seq > self.next_expected && seq - self.next_expected > self.buffer_size {
            // Gap declared: flush everything in order, count the holes.
            return self.flush_all();
        }

        self.drain_in_order()
    }

    /// Release items that waited longer than `max_wait`, advancing past
    /// any missing slots before them.
    pub fn flush_expired_at(&mut self, now: Instant) -> Vec<T> {
        let mut released = Vec::new();

        while let Some((&seq, (_, arrival))) = self.buffer.first_key_value() {
            if now.saturating_duration_since(*arrival) < self.max_wait {
                break;
            }
            if let Some((item, _)) = self.buffer.remove(&seq) {
                self.skip_to(seq);
                self.next_expected = seq.wrapping_add(1);
                released.push(item);
            }
        }

        // The flush may have unblocked in-order successors.
        released.extend(self.drain_in_order());
        released
    }

    fn drain_in_order(&mut self) -> Vec<T> {
        let mut released = Vec::new();
        while let Some((item, _)) = self.buffer.remove(&self.next_expected) {
            released.push(item);
            self.next_expected = self.next_expected.wrapping_add(1);
        }
        released
    }

    fn flush_all(&mut self) -> Vec<T> {
        let mut released = Vec::new();
        let drained = std::mem::take(&mut self.buffer);
        for (seq, (item, _)) in drained {
            self.skip_to(seq);
            self.next_expected = seq.wrapping_add(1);
            released.push(item);
        }
        released
    }

    fn skip_to(&mut self, seq: u32) {
        if seq > self.next_expected {
            self.observed_loss += u64::from(seq - self.next_expected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dejitter(size: u32) -> RxDejitter<u32> {
        RxDejitter::new(size, Duration::from_millis(100))
    }

    /// Feed `(seq, seq)` pairs and collect everything released.
    fn feed(d: &mut RxDejitter<u32>, seqs: &[u32], t0: Instant) -> Vec<u32> {
        let mut out = Vec::new();
        for (i, &seq) in seqs.iter().enumerate() {
            out.extend(d.insert_at(seq, seq, t0 + Duration::from_millis(i as u64)));
        }
        out
    }

    #[test]
    fn in_order_arrivals_pass_straight_through() {
        let mut d = dejitter(3);
        let out = feed(&mut d, &[0, 1, 2, 3], Instant::now());
        assert_eq!(out, [0, 1, 2, 3]);
        assert_eq!(d.observed_loss(), 0);
    }

    #[test]
    fn permuted_arrivals_are_reordered() {
        // Spec scenario: 2,0,4,1,3 comes out 0,1,2,3,4.
        let mut d = dejitter(3);
        let out = feed(&mut d, &[2, 0, 4, 1, 3], Instant::now());
        assert_eq!(out, [0, 1, 2, 3, 4]);
        assert_eq!(d.observed_loss(), 0);
        assert_eq!(d.pending(), 0);
    }

    #[test]
    fn lost_packet_is_skipped_after_flush() {
        // Spec scenario: with seq 3 dropped, emission is 0,1,2,4 and the
        // loss counter increments by one.
        let mut d = dejitter(3);
        let t0 = Instant::now();
        let mut out = feed(&mut d, &[2, 0, 4, 1], t0);
        // 4 stays buffered waiting for 3.
        assert_eq!(out, [0, 1, 2]);
        assert_eq!(d.pending(), 1);

        out.extend(d.flush_expired_at(t0 + Duration::from_secs(1)));
        assert_eq!(out, [0, 1, 2, 4]);
        assert_eq!(d.observed_loss(), 1);
    }

    #[test]
    fn far_ahead_arrival_declares_a_gap() {
        let mut d = dejitter(3);
        let t0 = Instant::now();

        assert_eq!(d.insert_at(0, 0, t0), [0]);
        assert!(d.insert_at(2, 2, t0).is_empty());

        // Seq 10 is more than buffer_size past next_expected (1).
        let out = d.insert_at(10, 10, t0);
        assert_eq!(out, [2, 10]);
        // Missing: 1, 3..=9 -> 8 slots.
        assert_eq!(d.observed_loss(), 8);
        assert_eq!(d.pending(), 0);
    }

    #[test]
    fn late_join_counts_the_initial_gap() {
        let mut d = dejitter(3);
        let out = feed(&mut d, &[100, 101, 102], Instant::now());
        assert_eq!(out, [100, 101, 102]);
        assert_eq!(d.observed_loss(), 100);
    }

    #[test]
    fn retransmission_is_dropped() {
        let mut d = dejitter(3);
        let t0 = Instant::now();
        feed(&mut d, &[0, 1, 2], t0);

        assert!(d.insert_at(1, 1, t0).is_empty());
        assert_eq!(d.duplicates(), 1);

        // A duplicate of a still-buffered item is also dropped.
        assert!(d.insert_at(5, 5, t0).is_empty());
        assert!(d.insert_at(5, 5, t0).is_empty());
        assert_eq!(d.duplicates(), 2);
    }

    #[test]
    fn flush_expired_respects_max_wait() {
        let mut d = dejitter(10);
        let t0 = Instant::now();
        assert_eq!(d.insert_at(0, 0, t0), [0]);
        assert!(d.insert_at(2, 2, t0).is_empty());

        // Before max_wait nothing moves.
        assert!(d.flush_expired_at(t0 + Duration::from_millis(50)).is_empty());

        // After max_wait the waiter is released past the hole.
        let out = d.flush_expired_at(t0 + Duration::from_millis(100));
        assert_eq!(out, [2]);
        assert_eq!(d.observed_loss(), 1);
    }

    #[test]
    fn flush_unblocks_in_order_successors() {
        let mut d = dejitter(10);
        let t0 = Instant::now();
        assert_eq!(d.insert_at(0, 0, t0), [0]);
        assert!(d.insert_at(2, 2, t0).is_empty());
        // 3 arrives much later than 2.
        assert!(d.insert_at(3, 3, t0 + Duration::from_millis(90)).is_empty());

        // Only 2 has expired, but releasing it unblocks 3 as well.
        let out = d.flush_expired_at(t0 + Duration::from_millis(110));
        assert_eq!(out, [2, 3]);
    }

    #[test]
    fn sequence_wrap_resynchronizes() {
        let mut d = RxDejitter::new(3, Duration::from_millis(100));
        let t0 = Instant::now();

        // Drive the horizon to the top of the sequence space.
        let out = d.insert_at(u32::MAX, u32::MAX, t0);
        assert_eq!(out, [u32::MAX]);

        // Post-wrap sequences resume from zero.
        let out = d.insert_at(0, 0, t0);
        assert_eq!(out, [0]);
        assert_eq!(d.duplicates(), 0);
    }
}
