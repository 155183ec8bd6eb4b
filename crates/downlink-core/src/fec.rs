//! Reed–Solomon erasure coding over GF(2⁸).
//!
//! [`RsFec`] wraps a systematic RS(k, m) code: `encode` leaves the k data
//! shards untouched and appends m parity shards; `decode` reconstructs the
//! data from any k of the k + m shards, given the erasure positions.
//! Decoding uses erasures only - the transport drops corrupted frames
//! rather than delivering them, so no error-location search is needed.
//!
//! Shards inside one block must be equal length; senders pad to the longest
//! data shard and record true lengths out-of-band (fragment metadata).
//!
//! [`AdaptiveRsFec`] resizes m against an observed loss rate. When m
//! changes, a new code replaces the old one; blocks already in flight
//! decode under the geometry recorded with the block.

use std::collections::VecDeque;

use reed_solomon_erasure::galois_8::ReedSolomon;
use thiserror::Error;

/// Errors from the FEC stage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FecError {
    /// More shards were lost than the parity can repair.
    #[error("unrecoverable block: {lost} shards lost, parity repairs at most {max}")]
    Unrecoverable {
        /// Number of erased shards.
        lost: usize,
        /// Maximum repairable erasures (m).
        max: usize,
    },

    /// Invalid code geometry or shard set.
    #[error("bad FEC parameters: {reason}")]
    BadParameters {
        /// What was wrong.
        reason: String,
    },
}

fn bad(reason: impl Into<String>) -> FecError {
    FecError::BadParameters { reason: reason.into() }
}

/// Parity count needed to ride out loss rate `p` on k-data-shard blocks:
/// `ceil(p·k / (1 − p))`, clamped into `[m_min, m_max]`.
#[must_use]
pub fn parity_for_loss(k: usize, p: f64, m_min: usize, m_max: usize) -> usize {
    if p >= 1.0 {
        return m_max;
    }
    let p = p.max(0.0);
    let raw = (p * k as f64) / (1.0 - p);
    (raw.ceil() as usize).clamp(m_min, m_max)
}

/// Systematic Reed–Solomon erasure code with fixed (k, m).
pub struct RsFec {
    k: usize,
    m: usize,
    // None for the degenerate m = 0 identity code.
    codec: Option<ReedSolomon>,
}

impl RsFec {
    /// Create an RS(k, m) code.
    ///
    /// `m = 0` is the identity: encode returns the data unchanged and
    /// decode tolerates no erasures.
    ///
    /// # Errors
    ///
    /// `FecError::BadParameters` for `k = 0` or `k + m > 255` (GF(2⁸)
    /// limit).
    pub fn new(k: usize, m: usize) -> Result<Self, FecError> {
        if k == 0 {
            return Err(bad("k must be >= 1"));
        }
        if k + m > 255 {
            return Err(bad(format!("k + m = {} exceeds GF(2^8) limit of 255", k + m)));
        }

        let codec = if m == 0 {
            None
        } else {
            Some(ReedSolomon::new(k, m).map_err(|e| bad(e.to_string()))?)
        };

        Ok(Self { k, m, codec })
    }

    /// Number of data shards.
    #[must_use]
    pub fn k(&self) -> usize {
        self.k
    }

    /// Number of parity shards.
    #[must_use]
    pub fn m(&self) -> usize {
        self.m
    }

    /// Encode k data packets into k + m shards.
    ///
    /// Data packets may have differing lengths; parity is computed over
    /// zero-padded copies at the longest length, and the returned data
    /// shards are the originals, unpadded. Parity shards all have the
    /// padded length.
    ///
    /// # Errors
    ///
    /// `FecError::BadParameters` when `packets.len() != k`.
    pub fn encode(&self, packets: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, FecError> {
        if packets.len() != self.k {
            return Err(bad(format!("expected {} data packets, got {}", self.k, packets.len())));
        }

        let Some(codec) = &self.codec else {
            return Ok(packets.to_vec());
        };

        let shard_len = packets.iter().map(Vec::len).max().unwrap_or(0);

        let mut shards: Vec<Vec<u8>> = packets
            .iter()
            .map(|p| {
                let mut padded = p.clone();
                padded.resize(shard_len, 0);
                padded
            })
            .collect();
        shards.extend(std::iter::repeat_n(vec![0u8; shard_len], self.m));

        if shard_len > 0 {
            codec.encode(&mut shards).map_err(|e| bad(e.to_string()))?;
        }

        let mut out = packets.to_vec();
        out.extend(shards.into_iter().skip(self.k));
        Ok(out)
    }

    /// Recover the k data shards from a partial shard set.
    ///
    /// `shards` must hold k + m entries, `None` at each erased position;
    /// `erasures` lists those positions. Present shards must be equal
    /// length (senders pad before transmission).
    ///
    /// # Errors
    ///
    /// - `FecError::Unrecoverable` when more than m positions are erased
    /// - `FecError::BadParameters` for a malformed shard set
    pub fn decode(
        &self,
        shards: Vec<Option<Vec<u8>>>,
        erasures: &[usize],
    ) -> Result<Vec<Vec<u8>>, FecError> {
        if shards.len() != self.k + self.m {
            return Err(bad(format!(
                "expected {} shards, got {}",
                self.k + self.m,
                shards.len()
            )));
        }
        if erasures.len() > self.m {
            return Err(FecError::Unrecoverable { lost: erasures.len(), max: self.m });
        }
        if let Some(&pos) = erasures.iter().find(|&&p| p >= self.k + self.m) {
            return Err(bad(format!("erasure position {pos} out of range")));
        }

        let mut option_shards = shards;
        for &pos in erasures {
            option_shards[pos] = None;
        }

        let missing_data = option_shards[..self.k].iter().filter(|s| s.is_none()).count();
        if missing_data == 0 {
            // Nothing to repair; hand the data back.
            return collect_data(option_shards, self.k);
        }

        let Some(codec) = &self.codec else {
            return Err(FecError::Unrecoverable { lost: missing_data, max: 0 });
        };

        let lens: Vec<usize> =
            option_shards.iter().flatten().map(Vec::len).collect();
        let Some(&shard_len) = lens.first() else {
            return Err(bad("no shards present"));
        };
        if lens.iter().any(|&l| l != shard_len) {
            return Err(bad("present shards have differing lengths"));
        }

        if shard_len == 0 {
            for slot in &mut option_shards {
                slot.get_or_insert_with(Vec::new);
            }
            return collect_data(option_shards, self.k);
        }

        codec.reconstruct(&mut option_shards).map_err(|e| match e {
            reed_solomon_erasure::Error::TooFewShardsPresent => FecError::Unrecoverable {
                lost: option_shards.iter().filter(|s| s.is_none()).count(),
                max: self.m,
            },
            other => bad(other.to_string()),
        })?;

        collect_data(option_shards, self.k)
    }
}

fn collect_data(shards: Vec<Option<Vec<u8>>>, k: usize) -> Result<Vec<Vec<u8>>, FecError> {
    shards
        .into_iter()
        .take(k)
        .map(|s| s.ok_or_else(|| bad("data shard still missing after reconstruction")))
        .collect()
}

impl std::fmt::Debug for RsFec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsFec").field("k", &self.k).field("m", &self.m).finish()
    }
}

/// Number of loss observations the adaptive code remembers.
const LOSS_WINDOW: usize = 100;

/// Reed–Solomon code whose parity count follows the observed loss rate.
///
/// Maintains `m = ceil(p·k / (1 − p))` clamped into `[m_min, m_max]` for
/// the recent loss rate `p`. This is a sender-side policy: receivers build
/// an [`RsFec`] from the geometry each block carries.
pub struct AdaptiveRsFec {
    k: usize,
    m_min: usize,
    m_max: usize,
    fec: RsFec,
    outcomes: VecDeque<bool>,
}

impl AdaptiveRsFec {
    /// Create with `m = m_min` until losses are observed.
    ///
    /// # Errors
    ///
    /// `FecError::BadParameters` when `m_min > m_max` or the extreme
    /// geometry RS(k, `m_max`) is itself invalid.
    pub fn new(k: usize, m_min: usize, m_max: usize) -> Result<Self, FecError> {
        if m_min > m_max {
            return Err(bad(format!("m_min {m_min} > m_max {m_max}")));
        }
        // Validate the largest geometry up front so later swaps cannot fail.
        let _ = RsFec::new(k, m_max)?;

        Ok(Self { k, m_min, m_max, fec: RsFec::new(k, m_min)?, outcomes: VecDeque::new() })
    }

    /// Parity count currently in effect.
    #[must_use]
    pub fn current_m(&self) -> usize {
        self.fec.m()
    }

    /// Loss rate over the observation window (0 when empty).
    #[must_use]
    pub fn loss_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let lost = self.outcomes.iter().filter(|&&l| l).count();
        lost as f64 / self.outcomes.len() as f64
    }

    /// Record one delivery outcome and re-derive m.
    pub fn record_outcome(&mut self, lost: bool) {
        if self.outcomes.len() == LOSS_WINDOW {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(lost);
        self.apply_loss_rate(self.loss_rate());
    }

    /// Override the loss-rate estimate directly (external observer).
    pub fn update_loss_rate(&mut self, p: f64) {
        self.outcomes.clear();
        self.apply_loss_rate(p.clamp(0.0, 1.0));
    }

    fn apply_loss_rate(&mut self, p: f64) {
        let target = parity_for_loss(self.k, p, self.m_min, self.m_max);

        if target != self.fec.m() {
            // Geometry was validated in new(); swapping cannot fail.
            if let Ok(fec) = RsFec::new(self.k, target) {
                tracing::debug!(k = self.k, m = target, loss_rate = p, "FEC parity adjusted");
                self.fec = fec;
            }
        }
    }

    /// Encode under the current geometry.
    ///
    /// # Errors
    ///
    /// As [`RsFec::encode`].
    pub fn encode(&self, packets: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, FecError> {
        self.fec.encode(packets)
    }
}

impl std::fmt::Debug for AdaptiveRsFec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveRsFec")
            .field("k", &self.k)
            .field("m", &self.fec.m())
            .field("m_min", &self.m_min)
            .field("m_max", &self.m_max)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packets(k: usize, len: usize) -> Vec<Vec<u8>> {
        (0..k).map(|i| (0..len).map(|j| (i * 31 + j) as u8).collect()).collect()
    }

    #[test]
    fn encode_is_systematic() {
        let fec = RsFec::new(4, 2).unwrap();
        let data = packets(4, 100);
        let shards = fec.encode(&data).unwrap();

        assert_eq!(shards.len(), 6);
        assert_eq!(&shards[..4], &data[..]);
        assert!(shards[4..].iter().all(|p| p.len() == 100));
    }

    #[test]
    fn recovers_two_erased_data_shards() {
        let fec = RsFec::new(4, 2).unwrap();
        let data = packets(4, 100);
        let mut shards: Vec<Option<Vec<u8>>> =
            fec.encode(&data).unwrap().into_iter().map(Some).collect();

        shards[1] = None;
        shards[3] = None;

        let recovered = fec.decode(shards, &[1, 3]).unwrap();
        assert_eq!(recovered, data);
    }

    #[test]
    fn recovers_mixed_data_and_parity_erasures() {
        let fec = RsFec::new(4, 2).unwrap();
        let data = packets(4, 64);
        let mut shards: Vec<Option<Vec<u8>>> =
            fec.encode(&data).unwrap().into_iter().map(Some).collect();

        shards[0] = None;
        shards[5] = None;

        let recovered = fec.decode(shards, &[0, 5]).unwrap();
        assert_eq!(recovered, data);
    }

    #[test]
    fn too_many_erasures_is_unrecoverable() {
        let fec = RsFec::new(4, 2).unwrap();
        let data = packets(4, 32);
        let shards: Vec<Option<Vec<u8>>> =
            fec.encode(&data).unwrap().into_iter().map(Some).collect();

        let err = fec.decode(shards, &[0, 1, 2]).unwrap_err();
        assert_eq!(err, FecError::Unrecoverable { lost: 3, max: 2 });
    }

    #[test]
    fn unequal_data_packets_are_padded_for_parity() {
        let fec = RsFec::new(3, 2).unwrap();
        let data = vec![vec![1u8; 10], vec![2u8; 7], vec![3u8; 4]];
        let shards = fec.encode(&data).unwrap();

        // Data shards come back unpadded, parity at the padded length.
        assert_eq!(shards[1].len(), 7);
        assert_eq!(shards[3].len(), 10);
        assert_eq!(shards[4].len(), 10);

        // Reconstruction works over padded copies.
        let mut padded: Vec<Option<Vec<u8>>> = shards
            .into_iter()
            .map(|mut s| {
                s.resize(10, 0);
                Some(s)
            })
            .collect();
        padded[2] = None;
        let recovered = fec.decode(padded, &[2]).unwrap();
        assert_eq!(&recovered[2][..4], &[3u8; 4]);
        assert_eq!(&recovered[2][4..], &[0u8; 6]);
    }

    #[test]
    fn zero_parity_degenerates_to_identity() {
        let fec = RsFec::new(4, 0).unwrap();
        let data = packets(4, 16);

        assert_eq!(fec.encode(&data).unwrap(), data);

        let shards: Vec<Option<Vec<u8>>> = data.iter().cloned().map(Some).collect();
        assert_eq!(fec.decode(shards, &[]).unwrap(), data);

        let mut missing: Vec<Option<Vec<u8>>> = data.into_iter().map(Some).collect();
        missing[0] = None;
        assert!(matches!(
            fec.decode(missing, &[0]),
            Err(FecError::Unrecoverable { lost: 1, max: 0 })
        ));
    }

    #[test]
    fn no_erasures_is_a_passthrough() {
        let fec = RsFec::new(4, 2).unwrap();
        let data = packets(4, 50);
        let shards: Vec<Option<Vec<u8>>> =
            fec.encode(&data).unwrap().into_iter().map(Some).collect();
        assert_eq!(fec.decode(shards, &[]).unwrap(), data);
    }

    #[test]
    fn rejects_bad_geometry() {
        assert!(matches!(RsFec::new(0, 2), Err(FecError::BadParameters { .. })));
        assert!(matches!(RsFec::new(250, 6), Err(FecError::BadParameters { .. })));
        assert!(RsFec::new(253, 2).is_ok());
    }

    #[test]
    fn rejects_wrong_shard_counts() {
        let fec = RsFec::new(4, 2).unwrap();
        assert!(matches!(fec.encode(&packets(3, 8)), Err(FecError::BadParameters { .. })));
        let short: Vec<Option<Vec<u8>>> = packets(5, 8).into_iter().map(Some).collect();
        assert!(matches!(fec.decode(short, &[]), Err(FecError::BadParameters { .. })));
    }

    #[test]
    fn empty_shards_roundtrip() {
        let fec = RsFec::new(2, 1).unwrap();
        let data = vec![Vec::new(), Vec::new()];
        let shards = fec.encode(&data).unwrap();
        assert_eq!(shards.len(), 3);

        let mut options: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        options[0] = None;
        assert_eq!(fec.decode(options, &[0]).unwrap(), data);
    }

    #[test]
    fn adaptive_starts_at_m_min() {
        let fec = AdaptiveRsFec::new(4, 1, 4).unwrap();
        assert_eq!(fec.current_m(), 1);
        assert_eq!(fec.loss_rate(), 0.0);
    }

    #[test]
    fn adaptive_m_follows_loss_rate() {
        let mut fec = AdaptiveRsFec::new(4, 1, 4).unwrap();

        // p = 0.2 -> m = ceil(0.2 * 4 / 0.8) = 1
        fec.update_loss_rate(0.2);
        assert_eq!(fec.current_m(), 1);

        // p = 0.4 -> m = ceil(0.4 * 4 / 0.6) = 3
        fec.update_loss_rate(0.4);
        assert_eq!(fec.current_m(), 3);

        // p = 0.9 -> huge, clamped to m_max
        fec.update_loss_rate(0.9);
        assert_eq!(fec.current_m(), 4);

        fec.update_loss_rate(0.0);
        assert_eq!(fec.current_m(), 1);
    }

    #[test]
    fn adaptive_tracks_recorded_outcomes() {
        let mut fec = AdaptiveRsFec::new(4, 1, 4).unwrap();
        for _ in 0..6 {
            fec.record_outcome(false);
        }
        for _ in 0..4 {
            fec.record_outcome(true);
        }
        assert!((fec.loss_rate() - 0.4).abs() < 1e-9);
        assert_eq!(fec.current_m(), 3);
    }

    #[test]
    fn adaptive_blocks_decode_under_their_own_geometry() {
        let mut adaptive = AdaptiveRsFec::new(4, 1, 4).unwrap();
        let data = packets(4, 40);
        let old_block = adaptive.encode(&data).unwrap();
        let old_m = adaptive.current_m();

        adaptive.update_loss_rate(0.4);
        assert_ne!(adaptive.current_m(), old_m);

        // The receiver rebuilds the old geometry from block metadata.
        let old_code = RsFec::new(4, old_m).unwrap();
        let mut shards: Vec<Option<Vec<u8>>> = old_block.into_iter().map(Some).collect();
        shards[2] = None;
        assert_eq!(old_code.decode(shards, &[2]).unwrap(), data);
    }

    #[test]
    fn adaptive_rejects_inverted_bounds() {
        assert!(matches!(AdaptiveRsFec::new(4, 3, 2), Err(FecError::BadParameters { .. })));
    }
}
