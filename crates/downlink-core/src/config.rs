//! Pipeline configuration.
//!
//! Every component takes an explicit config value; nothing is keyword-
//! driven. The structs deserialize from JSON with unknown keys rejected,
//! and [`PipelineConfig::validate`] checks cross-field constraints before a
//! pipeline is built.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::{delta::DeltaMode, qos::QosConfig};

/// Errors from configuration validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A field value is out of its legal range.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Offending option.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { field, reason: reason.into() }
}

/// Which compressor variant the pipeline uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// LZ4: latency-optimized.
    Fast,
    /// Zstandard: ratio-optimized.
    Balanced,
}

/// Compressor selection and level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CompressionConfig {
    /// Variant to use on the send side.
    pub algorithm: CompressionAlgorithm,
    /// Variant-specific level (`fast`: informational; `balanced`: 1..=22).
    pub level: Option<i32>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self { algorithm: CompressionAlgorithm::Fast, level: None }
    }
}

/// Delta-codec mode.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase", deny_unknown_fields)]
pub enum DeltaConfig {
    /// No delta coding.
    Off,
    /// XOR delta whenever a same-sized reference exists.
    Simple,
    /// XOR delta unless the change density crosses the threshold.
    Adaptive {
        /// Non-zero-byte fraction at which full frames are sent.
        #[serde(default = "default_delta_threshold")]
        threshold: f64,
    },
}

fn default_delta_threshold() -> f64 {
    DeltaMode::DEFAULT_THRESHOLD
}

impl DeltaConfig {
    /// The runtime mode for this config.
    #[must_use]
    pub fn mode(&self) -> DeltaMode {
        match *self {
            Self::Off => DeltaMode::Off,
            Self::Simple => DeltaMode::Simple,
            Self::Adaptive { threshold } => DeltaMode::Adaptive { threshold },
        }
    }
}

/// FEC policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase", deny_unknown_fields)]
pub enum FecConfig {
    /// No parity shards.
    Off,
    /// Fixed parity count per block.
    Fixed {
        /// Data shards per block (standalone use).
        k: usize,
        /// Parity shards per block.
        m: usize,
    },
    /// Parity count follows the observed loss rate.
    Adaptive {
        /// Data shards per block (standalone use).
        k: usize,
        /// Lower parity bound.
        m_min: usize,
        /// Upper parity bound.
        m_max: usize,
    },
}

/// Everything the telemetry pipeline recognizes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PipelineConfig {
    /// Maximum transport unit seen by the packetizer (>= 64).
    pub mtu: usize,
    /// Bytes reserved per fragment for envelope framing.
    pub header_reserve: usize,
    /// Defragmenter eviction deadline.
    #[serde(with = "duration_secs")]
    pub reassembly_timeout: Duration,
    /// Defragmenter capacity (concurrent messages).
    pub max_in_flight_messages: usize,
    /// Compressor variant and level.
    pub compression: CompressionConfig,
    /// Delta-codec mode.
    pub delta: DeltaConfig,
    /// FEC policy.
    pub fec: FecConfig,
    /// Per-priority shaping.
    pub qos: QosConfig,
    /// CCEM TX smoothing interval.
    #[serde(with = "duration_secs")]
    pub tx_pacer_interval: Duration,
    /// Reorder-buffer horizon in sequence slots.
    pub rx_dejitter_size: u32,
    /// Reorder-buffer residence limit.
    #[serde(with = "duration_secs")]
    pub rx_dejitter_max_wait: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mtu: 1400,
            header_reserve: 100,
            reassembly_timeout: Duration::from_secs(5),
            max_in_flight_messages: 100,
            compression: CompressionConfig::default(),
            delta: DeltaConfig::Off,
            fec: FecConfig::Off,
            qos: QosConfig::default(),
            tx_pacer_interval: Duration::from_millis(10),
            rx_dejitter_size: 10,
            rx_dejitter_max_wait: Duration::from_millis(100),
        }
    }
}

impl PipelineConfig {
    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// `ConfigError::Invalid` naming the first offending option.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mtu < 64 {
            return Err(invalid("mtu", format!("{} is below the minimum of 64", self.mtu)));
        }
        if self.mtu <= self.header_reserve {
            return Err(invalid(
                "mtu",
                format!("{} leaves no payload after header_reserve {}", self.mtu, self.header_reserve),
            ));
        }
        if self.max_in_flight_messages == 0 {
            return Err(invalid("max_in_flight_messages", "must be at least 1"));
        }

        if let CompressionConfig { algorithm: CompressionAlgorithm::Balanced, level: Some(level) } =
            self.compression
        {
            if !(1..=22).contains(&level) {
                return Err(invalid("compression_level", format!("{level} outside 1..=22")));
            }
        }

        if let DeltaConfig::Adaptive { threshold } = self.delta {
            if !(threshold > 0.0 && threshold <= 1.0) {
                return Err(invalid("delta_threshold", format!("{threshold} outside (0, 1]")));
            }
        }

        match self.fec {
            FecConfig::Off => {},
            FecConfig::Fixed { k, m } => {
                if k == 0 {
                    return Err(invalid("fec", "k must be at least 1"));
                }
                if k + m > 255 {
                    return Err(invalid("fec", format!("k + m = {} exceeds 255", k + m)));
                }
            },
            FecConfig::Adaptive { k, m_min, m_max } => {
                if k == 0 {
                    return Err(invalid("fec", "k must be at least 1"));
                }
                if m_min > m_max {
                    return Err(invalid("fec", format!("m_min {m_min} > m_max {m_max}")));
                }
                if k + m_max > 255 {
                    return Err(invalid("fec", format!("k + m_max = {} exceeds 255", k + m_max)));
                }
            },
        }

        for (i, class) in self.qos.classes.iter().enumerate() {
            if class.max_rate_pps < 0.0 || !class.max_rate_pps.is_finite() {
                return Err(invalid("qos", format!("class P{i} rate must be finite and >= 0")));
            }
            if class.burst < 0.0 || !class.burst.is_finite() {
                return Err(invalid("qos", format!("class P{i} burst must be finite and >= 0")));
            }
        }

        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
