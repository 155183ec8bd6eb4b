//! Telemetry processing chain for the downlink pipeline.
//!
//! The stages, in producer order: envelope codec (from `downlink-proto`),
//! optional XOR [`delta`] coding, block [`compress`]ion, the crypto box
//! (from `downlink-crypto`), MTU-aware [`packetize`]-ation with optional
//! Reed–Solomon [`fec`] protection, priority [`qos`] shaping, and [`ccem`]
//! channel conditioning. The consumer side mirrors the chain in reverse.
//!
//! [`pipeline`] composes the stages into [`pipeline::TxPipeline`] and
//! [`pipeline::RxPipeline`]; everything else is usable stand-alone.
//!
//! # Concurrency model
//!
//! Each pipeline instance owns its stage state exclusively. Every stage is a
//! pure synchronous function except QoS [`qos::QosShaper::dequeue_wait`] and
//! the [`ccem::TxPacer`], which suspend on time and honor a cancellation
//! token. The only cross-stage shared state is the [`stats::PipelineStats`]
//! counter block.

pub mod ccem;
pub mod compress;
pub mod config;
pub mod delta;
pub mod fec;
pub mod packetize;
pub mod pipeline;
pub mod qos;
pub mod stats;

pub use compress::{CompressionError, Compressor, Lz4Compressor, ZstdCompressor};
pub use config::{ConfigError, PipelineConfig};
pub use delta::{DeltaDecoder, DeltaEncoder, DeltaError, DeltaMode};
pub use fec::{AdaptiveRsFec, FecError, RsFec};
pub use packetize::{Defragmenter, FragmentError, Packetizer};
pub use pipeline::{CryptoStage, PipelineError, RxPipeline, TxPipeline};
pub use qos::{Prioritized, QosClassConfig, QosConfig, QosShaper, TokenBucket};
pub use stats::{PipelineStats, StatsSnapshot};
