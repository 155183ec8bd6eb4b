//! Robot-side telemetry producer.
//!
//! [`TelemetryClient`] owns a complete TX chain: envelopes go in through a
//! channel, and an internal driver task runs them through the
//! [`downlink_core::TxPipeline`], queues the resulting frames in the QoS
//! shaper, paces emissions, and writes length-prefixed frames to the
//! stream transport. Protocol logic stays in `downlink-core`; this crate
//! is the I/O glue.

#![forbid(unsafe_code)]

pub mod client;
pub mod transport;

pub use client::{ClientError, TelemetryClient};
pub use transport::{StreamTransport, Transport};
