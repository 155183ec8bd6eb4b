//! Channel conditioning and error management.
//!
//! Three independent conditioners around the transport edge:
//!
//! - [`TxPacer`]: spaces transmissions at a target interval, smoothing
//!   bursts from upstream stages. The only suspension point on the send
//!   path besides QoS waiting.
//! - [`RxDejitter`]: a short-horizon reorder buffer that restores
//!   sequence-number order, declares gaps past its horizon, and counts
//!   observed loss.
//! - [`DriftCompensator`]: least-squares fit of receiver time against
//!   sender timestamps, mapping remote clocks into the local timebase.

mod dejitter;
mod drift;
mod pacer;

pub use dejitter::RxDejitter;
pub use drift::DriftCompensator;
pub use pacer::TxPacer;
