//! Error types for the ground-side server.

use thiserror::Error;

/// Errors surfaced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Invalid server or pipeline configuration.
    #[error("config: {0}")]
    Config(String),

    /// Socket-level failure (bind, accept).
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),

    /// Building the RX pipeline failed.
    #[error(transparent)]
    Pipeline(#[from] downlink_core::PipelineError),
}
