//! Ground-side telemetry consumer.
//!
//! [`Server`] accepts stream-transport connections and spawns one handler
//! per connection. Handlers are independent: each owns a complete
//! [`RxPipeline`] and shares nothing with its siblings beyond the
//! statistics block. Decoded envelopes are delivered to the consumer
//! through a channel.
//!
//! Per the framing contract, a short read or an unparseable metadata line
//! terminates the connection (logged, not retried); failures beyond the
//! framing layer are confined to the offending item by the pipeline.

#![forbid(unsafe_code)]

mod error;

use std::sync::Arc;

use bytes::BytesMut;
use downlink_core::{CryptoStage, PipelineConfig, PipelineStats, RxPipeline, StatsSnapshot};
use downlink_crypto::{CryptoBox, SigningKey, SymmetricKey, VerifyingKey};
use downlink_proto::{Envelope, FrameError, StreamFrame, MAX_FRAME_SIZE};
pub use error::ServerError;
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::{interval, Duration},
};
use tokio_util::sync::CancellationToken;

/// Housekeeping cadence for idle connections (timer sweeps, de-jitter
/// flushes).
const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Per-connection key material.
///
/// Connections each get their own [`CryptoStage`] built from this setup,
/// keeping handler state fully independent.
#[derive(Clone)]
pub enum CryptoSetup {
    /// Plaintext link.
    None,
    /// Pre-shared symmetric key with the producer's verification key.
    Symmetric {
        /// Shared 32-byte secret-box key.
        key: SymmetricKey,
        /// Our signing key (unused for receive-only links, but part of
        /// the box).
        signing: SigningKey,
        /// The producer's Ed25519 verification key.
        peer_verify: VerifyingKey,
    },
}

impl CryptoSetup {
    fn stage(&self) -> CryptoStage {
        match self {
            Self::None => CryptoStage::None,
            Self::Symmetric { key, signing, peer_verify } => CryptoStage::Symmetric(
                CryptoBox::new("shared", signing.clone(), *peer_verify, key),
            ),
        }
    }
}

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to (e.g. `0.0.0.0:5555`).
    pub bind_address: String,
    /// Pipeline options, mirrored from the producer side.
    pub pipeline: PipelineConfig,
    /// Key material for inbound links.
    pub crypto: CryptoSetup,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:5555".to_string(),
            pipeline: PipelineConfig::default(),
            crypto: CryptoSetup::None,
        }
    }
}

/// Ground-station telemetry server.
pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    stats: Arc<PipelineStats>,
}

impl Server {
    /// Bind the listener.
    ///
    /// # Errors
    ///
    /// `ServerError::Config` for an invalid pipeline configuration,
    /// `ServerError::Transport` when the bind fails.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        config.pipeline.validate().map_err(|e| ServerError::Config(e.to_string()))?;

        let listener = TcpListener::bind(&config.bind_address).await?;
        tracing::info!(addr = %listener.local_addr()?, "telemetry server listening");

        Ok(Self { listener, config, stats: Arc::new(PipelineStats::new()) })
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// `ServerError::Transport` when the socket has no local address.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared statistics for all connections.
    #[must_use]
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until `cancel` fires, delivering decoded
    /// envelopes to `delivery`.
    ///
    /// # Errors
    ///
    /// `ServerError::Transport` when accepting fails fatally.
    pub async fn run(
        self,
        delivery: mpsc::Sender<Envelope>,
        cancel: CancellationToken,
    ) -> Result<(), ServerError> {
        loop {
            let (stream, peer) = tokio::select! {
                () = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted?,
            };

            tracing::info!(%peer, "producer connected");

            let pipeline = RxPipeline::new(
                &self.config.pipeline,
                self.config.crypto.stage(),
                Arc::clone(&self.stats),
            )?;

            let delivery = delivery.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                handle_connection(stream, pipeline, delivery, cancel).await;
                tracing::info!(%peer, "producer disconnected");
            });
        }
        Ok(())
    }
}

/// Receive loop for one connection.
///
/// Accumulates bytes in a buffer and extracts complete length-prefixed
/// frames from it, so the concurrent housekeeping tick can never tear a
/// partial read. An oversized prefix or an unparseable metadata line ends
/// the connection.
async fn handle_connection(
    mut stream: TcpStream,
    mut pipeline: RxPipeline,
    delivery: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
) {
    let mut housekeeping = interval(TICK_INTERVAL);
    let mut buf = BytesMut::with_capacity(64 * 1024);

    'connection: loop {
        // Drain every complete frame already buffered.
        loop {
            let body = match extract_frame_body(&mut buf) {
                Ok(Some(body)) => body,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "bad framing, closing connection");
                    break 'connection;
                },
            };

            let frame = match StreamFrame::from_body(&body) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(error = %e, "bad frame, closing connection");
                    break 'connection;
                },
            };

            for envelope in pipeline.process(frame) {
                if delivery.send(envelope).await.is_err() {
                    return; // consumer gone
                }
            }
        }

        tokio::select! {
            () = cancel.cancelled() => break,

            _ = housekeeping.tick() => {
                for envelope in pipeline.tick() {
                    if delivery.send(envelope).await.is_err() {
                        return;
                    }
                }
            },

            read = stream.read_buf(&mut buf) => match read {
                Ok(0) => {
                    if !buf.is_empty() {
                        tracing::debug!(left = buf.len(), "peer closed mid-frame");
                    }
                    break;
                },
                Ok(_) => {},
                Err(e) => {
                    tracing::debug!(error = %e, "read error, closing connection");
                    break;
                },
            },
        }
    }
}

/// Pop one complete frame body off the buffer, `None` when more bytes are
/// needed.
fn extract_frame_body(buf: &mut BytesMut) -> Result<Option<BytesMut>, FrameError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let body_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if body_len > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge { size: body_len, max: MAX_FRAME_SIZE });
    }
    if buf.len() < 4 + body_len {
        return Ok(None);
    }
    let _ = buf.split_to(4);
    Ok(Some(buf.split_to(body_len)))
}

/// Log a one-line summary of a statistics snapshot.
pub fn log_stats(snapshot: &StatsSnapshot) {
    tracing::info!(
        envelopes = snapshot.envelopes_received,
        frames = snapshot.frames_received,
        bytes = snapshot.bytes_received,
        loss = snapshot.observed_loss,
        timeouts = snapshot.reassembly_timeouts,
        decode_failures = snapshot.decode_failures,
        decrypt_failures = snapshot.decrypt_failures,
        fec_recovered = snapshot.fec_blocks_recovered,
        "pipeline statistics"
    );
}
