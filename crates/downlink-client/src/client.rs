//! The telemetry client and its driver task.

use std::{sync::Arc, time::Duration};

use downlink_core::{
    ccem::TxPacer, CryptoStage, PipelineConfig, PipelineStats, QosShaper, StatsSnapshot,
    TxPipeline,
};
use downlink_proto::{Envelope, StreamFrame};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::transport::{StreamTransport, Transport};

/// How long the driver blocks waiting for a rate-limited frame before
/// re-checking for new envelopes and cancellation.
const DEQUEUE_SLICE: Duration = Duration::from_millis(50);

/// Depth of the envelope hand-off channel into the driver task.
const INGEST_DEPTH: usize = 64;

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connecting or writing to the transport failed.
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),

    /// Building the pipeline failed.
    #[error(transparent)]
    Pipeline(#[from] downlink_core::PipelineError),

    /// The driver task has shut down; the envelope was not accepted.
    #[error("client disconnected")]
    Disconnected,
}

/// Robot-side producer handle.
///
/// Envelopes submitted with [`TelemetryClient::send`] flow through the TX
/// pipeline, the QoS shaper and the pacer inside a driver task that owns
/// all stage state; this handle stays cheap to use from the sampling loop.
pub struct TelemetryClient {
    ingest: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
    driver: tokio::task::JoinHandle<()>,
    stats: Arc<PipelineStats>,
}

impl TelemetryClient {
    /// Connect to a consumer and start the driver task.
    ///
    /// # Errors
    ///
    /// `ClientError::Transport` when the connection fails,
    /// `ClientError::Pipeline` when the configuration is invalid.
    pub async fn connect(
        addr: &str,
        config: &PipelineConfig,
        source_node: impl Into<String>,
        crypto: CryptoStage,
    ) -> Result<Self, ClientError> {
        let stats = Arc::new(PipelineStats::new());
        let pipeline = TxPipeline::new(config, source_node, crypto, Arc::clone(&stats))?;
        let transport = StreamTransport::connect(addr).await?;

        let (ingest, ingest_rx) = mpsc::channel(INGEST_DEPTH);
        let cancel = CancellationToken::new();

        let driver = tokio::spawn(drive(
            pipeline,
            QosShaper::new(config.qos),
            TxPacer::new(config.tx_pacer_interval),
            transport,
            ingest_rx,
            cancel.clone(),
        ));

        Ok(Self { ingest, cancel, driver, stats })
    }

    /// Submit one envelope for transmission.
    ///
    /// Applies backpressure when the driver is busy. QoS may still drop
    /// the derived frames later if their class queue is full; those drops
    /// show up in the statistics, not here.
    ///
    /// # Errors
    ///
    /// `ClientError::Disconnected` when the driver has stopped.
    pub async fn send(&self, envelope: Envelope) -> Result<(), ClientError> {
        self.ingest.send(envelope).await.map_err(|_| ClientError::Disconnected)
    }

    /// Counter snapshot for this producer.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop the driver, letting already-queued frames drain first.
    pub async fn shutdown(self) {
        drop(self.ingest);
        let _ = self.driver.await;
        self.cancel.cancel();
    }

    /// Abort immediately, dropping queued frames.
    pub fn abort(&self) {
        self.cancel.cancel();
    }
}

/// The driver task: ingest envelopes, shape, pace, write.
async fn drive(
    mut pipeline: TxPipeline,
    mut shaper: QosShaper<StreamFrame>,
    mut pacer: TxPacer,
    mut transport: StreamTransport,
    mut ingest: mpsc::Receiver<Envelope>,
    cancel: CancellationToken,
) {
    let mut ingest_open = true;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        // Drain the hand-off channel without blocking so bursts are
        // shaped as a batch.
        loop {
            match ingest.try_recv() {
                Ok(envelope) => ingest_envelope(&mut pipeline, &mut shaper, envelope),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    ingest_open = false;
                    break;
                },
            }
        }

        if shaper.is_empty() {
            if !ingest_open {
                break; // producer gone, queue drained
            }
            // Idle: block until an envelope arrives or we are stopped.
            tokio::select! {
                () = cancel.cancelled() => break,
                maybe = ingest.recv() => match maybe {
                    Some(envelope) => ingest_envelope(&mut pipeline, &mut shaper, envelope),
                    None => ingest_open = false,
                },
            }
            continue;
        }

        let Some(frame) = shaper.dequeue_wait(DEQUEUE_SLICE, &cancel).await else {
            continue; // rate-limited or cancelled; re-check state
        };

        if !pacer.pace(&cancel).await {
            break;
        }

        let wire = match frame.encode() {
            Ok(wire) => wire,
            Err(e) => {
                tracing::error!(error = %e, "dropping unencodable frame");
                continue;
            },
        };

        if let Err(e) = transport.send(&wire).await {
            tracing::warn!(error = %e, "transport write failed, stopping driver");
            break;
        }
    }

    let _ = transport.close().await;
    tracing::debug!("telemetry driver stopped");
}

fn ingest_envelope(
    pipeline: &mut TxPipeline,
    shaper: &mut QosShaper<StreamFrame>,
    envelope: Envelope,
) {
    match pipeline.process(envelope) {
        Ok(frames) => {
            for frame in frames {
                if !shaper.enqueue(frame) {
                    tracing::debug!("QoS queue full, frame dropped");
                }
            }
        },
        Err(e) => tracing::error!(error = %e, "envelope failed in the TX pipeline"),
    }
}
