//! Test-traffic generator.
//!
//! # Usage
//!
//! ```bash
//! # Stream 100 envelopes to a ground station
//! downlink-send --addr 127.0.0.1:5555 -n 100 --size 8192
//!
//! # Same link, sealed under a shared secret
//! downlink-send --addr 127.0.0.1:5555 --key $(openssl rand -hex 32)
//!
//! # Append the raw stream frames to a file instead of a socket
//! downlink-send -n 20 --output telemetry.dlf
//! ```

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use downlink_client::TelemetryClient;
use downlink_core::{
    config::{CompressionAlgorithm, CompressionConfig},
    CryptoStage, PipelineConfig, PipelineStats, TxPipeline,
};
use downlink_crypto::{CryptoBox, SigningKey, SymmetricKey};
use downlink_proto::{Envelope, Priority};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Downlink test-traffic generator
#[derive(Parser, Debug)]
#[command(name = "downlink-send")]
#[command(about = "Send synthetic telemetry through the downlink pipeline")]
#[command(version)]
struct Args {
    /// Consumer address to stream to
    #[arg(short, long, default_value = "127.0.0.1:5555")]
    addr: String,

    /// Number of envelopes to send
    #[arg(short = 'n', long, default_value = "10")]
    count: u32,

    /// Payload size in bytes
    #[arg(long, default_value = "4096")]
    size: usize,

    /// Topic for the generated envelopes
    #[arg(long, default_value = "sensors/test")]
    topic: String,

    /// Priority class (p0..p3)
    #[arg(long, default_value = "p2")]
    priority: String,

    /// Delay between envelopes in milliseconds
    #[arg(long, default_value = "100")]
    interval_ms: u64,

    /// Compression variant (fast | balanced)
    #[arg(long, default_value = "fast")]
    compression: String,

    /// Shared secret as 64 hex chars; enables sign-then-encrypt
    #[arg(long)]
    key: Option<String>,

    /// Append raw stream frames to this file instead of a socket
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let priority = parse_priority(&args.priority)?;
    let config = PipelineConfig {
        compression: CompressionConfig {
            algorithm: parse_compression(&args.compression)?,
            level: None,
        },
        ..Default::default()
    };
    config.validate()?;

    let crypto = match &args.key {
        Some(hex_key) => crypto_from_shared_key(hex_key)?,
        None => CryptoStage::None,
    };

    match args.output.clone() {
        Some(path) => send_to_file(&args, &config, priority, crypto, path).await,
        None => send_to_socket(&args, &config, priority, crypto).await,
    }
}

async fn send_to_socket(
    args: &Args,
    config: &PipelineConfig,
    priority: Priority,
    crypto: CryptoStage,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(addr = %args.addr, count = args.count, "streaming test telemetry");

    let client = TelemetryClient::connect(&args.addr, config, "downlink-send", crypto).await?;

    for seq in 0..args.count {
        let envelope = Envelope::new(args.topic.clone(), test_payload(args.size, seq), priority)
            .with_source("downlink-send", seq);
        client.send(envelope).await?;
        tracing::debug!(seq, "envelope submitted");
        tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
    }

    client.shutdown().await;
    Ok(())
}

async fn send_to_file(
    args: &Args,
    config: &PipelineConfig,
    priority: Priority,
    crypto: CryptoStage,
    path: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(path = %path.display(), count = args.count, "writing frames to file");

    let stats = Arc::new(PipelineStats::new());
    let mut pipeline = TxPipeline::new(config, "downlink-send", crypto, Arc::clone(&stats))?;
    let mut file =
        tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;

    for seq in 0..args.count {
        let envelope = Envelope::new(args.topic.clone(), test_payload(args.size, seq), priority)
            .with_source("downlink-send", seq);
        for frame in pipeline.process(envelope)? {
            file.write_all(&frame.encode()?).await?;
        }
    }
    file.flush().await?;

    let snap = stats.snapshot();
    tracing::info!(
        envelopes = snap.envelopes_sent,
        frames = snap.frames_sent,
        bytes = snap.bytes_sent,
        "done"
    );
    Ok(())
}

/// Synthetic sensor payload: deterministic, mildly compressible.
fn test_payload(size: usize, seq: u32) -> Vec<u8> {
    (0..size).map(|i| ((i as u32).wrapping_mul(31).wrapping_add(seq * 7) >> 3) as u8).collect()
}

fn parse_priority(value: &str) -> Result<Priority, String> {
    match value.to_ascii_lowercase().as_str() {
        "p0" => Ok(Priority::P0),
        "p1" => Ok(Priority::P1),
        "p2" => Ok(Priority::P2),
        "p3" => Ok(Priority::P3),
        other => Err(format!("unknown priority {other:?}, expected p0..p3")),
    }
}

fn parse_compression(value: &str) -> Result<CompressionAlgorithm, String> {
    match value.to_ascii_lowercase().as_str() {
        "fast" => Ok(CompressionAlgorithm::Fast),
        "balanced" => Ok(CompressionAlgorithm::Balanced),
        other => Err(format!("unknown compression {other:?}, expected fast or balanced")),
    }
}

/// Build a symmetric crypto stage where both ends derive their signing key
/// from the shared secret. Demo-grade key management: real deployments
/// provision signing keys separately.
fn crypto_from_shared_key(hex_key: &str) -> Result<CryptoStage, String> {
    let bytes = hex::decode(hex_key).map_err(|e| format!("bad --key: {e}"))?;
    let key_bytes: [u8; 32] =
        bytes.try_into().map_err(|_| "bad --key: expected 32 bytes of hex".to_string())?;

    let signing = SigningKey::from_bytes(&key_bytes);
    let verify = signing.verifying_key();
    let key = SymmetricKey::from_bytes(key_bytes);
    Ok(CryptoStage::Symmetric(CryptoBox::new("shared", signing, verify, &key)))
}
