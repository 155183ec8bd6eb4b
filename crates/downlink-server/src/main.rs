//! Ground-station server binary.
//!
//! # Usage
//!
//! ```bash
//! # Receive plaintext telemetry
//! downlink-server --bind 0.0.0.0:5555
//!
//! # Receive sealed telemetry under a shared secret
//! downlink-server --bind 0.0.0.0:5555 --key <64 hex chars>
//! ```

use clap::Parser;
use downlink_core::PipelineConfig;
use downlink_crypto::{SigningKey, SymmetricKey};
use downlink_server::{log_stats, CryptoSetup, Server, ServerConfig};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Downlink ground-station server
#[derive(Parser, Debug)]
#[command(name = "downlink-server")]
#[command(about = "Receive and decode downlink telemetry streams")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:5555")]
    bind: String,

    /// Shared secret as 64 hex chars; must match the producers
    #[arg(long)]
    key: Option<String>,

    /// Statistics summary period in seconds (0 disables)
    #[arg(long, default_value = "10")]
    stats_period: u64,

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

    tracing::info!("downlink server starting");

    let crypto = match &args.key {
        Some(hex_key) => crypto_from_shared_key(hex_key)?,
        None => CryptoSetup::None,
    };

    let server = Server::bind(ServerConfig {
        bind_address: args.bind,
        pipeline: PipelineConfig::default(),
        crypto,
    })
    .await?;
    let stats = server.stats();

    let cancel = CancellationToken::new();
    let (delivery, mut envelopes) = mpsc::channel::<downlink_proto::Envelope>(256);

    // Consumer: log each delivered envelope.
    tokio::spawn(async move {
        while let Some(envelope) = envelopes.recv().await {
            tracing::info!(
                topic = %envelope.topic,
                priority = ?envelope.priority,
                source = %envelope.metadata.source_node,
                seq = envelope.metadata.sequence_number,
                bytes = envelope.payload.len(),
                "envelope delivered"
            );
        }
    });

    // Periodic statistics summary.
    if args.stats_period > 0 {
        let stats = std::sync::Arc::clone(&stats);
        let period = std::time::Duration::from_secs(args.stats_period);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                log_stats(&stats.snapshot());
            }
        });
    }

    // Ctrl-c triggers a clean shutdown.
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            shutdown.cancel();
        }
    });

    server.run(delivery, cancel).await?;
    Ok(())
}

/// Derive the demo key material from a shared secret, mirroring
/// `downlink-send`.
fn crypto_from_shared_key(hex_key: &str) -> Result<CryptoSetup, String> {
    let bytes = hex::decode(hex_key).map_err(|e| format!("bad --key: {e}"))?;
    let key_bytes: [u8; 32] =
        bytes.try_into().map_err(|_| "bad --key: expected 32 bytes of hex".to_string())?;

    let signing = SigningKey::from_bytes(&key_bytes);
    let peer_verify = signing.verifying_key();
    Ok(CryptoSetup::Symmetric {
        key: SymmetricKey::from_bytes(key_bytes),
        signing,
        peer_verify,
    })
}
