//! Producer-to-consumer integration over a real loopback socket.

use std::time::Duration;

use bytes::Bytes;
use downlink_client::TelemetryClient;
use downlink_core::{config::FecConfig, CryptoStage, PipelineConfig};
use downlink_crypto::{CryptoBox, SigningKey, SymmetricKey};
use downlink_proto::{Envelope, Priority};
use downlink_server::{CryptoSetup, Server, ServerConfig};
use tokio::{sync::mpsc, time::timeout};
use tokio_util::sync::CancellationToken;

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

async fn start_server(config: ServerConfig) -> (String, mpsc::Receiver<Envelope>, CancellationToken) {
    let server = Server::bind(ServerConfig {
        bind_address: "127.0.0.1:0".to_string(),
        ..config
    })
    .await
    .unwrap();
    let addr = server.local_addr().unwrap().to_string();

    let cancel = CancellationToken::new();
    let (delivery, received) = mpsc::channel(256);
    let run_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = server.run(delivery, run_cancel).await;
    });

    (addr, received, cancel)
}

#[tokio::test]
async fn plaintext_envelopes_cross_the_wire() {
    let (addr, mut received, cancel) = start_server(ServerConfig::default()).await;

    let config = PipelineConfig::default();
    let client =
        TelemetryClient::connect(&addr, &config, "rover-1", CryptoStage::None).await.unwrap();

    let envs: Vec<Envelope> = (0..3)
        .map(|i| {
            Envelope::new("imu/accel", Bytes::from(vec![i as u8; 64]), Priority::P1)
                .with_source("rover-1", i)
        })
        .collect();
    for env in &envs {
        client.send(env.clone()).await.unwrap();
    }

    for expected in &envs {
        let got = timeout(RECV_TIMEOUT, received.recv()).await.unwrap().unwrap();
        assert_eq!(&got, expected);
    }

    client.shutdown().await;
    cancel.cancel();
}

#[tokio::test]
async fn sealed_envelopes_cross_the_wire() {
    // Both ends derive from one shared secret, like the binaries do.
    let secret = [0x42u8; 32];
    let signing = SigningKey::from_bytes(&secret);
    let verify = signing.verifying_key();

    let server_config = ServerConfig {
        crypto: CryptoSetup::Symmetric {
            key: SymmetricKey::from_bytes(secret),
            signing: signing.clone(),
            peer_verify: verify,
        },
        ..Default::default()
    };
    let (addr, mut received, cancel) = start_server(server_config).await;

    let client_crypto = CryptoStage::Symmetric(CryptoBox::new(
        "shared",
        signing,
        verify,
        &SymmetricKey::from_bytes(secret),
    ));
    let config = PipelineConfig::default();
    let client =
        TelemetryClient::connect(&addr, &config, "rover-1", client_crypto).await.unwrap();

    let env = Envelope::new("state/pose", Bytes::from_static(b"sealed payload"), Priority::P0)
        .with_source("rover-1", 0);
    client.send(env.clone()).await.unwrap();

    let got = timeout(RECV_TIMEOUT, received.recv()).await.unwrap().unwrap();
    assert_eq!(got, env);

    client.shutdown().await;
    cancel.cancel();
}

#[tokio::test]
async fn fragmented_message_crosses_the_wire() {
    let pipeline = PipelineConfig {
        mtu: 400,
        fec: FecConfig::Fixed { k: 4, m: 2 },
        ..Default::default()
    };
    let server_config = ServerConfig { pipeline: pipeline.clone(), ..Default::default() };
    let (addr, mut received, cancel) = start_server(server_config).await;

    let client =
        TelemetryClient::connect(&addr, &pipeline, "rover-1", CryptoStage::None).await.unwrap();

    // Incompressible payload, several MTUs wide.
    let payload: Vec<u8> =
        (0..8192u32).map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8).collect();
    let env = Envelope::new("cam/frame", payload, Priority::P2).with_source("rover-1", 0);
    client.send(env.clone()).await.unwrap();

    let got = timeout(RECV_TIMEOUT, received.recv()).await.unwrap().unwrap();
    assert_eq!(got.payload, env.payload);
    assert_eq!(got.topic, env.topic);
    assert_eq!(got.timestamp, env.timestamp);
    assert!(!got.is_fragment());

    client.shutdown().await;
    cancel.cancel();
}

#[tokio::test]
async fn many_envelopes_arrive_in_order() {
    let (addr, mut received, cancel) = start_server(ServerConfig::default()).await;

    let config = PipelineConfig {
        // Tight pacing so the test completes quickly.
        tx_pacer_interval: Duration::from_millis(1),
        ..Default::default()
    };
    let client =
        TelemetryClient::connect(&addr, &config, "rover-1", CryptoStage::None).await.unwrap();

    let count = 50u32;
    for seq in 0..count {
        let env = Envelope::new("logs", Bytes::from(seq.to_be_bytes().to_vec()), Priority::P3)
            .with_source("rover-1", seq);
        client.send(env).await.unwrap();
    }

    for seq in 0..count {
        let got = timeout(RECV_TIMEOUT, received.recv()).await.unwrap().unwrap();
        assert_eq!(got.metadata.sequence_number, seq, "delivery out of order");
    }

    client.shutdown().await;
    cancel.cancel();
}
