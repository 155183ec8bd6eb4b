//! The stream transport and its plug-point trait.
//!
//! A transport is a narrow interface: connect, send bytes, receive bytes,
//! close. Only the length-framed TCP stream transport is normative;
//! datagram or store-and-forward variants would implement the same trait.

use async_trait::async_trait;
use bytes::Bytes;
use downlink_proto::MAX_FRAME_SIZE;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

/// A bidirectional byte-frame transport.
///
/// `send` transmits one complete frame (length prefix included);
/// `recv` returns the next frame body (length prefix stripped), or `None`
/// on a clean peer close.
#[async_trait]
pub trait Transport: Send {
    /// Transmit one encoded frame.
    async fn send(&mut self, frame: &[u8]) -> std::io::Result<()>;

    /// Receive the next frame body, `None` on end of stream.
    async fn recv(&mut self) -> std::io::Result<Option<Bytes>>;

    /// Shut the transport down.
    async fn close(&mut self) -> std::io::Result<()>;
}

/// The normative transport: a TCP byte stream carrying length-prefixed
/// frames.
pub struct StreamTransport {
    stream: TcpStream,
}

impl StreamTransport {
    /// Connect to a consumer endpoint (`host:port`).
    pub async fn connect(addr: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        tracing::debug!(%addr, "stream transport connected");
        Ok(Self { stream })
    }

    /// Wrap an accepted connection (consumer side).
    #[must_use]
    pub fn from_stream(stream: TcpStream) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn send(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(frame).await
    }

    async fn recv(&mut self) -> std::io::Result<Option<Bytes>> {
        let mut len_buf = [0u8; 4];
        match self.stream.read_exact(&mut len_buf).await {
            Ok(_) => {},
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        let body_len = u32::from_be_bytes(len_buf) as usize;
        if body_len > MAX_FRAME_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {body_len} bytes exceeds the 16 MiB limit"),
            ));
        }

        let mut body = vec![0u8; body_len];
        self.stream.read_exact(&mut body).await?;
        Ok(Some(Bytes::from(body)))
    }

    async fn close(&mut self) -> std::io::Result<()> {
        self.stream.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn frames_cross_a_loopback_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut transport = StreamTransport::from_stream(stream);
            let mut bodies = Vec::new();
            while let Some(body) = transport.recv().await.unwrap() {
                bodies.push(body);
            }
            bodies
        });

        let mut client = StreamTransport::connect(&addr.to_string()).await.unwrap();
        for body in [&b"alpha"[..], &b"beta"[..]] {
            let mut frame = (body.len() as u32).to_be_bytes().to_vec();
            frame.extend_from_slice(body);
            client.send(&frame).await.unwrap();
        }
        client.close().await.unwrap();

        let bodies = server.await.unwrap();
        assert_eq!(bodies, vec![Bytes::from_static(b"alpha"), Bytes::from_static(b"beta")]);
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut transport = StreamTransport::from_stream(stream);
            transport.recv().await
        });

        let mut client = StreamTransport::connect(&addr.to_string()).await.unwrap();
        client.send(&u32::MAX.to_be_bytes()).await.unwrap();

        let result = server.await.unwrap();
        assert!(result.is_err());
    }
}
