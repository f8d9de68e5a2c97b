//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use http_interceptor::config::parse_config;
use http_interceptor::message::Direction;
use http_interceptor::net::connection::{ConnectionContext, ConnectionMetadata};
use http_interceptor::pipeline::Pipeline;
use http_interceptor::transport::{Delivery, HostTransport, Inbound};

pub fn metadata() -> ConnectionMetadata {
    ConnectionMetadata {
        peer_addr: "127.0.0.1:40000".parse().unwrap(),
        tls: false,
    }
}

pub fn connection() -> ConnectionContext {
    ConnectionContext::new(metadata())
}

/// Pipeline built from a TOML snippet.
pub fn pipeline(toml: &str) -> Arc<Pipeline> {
    let config = parse_config(toml).unwrap();
    Arc::new(Pipeline::new(&config).unwrap())
}

/// In-memory transport driven from the test body.
pub struct FakeTransport {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    delivered: mpsc::UnboundedSender<Delivery>,
    peer_gone: CancellationToken,
}

/// The test's side of a [`FakeTransport`].
pub struct FakeHandle {
    pub inbound: mpsc::UnboundedSender<Inbound>,
    pub delivered: mpsc::UnboundedReceiver<Delivery>,
    pub peer_gone: CancellationToken,
}

impl FakeHandle {
    pub fn send_request(&self, raw: &str) {
        self.send(Direction::Request, raw);
    }

    pub fn send_response(&self, raw: &str) {
        self.send(Direction::Response, raw);
    }

    fn send(&self, direction: Direction, raw: &str) {
        self.inbound
            .send(Inbound {
                direction,
                raw: Bytes::copy_from_slice(raw.as_bytes()),
            })
            .unwrap();
    }
}

pub fn fake_transport() -> (FakeTransport, FakeHandle) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (delivered_tx, delivered_rx) = mpsc::unbounded_channel();
    let peer_gone = CancellationToken::new();
    (
        FakeTransport {
            inbound: inbound_rx,
            delivered: delivered_tx,
            peer_gone: peer_gone.clone(),
        },
        FakeHandle {
            inbound: inbound_tx,
            delivered: delivered_rx,
            peer_gone,
        },
    )
}

#[async_trait]
impl HostTransport for FakeTransport {
    async fn receive(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }

    async fn deliver(&mut self, delivery: Delivery) -> std::io::Result<()> {
        let _ = self.delivered.send(delivery);
        Ok(())
    }

    fn connection_metadata(&self) -> ConnectionMetadata {
        metadata()
    }

    async fn peer_closed(&mut self) {
        self.peer_gone.cancelled().await
    }
}

/// A raw TCP origin answering every request with `response`.
///
/// Returns its address and a counter of requests received.
pub async fn start_mock_origin(response: &'static str) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    let n = match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    buf.extend_from_slice(&chunk[..n]);
                    // Bodiless requests only: one head, one response.
                    while let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        buf.drain(..end + 4);
                        counter.fetch_add(1, Ordering::SeqCst);
                        if socket.write_all(response.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });

    (addr, hits)
}

/// Send raw bytes and read until the proxy closes the connection.
pub async fn round_trip(proxy: SocketAddr, raw: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(proxy).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut out = Vec::new();
    let _ = stream.read_to_end(&mut out).await;
    String::from_utf8_lossy(&out).into_owned()
}
