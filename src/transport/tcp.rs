//! Forward-proxy transport over plain TCP.
//!
//! # Responsibilities
//! - Read client requests and origin responses with [`MessageReader`]
//! - Resolve the origin from an absolute-form target or the `Host` header
//! - Keep one origin connection per client connection, reconnecting on authority change
//! - Tunnel raw bytes after `101 Switching Protocols` or a successful `CONNECT`
//!
//! # Design Decisions
//! - Strict request/response lockstep: the next request is read only after the
//!   previous exchange finished
//! - Origin failures surface as synthesized `502`/`504` responses that flow
//!   through the pipeline like any other response
//! - `https` absolute-form targets are refused; TLS interception is out of scope

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use url::{Host, Url};

use crate::config::{InterceptorConfig, LimitsConfig, TimeoutConfig};
use crate::lifecycle::Shutdown;
use crate::message::parse::ParseOptions;
use crate::message::{BodyFraming, Direction, Message};
use crate::net::connection::{ConnectionContext, ConnectionMetadata, ConnectionTracker};
use crate::net::listener::{Listener, ListenerError};
use crate::pipeline::{synthesize_reply, Pipeline};
use crate::transport::framing::{FrameError, MessageReader};
use crate::transport::{serve_connection, Delivery, HostTransport, Inbound};

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Where a request is headed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginTarget {
    pub host: String,
    pub port: u16,
}

impl OriginTarget {
    /// Resolve the origin of a request.
    pub fn resolve(request: &Message) -> Result<Self, String> {
        let target = request.target().ok_or("not a request")?;
        let method = request.method().unwrap_or("");

        let url = if method.eq_ignore_ascii_case("CONNECT") {
            Url::parse(&format!("http://{}/", target)).map_err(|e| format!("bad CONNECT target: {}", e))?
        } else if target.contains("://") {
            let url = Url::parse(target).map_err(|e| format!("bad absolute target: {}", e))?;
            if url.scheme() != "http" {
                return Err(format!("unsupported scheme {:?}", url.scheme()));
            }
            url
        } else {
            let host = request.header("host").ok_or("no Host header")?;
            Url::parse(&format!("http://{}/", host.trim())).map_err(|e| format!("bad Host header: {}", e))?
        };

        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => return Err("no origin host".to_string()),
        };
        let port = url.port_or_known_default().ok_or("no origin port")?;
        Ok(Self { host, port })
    }

    fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Open connection to the current origin.
struct Origin {
    key: String,
    stream: TcpStream,
    reader: MessageReader,
}

/// The request whose response is awaited.
#[derive(Debug, Clone, Copy)]
struct Exchange {
    head: bool,
    connect: bool,
    close_after: bool,
}

/// One client connection acting as an HTTP/1.1 forward proxy.
pub struct TcpTransport {
    client: TcpStream,
    metadata: ConnectionMetadata,
    client_reader: MessageReader,
    origin: Option<Origin>,
    exchange: Option<Exchange>,
    /// Response produced locally instead of read from the origin.
    synthetic: Option<Bytes>,
    limits: LimitsConfig,
    timeouts: TimeoutConfig,
    finished: bool,
}

impl TcpTransport {
    pub fn new(client: TcpStream, peer_addr: SocketAddr, limits: &LimitsConfig, timeouts: &TimeoutConfig) -> Self {
        Self {
            client,
            metadata: ConnectionMetadata { peer_addr, tls: false },
            client_reader: MessageReader::new(
                Direction::Request,
                limits,
                Duration::from_secs(timeouts.idle_secs),
                Duration::from_secs(timeouts.read_secs),
            ),
            origin: None,
            exchange: None,
            synthetic: None,
            limits: limits.clone(),
            timeouts: timeouts.clone(),
            finished: false,
        }
    }

    async fn forward_request(&mut self, request: Message) {
        let method = request.method().unwrap_or("");
        let exchange = Exchange {
            head: method.eq_ignore_ascii_case("HEAD"),
            connect: method.eq_ignore_ascii_case("CONNECT"),
            close_after: wants_close(&request),
        };
        self.exchange = Some(exchange);

        let target = match OriginTarget::resolve(&request) {
            Ok(target) => target,
            Err(reason) => {
                tracing::debug!(peer_addr = %self.metadata.peer_addr, reason = %reason, "Origin not resolvable");
                self.synthetic = synthetic_response(400, &reason);
                return;
            }
        };

        let origin = match self.origin_for(&target).await {
            Ok(origin) => origin,
            Err(status) => {
                self.synthetic = synthetic_response(status, &format!("cannot reach {}", target.key()));
                return;
            }
        };

        if exchange.connect {
            self.synthetic = Some(Bytes::from_static(CONNECT_ESTABLISHED));
            return;
        }

        if let Err(e) = origin.stream.write_all(&request.serialize()).await {
            tracing::debug!(origin = %origin.key, error = %e, "Origin write failed");
            self.origin = None;
            self.synthetic = synthetic_response(502, "origin connection failed");
        }
    }

    /// Reuse the open origin connection or dial a new one; `Err` carries the
    /// status to answer with.
    async fn origin_for(&mut self, target: &OriginTarget) -> Result<&mut Origin, u16> {
        let key = target.key();
        if self.origin.as_ref().map(|o| o.key != key).unwrap_or(true) {
            self.origin = None;
            let connect = TcpStream::connect((target.host.as_str(), target.port));
            let stream = match tokio::time::timeout(Duration::from_secs(self.timeouts.connect_secs), connect).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    tracing::debug!(origin = %key, error = %e, "Origin connect failed");
                    return Err(502);
                }
                Err(_) => {
                    tracing::debug!(origin = %key, "Origin connect timed out");
                    return Err(504);
                }
            };
            tracing::debug!(origin = %key, "Origin connected");
            self.origin = Some(Origin {
                key,
                stream,
                reader: MessageReader::new(
                    Direction::Response,
                    &self.limits,
                    Duration::from_secs(self.timeouts.read_secs),
                    Duration::from_secs(self.timeouts.read_secs),
                ),
            });
        }
        self.origin.as_mut().ok_or(502)
    }

    async fn read_response(&mut self, exchange: Exchange) -> Option<Bytes> {
        if let Some(raw) = self.synthetic.take() {
            return Some(raw);
        }
        let Some(origin) = self.origin.as_mut() else {
            return synthetic_response(502, "origin connection lost");
        };
        let options = ParseOptions { no_body: exchange.head };
        match origin.reader.read_message(&mut origin.stream, options).await {
            Ok(Some(raw)) => Some(raw),
            Ok(None) => {
                tracing::debug!(origin = %origin.key, "Origin closed before responding");
                self.origin = None;
                synthetic_response(502, "origin closed the connection")
            }
            Err(e) => {
                tracing::debug!(origin = %origin.key, error = %e, "Origin response unreadable");
                self.origin = None;
                let status = if matches!(e, FrameError::Timeout) { 504 } else { 502 };
                synthetic_response(status, "origin response unreadable")
            }
        }
    }

    async fn forward_response(&mut self, response: Message) -> std::io::Result<()> {
        self.client.write_all(&response.serialize()).await?;

        let status = response.status().unwrap_or(0);
        if (100..200).contains(&status) && status != 101 {
            return Ok(());
        }
        let Some(exchange) = self.exchange.take() else {
            return Ok(());
        };

        if status == 101 || (exchange.connect && (200..300).contains(&status)) {
            return self.tunnel().await;
        }

        let until_close = matches!(response.framing(), Ok(BodyFraming::UntilClose));
        if until_close || wants_close(&response) {
            self.origin = None;
        }
        if exchange.close_after || until_close || wants_close(&response) {
            self.close().await;
        }
        Ok(())
    }

    /// Splice client and origin together until either side closes.
    async fn tunnel(&mut self) -> std::io::Result<()> {
        self.finished = true;
        let Some(mut origin) = self.origin.take() else {
            return Ok(());
        };

        let early_client = self.client_reader.take_buffered();
        if !early_client.is_empty() {
            origin.stream.write_all(&early_client).await?;
        }
        let early_origin = origin.reader.take_buffered();
        if !early_origin.is_empty() {
            self.client.write_all(&early_origin).await?;
        }

        tracing::debug!(peer_addr = %self.metadata.peer_addr, origin = %origin.key, "Tunnel opened");
        match tokio::io::copy_bidirectional(&mut self.client, &mut origin.stream).await {
            Ok((up, down)) => {
                tracing::debug!(origin = %origin.key, bytes_up = up, bytes_down = down, "Tunnel closed");
            }
            Err(e) => {
                tracing::debug!(origin = %origin.key, error = %e, "Tunnel ended with error");
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.finished = true;
        self.origin = None;
        let _ = self.client.shutdown().await;
    }
}

#[async_trait]
impl HostTransport for TcpTransport {
    async fn receive(&mut self) -> Option<Inbound> {
        if self.finished {
            return None;
        }

        if let Some(exchange) = self.exchange {
            let raw = self.read_response(exchange).await?;
            return Some(Inbound {
                direction: Direction::Response,
                raw,
            });
        }

        match self.client_reader.read_message(&mut self.client, ParseOptions::default()).await {
            Ok(Some(raw)) => Some(Inbound {
                direction: Direction::Request,
                raw,
            }),
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(peer_addr = %self.metadata.peer_addr, error = %e, "Client request unreadable");
                None
            }
        }
    }

    async fn deliver(&mut self, delivery: Delivery) -> std::io::Result<()> {
        match delivery {
            Delivery::Forward {
                direction: Direction::Request,
                message,
            } => {
                self.forward_request(message).await;
                Ok(())
            }
            Delivery::Forward {
                direction: Direction::Response,
                message,
            } => self.forward_response(message).await,
            Delivery::Reply(reply) => {
                let written = self.client.write_all(&reply.serialize()).await;
                self.close().await;
                written
            }
            Delivery::Close => {
                self.close().await;
                Ok(())
            }
        }
    }

    fn connection_metadata(&self) -> ConnectionMetadata {
        self.metadata.clone()
    }

    async fn peer_closed(&mut self) {
        let mut probe = [0u8; 1];
        match self.client.peek(&mut probe).await {
            Ok(0) | Err(_) => {}
            // Pipelined bytes are not a hang-up.
            Ok(_) => std::future::pending::<()>().await,
        }
    }
}

fn wants_close(message: &Message) -> bool {
    let close_token = message
        .headers_named("connection")
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"));
    close_token || message.version().eq_ignore_ascii_case("HTTP/1.0")
}

fn synthetic_response(status: u16, text: &str) -> Option<Bytes> {
    synthesize_reply(status, text).map(|reply| reply.serialize())
}

/// Accept loop feeding every client connection through the pipeline.
pub struct ProxyServer {
    pipeline: Arc<Pipeline>,
    tracker: ConnectionTracker,
    limits: LimitsConfig,
    timeouts: TimeoutConfig,
}

impl ProxyServer {
    pub fn new(pipeline: Arc<Pipeline>, config: &InterceptorConfig) -> Self {
        Self {
            pipeline,
            tracker: ConnectionTracker::new(),
            limits: config.limits.clone(),
            timeouts: config.timeouts.clone(),
        }
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Accept until shutdown is triggered. Open connections keep running;
    /// they end on their own or when shutdown is forced.
    pub async fn run(&self, listener: Listener, shutdown: &Shutdown) -> Result<(), ListenerError> {
        let mut shutdown_rx = shutdown.subscribe();
        let root = shutdown.connection_token();
        tracing::info!(
            address = ?listener.local_addr().ok(),
            max_connections = listener.max_connections(),
            "Interception proxy accepting"
        );

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer_addr, permit) = match accepted {
                Ok(accepted) => accepted,
                Err(ListenerError::Accept(e)) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let transport = TcpTransport::new(stream, peer_addr, &self.limits, &self.timeouts);
            let conn = ConnectionContext::with_parent(transport.connection_metadata(), &root);
            let guard = self.tracker.track(conn.id);
            let pipeline = Arc::clone(&self.pipeline);

            tokio::spawn(async move {
                let _permit = permit;
                let _guard = guard;
                serve_connection(transport, &pipeline, conn).await;
            });
        }

        listener.close();
        tracing::info!(active = self.tracker.active_count(), "Interception proxy stopped accepting");
        Ok(())
    }
}
