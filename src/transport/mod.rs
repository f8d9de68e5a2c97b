//! Host transport boundary.
//!
//! # Data Flow
//! ```text
//! HostTransport::receive (raw request or response bytes)
//!     → Pipeline::process
//!     → Decision
//!         Forward → deliver(Forward)
//!         Drop    → deliver(Reply) then close, or close
//!         Abort   → deliver(Close)
//! end of stream / close → Pipeline::connection_closed
//! ```
//!
//! # Design Decisions
//! - The pipeline never touches sockets; a transport is a capability trait
//! - One driver task per connection handles one message at a time
//! - A peer hanging up mid-hold cancels the hold instead of waiting it out

pub mod framing;
pub mod tcp;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::InterceptError;
use crate::message::{Direction, Message};
use crate::net::connection::{ConnectionContext, ConnectionMetadata};
use crate::pipeline::{Decision, Pipeline};

pub use framing::{FrameError, MessageReader};
pub use tcp::{ProxyServer, TcpTransport};

/// Raw bytes of one message, as they arrived.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub direction: Direction,
    pub raw: Bytes,
}

/// What the transport is told to do.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// Pass the message on: requests to the origin, responses to the client.
    Forward { direction: Direction, message: Message },
    /// Answer the client directly, then close.
    Reply(Message),
    /// Close without writing anything further.
    Close,
}

/// Capability a host environment provides to the interception engine.
#[async_trait]
pub trait HostTransport: Send {
    /// Next message on this connection, or `None` once it is finished.
    async fn receive(&mut self) -> Option<Inbound>;

    /// Carry out a pipeline decision.
    async fn deliver(&mut self, delivery: Delivery) -> std::io::Result<()>;

    fn connection_metadata(&self) -> ConnectionMetadata;

    /// Resolves when the client goes away while a message is being processed.
    ///
    /// Transports that cannot tell never resolve.
    async fn peer_closed(&mut self) {
        std::future::pending::<()>().await
    }
}

/// Drive one connection through the pipeline until either side finishes.
pub async fn serve_connection<T>(mut transport: T, pipeline: &Pipeline, conn: ConnectionContext)
where
    T: HostTransport,
{
    tracing::debug!(connection_id = %conn.id, peer_addr = %conn.metadata.peer_addr, "Connection opened");

    loop {
        let inbound = tokio::select! {
            _ = conn.closed.cancelled() => break,
            inbound = transport.receive() => inbound,
        };
        let Some(inbound) = inbound else {
            break;
        };
        let direction = inbound.direction;

        let decision = {
            let process = pipeline.process(&inbound.raw, direction, &conn);
            tokio::pin!(process);
            tokio::select! {
                decision = &mut process => decision,
                _ = transport.peer_closed() => {
                    tracing::debug!(connection_id = %conn.id, "Peer closed during processing");
                    conn.closed.cancel();
                    process.await
                }
            }
        };

        let (delivery, keep_open) = match decision {
            Decision::Forward { message, .. } => (Delivery::Forward { direction, message }, true),
            Decision::Drop { reply: Some(reply) } => (Delivery::Reply(reply), false),
            Decision::Drop { reply: None } | Decision::AbortConnection => (Delivery::Close, false),
        };

        if let Err(e) = transport.deliver(delivery).await {
            tracing::debug!(connection_id = %conn.id, error = %InterceptError::Io(e), "Delivery failed");
            let _ = transport.deliver(Delivery::Close).await;
            break;
        }
        if !keep_open {
            break;
        }
    }

    pipeline.connection_closed(&conn);
    tracing::debug!(connection_id = %conn.id, "Connection finished");
}
