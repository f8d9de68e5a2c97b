//! Shutdown coordination for the interceptor.

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Coordinator for graceful shutdown.
///
/// Provides a broadcast channel that all long-running tasks can subscribe to,
/// plus a cancellation root every client connection hangs off. Triggering
/// stops background tasks and the accept loop; forcing also cancels open
/// connections, which ends their holds.
pub struct Shutdown {
    /// Broadcast channel sender.
    tx: broadcast::Sender<()>,
    /// Parent of every connection's `closed` token.
    connections: CancellationToken,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            connections: CancellationToken::new(),
        }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Token to derive per-connection tokens from.
    pub fn connection_token(&self) -> CancellationToken {
        self.connections.clone()
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Cancel every open connection.
    pub fn force(&self) {
        self.trigger();
        self.connections.cancel();
    }

    pub fn is_forced(&self) -> bool {
        self.connections.is_cancelled()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
