//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT, SIGHUP)
//! - Translate signals to internal events
//! - Trigger appropriate actions (shutdown, reload)
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - A second SIGTERM/SIGINT forces shutdown, cancelling open holds
//! - SIGHUP triggers config reload, not shutdown

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::lifecycle::Shutdown;

/// What a received signal asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    Shutdown,
    Reload,
}

/// Registered signal streams.
pub struct Signals {
    #[cfg(unix)]
    terminate: Option<tokio::signal::unix::Signal>,
    #[cfg(unix)]
    hangup: Option<tokio::signal::unix::Signal>,
}

impl Signals {
    pub fn new() -> Self {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let register = |kind: SignalKind, name: &'static str| match signal(kind) {
                Ok(stream) => Some(stream),
                Err(e) => {
                    tracing::warn!(signal = name, error = %e, "Failed to register signal handler");
                    None
                }
            };
            Self {
                terminate: register(SignalKind::terminate(), "SIGTERM"),
                hangup: register(SignalKind::hangup(), "SIGHUP"),
            }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    /// Wait for the next signal.
    pub async fn recv(&mut self) -> SignalEvent {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c() => SignalEvent::Shutdown,
                _ = next(&mut self.terminate) => SignalEvent::Shutdown,
                _ = next(&mut self.hangup) => SignalEvent::Reload,
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c().await;
            SignalEvent::Shutdown
        }
    }
}

impl Default for Signals {
    fn default() -> Self {
        Self::new()
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Ctrl-C handler unavailable");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn next(stream: &mut Option<tokio::signal::unix::Signal>) {
    if let Some(stream) = stream {
        if stream.recv().await.is_some() {
            return;
        }
    }
    std::future::pending::<()>().await
}

/// Translate signals into shutdown triggers and reload requests.
pub fn spawn_signal_handler(shutdown: Arc<Shutdown>, reload: mpsc::UnboundedSender<()>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut signals = Signals::new();
        let mut shutdown_requests = 0u32;
        loop {
            match signals.recv().await {
                SignalEvent::Shutdown => {
                    shutdown_requests += 1;
                    if shutdown_requests == 1 {
                        tracing::info!("Shutdown signal received, draining connections");
                        shutdown.trigger();
                    } else {
                        tracing::warn!("Second shutdown signal, closing connections now");
                        shutdown.force();
                        break;
                    }
                }
                SignalEvent::Reload => {
                    tracing::info!("SIGHUP received, reloading configuration");
                    if reload.send(()).is_err() {
                        tracing::warn!("Reload requested but nothing is listening");
                    }
                }
            }
        }
    })
}
