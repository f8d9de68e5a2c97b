//! Startup orchestration.
//!
//! # Responsibilities
//! - Initialize all subsystems in dependency order
//! - Start background tasks (session reaper, config reload, metrics, admin API)
//! - Bind the proxy listener and begin accepting traffic
//! - Drain, then force-close, on shutdown
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - Listeners start last (traffic only when ready)
//! - Listener and admin addresses are fixed at startup; a reload only swaps
//!   rules and policies

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::admin::{serve_admin, AdminState};
use crate::config::watcher::ConfigWatcher;
use crate::config::{load_config, InterceptorConfig};
use crate::error::InterceptError;
use crate::lifecycle::signals::spawn_signal_handler;
use crate::lifecycle::Shutdown;
use crate::net::listener::Listener;
use crate::observability::metrics;
use crate::pipeline::Pipeline;
use crate::transport::ProxyServer;

/// How long open connections get to finish after shutdown starts.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// A configured interceptor, ready to run.
pub struct Interceptor {
    config: InterceptorConfig,
    config_path: Option<PathBuf>,
}

impl Interceptor {
    pub fn new(config: InterceptorConfig, config_path: Option<PathBuf>) -> Self {
        Self { config, config_path }
    }

    /// Run until a shutdown signal arrives and connections have drained.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let config = self.config;

        if config.observability.metrics_enabled {
            match config.observability.metrics_address.parse() {
                Ok(addr) => metrics::init_metrics(addr),
                Err(e) => tracing::error!(
                    error = %InterceptError::Config(format!("metrics_address: {}", e)),
                    "Metrics disabled"
                ),
            }
        }

        let pipeline = Arc::new(Pipeline::new(&config)?);
        let shutdown = Arc::new(Shutdown::new());
        tracing::info!(
            rules = pipeline.rules().len(),
            hold_timeout_ms = config.hold.timeout_ms,
            default_policy = ?config.hold.default_policy,
            "Pipeline ready"
        );

        let reaper = Arc::clone(pipeline.sessions()).spawn_reaper(
            Duration::from_secs(config.sessions.reap_interval_secs),
            shutdown.subscribe(),
        );

        let (reload_tx, reload_rx) = mpsc::unbounded_channel();
        let signals = spawn_signal_handler(Arc::clone(&shutdown), reload_tx);

        // Keep the notify watcher alive for the whole run.
        let (_watcher, updates) = match &self.config_path {
            Some(path) => {
                let (watcher, updates) = ConfigWatcher::new(path);
                match watcher.run() {
                    Ok(watcher) => (Some(watcher), Some(updates)),
                    Err(e) => {
                        tracing::warn!(error = %e, "Config watcher unavailable, reload on SIGHUP only");
                        (None, None)
                    }
                }
            }
            None => (None, None),
        };
        let reloader = spawn_reload_loop(
            Arc::clone(&pipeline),
            self.config_path.clone(),
            updates,
            reload_rx,
            shutdown.subscribe(),
        );

        let listener = Listener::bind(&config.listener).await?;
        let server = ProxyServer::new(Arc::clone(&pipeline), &config);

        if config.admin.enabled {
            if config.admin.api_key == "CHANGE_ME" {
                tracing::warn!("Admin API enabled with the default api_key");
            }
            let admin_listener = TcpListener::bind(&config.admin.bind_address).await?;
            let state = AdminState::new(Arc::clone(&pipeline), server.tracker().clone(), &config.admin.api_key);
            let admin_shutdown = shutdown.subscribe();
            tokio::spawn(async move {
                if let Err(e) = serve_admin(admin_listener, state, admin_shutdown).await {
                    tracing::error!(error = %e, "Admin API failed");
                }
            });
        }

        server.run(listener, &shutdown).await?;

        if !shutdown.is_forced() {
            match tokio::time::timeout(DRAIN_TIMEOUT, server.tracker().wait_for_idle()).await {
                Ok(()) => tracing::info!("All connections drained"),
                Err(_) => {
                    tracing::warn!(
                        active = server.tracker().active_count(),
                        "Drain timeout, closing remaining connections"
                    );
                    shutdown.force();
                }
            }
        }
        let released = pipeline.dispatcher().release_all();
        if released > 0 {
            tracing::info!(released, "Pending holds released");
        }
        let _ = tokio::time::timeout(Duration::from_secs(1), server.tracker().wait_for_idle()).await;

        signals.abort();
        let _ = reaper.await;
        let _ = reloader.await;
        tracing::info!("Shutdown complete");
        Ok(())
    }
}

/// Apply configuration updates from the file watcher or SIGHUP.
fn spawn_reload_loop(
    pipeline: Arc<Pipeline>,
    config_path: Option<PathBuf>,
    updates: Option<mpsc::UnboundedReceiver<InterceptorConfig>>,
    mut hangups: mpsc::UnboundedReceiver<()>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut updates = updates;
        loop {
            let next = tokio::select! {
                _ = shutdown.recv() => break,
                Some(config) = recv_update(&mut updates) => Some(config),
                Some(()) = hangups.recv() => match &config_path {
                    Some(path) => match load_config(path) {
                        Ok(config) => Some(config),
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to reload config, keeping current configuration");
                            None
                        }
                    },
                    None => {
                        tracing::info!("No config file to reload");
                        None
                    }
                },
                else => break,
            };

            if let Some(config) = next {
                if let Err(e) = pipeline.apply_config(&config) {
                    tracing::error!(error = %e, "Reloaded rules rejected, keeping current rule set");
                }
            }
        }
    })
}

async fn recv_update(updates: &mut Option<mpsc::UnboundedReceiver<InterceptorConfig>>) -> Option<InterceptorConfig> {
    match updates {
        Some(rx) => rx.recv().await,
        None => None,
    }
}
