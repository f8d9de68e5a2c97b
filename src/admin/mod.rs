//! Admin API.
//!
//! # Responsibilities
//! - Inspect the running interceptor (status, sessions, pending holds)
//! - Manage rules at runtime
//! - Let remote observers decide holds, over REST or a WebSocket event stream
//!
//! # Design Decisions
//! - Every route sits behind a bearer token
//! - Handlers only call the public pipeline API; nothing here is on the hot path
//! - Rules added here live until the next config reload replaces the rule set

pub mod auth;
pub mod handlers;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

use crate::net::connection::ConnectionTracker;
use crate::pipeline::Pipeline;

use self::auth::admin_auth_middleware;
use self::handlers::*;

/// Rule definitions and replacement messages are small.
const MAX_ADMIN_BODY: usize = 1024 * 1024;

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub pipeline: Arc<Pipeline>,
    pub connections: ConnectionTracker,
    pub api_key: Arc<str>,
    pub started: Instant,
}

impl AdminState {
    pub fn new(pipeline: Arc<Pipeline>, connections: ConnectionTracker, api_key: &str) -> Self {
        Self {
            pipeline,
            connections,
            api_key: Arc::from(api_key),
            started: Instant::now(),
        }
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/sessions", get(list_sessions))
        .route("/admin/rules", get(list_rules).post(add_rule))
        .route("/admin/rules/{id}", delete(remove_rule))
        .route("/admin/rules/{id}/enable", post(enable_rule))
        .route("/admin/rules/{id}/disable", post(disable_rule))
        .route("/admin/holds", get(list_holds))
        .route("/admin/holds/{id}/decision", post(decide_hold))
        .route("/admin/highlight/reset", post(reset_highlight))
        .route("/admin/events", get(events))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(RequestBodyLimitLayer::new(MAX_ADMIN_BODY))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the admin router until shutdown.
pub async fn serve_admin(
    listener: TcpListener,
    state: AdminState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), std::io::Error> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "Admin API listening");

    axum::serve(listener, setup_admin_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    tracing::info!("Admin API stopped");
    Ok(())
}
