//! HTTP Interceptor
//!
//! An in-line HTTP/1.1 forward proxy that parses every message, runs it
//! through an ordered rule set, and lets observers hold, edit or drop it
//! before it continues.
//!
//! # Architecture Overview
//!
//! ```text
//!                        ┌──────────────────────────────────────────────────────┐
//!                        │                     INTERCEPTOR                      │
//!                        │                                                      │
//!   Client ──────────────┼─▶ net::listener ─▶ transport::tcp ─▶ pipeline        │
//!                        │                                        │             │
//!                        │          ┌─────────────────────────────┼──────────┐  │
//!                        │          ▼                             ▼          ▼  │
//!                        │   message::parse            rules::engine   session  │
//!                        │                                  │        correlator │
//!                        │                             hold │                   │
//!                        │                                  ▼                   │
//!                        │                        dispatch::dispatcher ◀─────── ┼── admin API / observers
//!                        │                                                      │
//!   Client ◀─────────────┼── transport::tcp ◀── Decision ◀── pipeline ◀─────────┼── Origin
//!                        │                                                      │
//!                        │  config (toml + notify) · observability · lifecycle  │
//!                        └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use http_interceptor::config::{load_config, InterceptorConfig};
use http_interceptor::lifecycle::Interceptor;
use http_interceptor::observability::logging::init_logging;

#[derive(Parser)]
#[command(name = "http-interceptor")]
#[command(about = "In-line HTTP/1.1 interception and rewriting proxy", long_about = None)]
struct Args {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(short, long, env = "INTERCEPTOR_CONFIG")]
    config: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => InterceptorConfig::default(),
    };

    if args.check {
        println!("configuration OK ({} rules)", config.rules.len());
        return Ok(());
    }

    init_logging(&config.observability).map_err(|e| -> Box<dyn std::error::Error> { e })?;

    tracing::info!("http-interceptor v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        config = ?args.config,
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        admin_enabled = config.admin.enabled,
        rules = config.rules.len(),
        "Configuration loaded"
    );

    Interceptor::new(config, args.config).run().await
}
