//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define interceptor metrics (messages, holds, faults, sessions, connections)
//! - Expose a Prometheus-compatible scrape endpoint
//!
//! # Metrics
//! - `interceptor_messages_total` (counter): messages by direction, outcome
//! - `interceptor_hold_duration_seconds` (histogram): time a message spent held
//! - `interceptor_rule_faults_total` (counter): faulting rules by name
//! - `interceptor_pending_sessions` (gauge): sessions awaiting a response
//! - `interceptor_sessions_aborted_total` (counter): aborted sessions by reason
//! - `interceptor_active_connections` (gauge): current connection count
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op (tests, metrics disabled)
//! - Label values are low-cardinality; rule names are operator-chosen

use std::net::SocketAddr;
use std::time::Duration;

use ::metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its HTTP listener.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// One message leaving the pipeline.
pub fn record_message(direction: &'static str, outcome: &'static str) {
    counter!("interceptor_messages_total", "direction" => direction, "outcome" => outcome).increment(1);
}

pub fn record_hold(outcome: &'static str, held_for: Duration) {
    histogram!("interceptor_hold_duration_seconds", "outcome" => outcome).record(held_for.as_secs_f64());
}

pub fn record_rule_fault(rule: &str) {
    counter!("interceptor_rule_faults_total", "rule" => rule.to_string()).increment(1);
}

pub fn record_pending_sessions(count: usize) {
    gauge!("interceptor_pending_sessions").set(count as f64);
}

pub fn record_session_aborted(reason: &'static str) {
    counter!("interceptor_sessions_aborted_total", "reason" => reason).increment(1);
}

pub fn record_active_connections(count: u64) {
    gauge!("interceptor_active_connections").set(count as f64);
}
