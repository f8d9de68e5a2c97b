//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the interceptor.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::rules::{ActionConfig, PredicateConfig, RuleTarget};

/// Root configuration for the interceptor.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct InterceptorConfig {
    /// Proxy listener (bind address, connection cap).
    pub listener: ListenerConfig,

    pub admin: AdminConfig,

    /// What happens to held messages nobody decides on.
    pub hold: HoldConfig,

    /// How dropped requests are answered.
    pub drop: DropConfig,

    pub sessions: SessionConfig,

    pub timeouts: TimeoutConfig,

    pub limits: LimitsConfig,

    pub observability: ObservabilityConfig,

    /// Duplicate/static request highlighting.
    pub highlight: HighlightConfig,

    /// Interception rules, evaluated by priority then declaration order.
    pub rules: Vec<RuleConfig>,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "127.0.0.1:8080").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            max_connections: 1_024,
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this before enabling.
            api_key: "CHANGE_ME".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

/// What to do with a held message when the observer never answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldPolicy {
    #[default]
    Forward,
    Drop,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HoldConfig {
    /// How long a held message waits for a decision.
    pub timeout_ms: u64,

    /// Applied on timeout and when no observer is subscribed.
    pub default_policy: HoldPolicy,
}

impl Default for HoldConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            default_policy: HoldPolicy::Forward,
        }
    }
}

/// How a dropped request is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropMode {
    /// Synthesize a rejection response.
    #[default]
    Reject,
    /// Close the client connection.
    Close,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DropConfig {
    pub mode: DropMode,

    /// Status of the synthesized rejection.
    pub status: u16,
}

impl Default for DropConfig {
    fn default() -> Self {
        Self {
            mode: DropMode::Reject,
            status: 403,
        }
    }
}

/// Session correlation settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// A request without a response after this long is aborted.
    pub ttl_secs: u64,

    /// Reaper tick.
    pub reap_interval_secs: u64,

    /// Hard cap on sessions awaiting a response.
    pub max_pending: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 120,
            reap_interval_secs: 5,
            max_pending: 65_536,
        }
    }
}

/// Timeout configuration for the TCP transport.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Origin connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Max wait for the rest of a partially received message, in seconds.
    pub read_secs: u64,

    /// Idle client connection timeout in seconds.
    pub idle_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            read_secs: 30,
            idle_secs: 60,
        }
    }
}

/// Size limits for buffered messages.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_head_bytes: usize,
    pub max_body_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_head_bytes: 64 * 1024,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Duplicate request highlighting.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct HighlightConfig {
    pub enabled: bool,

    /// Paint static assets gray, per asset group.
    pub static_images: bool,
    pub static_scripts: bool,
    pub static_fonts_media: bool,

    /// Parts of a request that make up its duplicate key.
    pub use_get_names: bool,
    pub use_get_values: bool,
    pub use_post_names: bool,
    pub use_post_values: bool,
    pub use_cookie_names: bool,
    pub use_cookie_values: bool,
    pub use_json_keys: bool,
    pub use_header_names: bool,
    pub use_header_values: bool,

    /// Leave repeats and static assets unhighlighted instead of gray.
    pub disable_gray: bool,
}

impl Default for HighlightConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            static_images: true,
            static_scripts: true,
            static_fonts_media: true,
            use_get_names: true,
            use_get_values: true,
            use_post_names: true,
            use_post_values: false,
            use_cookie_names: false,
            use_cookie_values: false,
            use_json_keys: true,
            use_header_names: false,
            use_header_values: false,
            disable_gray: false,
        }
    }
}

/// One interception rule.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RuleConfig {
    /// Rule identifier for logging/metrics.
    pub name: String,

    /// Lower runs first.
    #[serde(default)]
    pub priority: i32,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub target: RuleTarget,

    #[serde(rename = "match")]
    pub predicate: PredicateConfig,

    pub action: ActionConfig,
}

fn default_enabled() -> bool {
    true
}
