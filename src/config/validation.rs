//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, addresses parse, status codes)
//! - Compile every rule so a bad pattern is caught before it goes live
//! - Detect duplicate rule names
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: InterceptorConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::InterceptorConfig;
use crate::rules::{Rule, RuleId};

/// A single semantic problem, tagged with the offending field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

pub fn validate_config(config: &InterceptorConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_addr(&mut errors, "listener.bind_address", &config.listener.bind_address);
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than 0"));
    }

    if config.admin.enabled {
        check_addr(&mut errors, "admin.bind_address", &config.admin.bind_address);
        if config.admin.api_key.trim().is_empty() {
            errors.push(ValidationError::new("admin.api_key", "must not be empty"));
        }
    }

    if config.hold.timeout_ms == 0 {
        errors.push(ValidationError::new("hold.timeout_ms", "must be greater than 0"));
    }
    if !(200..=599).contains(&config.drop.status) {
        errors.push(ValidationError::new(
            "drop.status",
            format!("{} is not a final status code (200-599)", config.drop.status),
        ));
    }

    if config.sessions.ttl_secs == 0 {
        errors.push(ValidationError::new("sessions.ttl_secs", "must be greater than 0"));
    }
    if config.sessions.reap_interval_secs == 0 {
        errors.push(ValidationError::new("sessions.reap_interval_secs", "must be greater than 0"));
    }
    if config.sessions.max_pending == 0 {
        errors.push(ValidationError::new("sessions.max_pending", "must be greater than 0"));
    }

    if config.timeouts.connect_secs == 0 {
        errors.push(ValidationError::new("timeouts.connect_secs", "must be greater than 0"));
    }
    if config.timeouts.read_secs == 0 {
        errors.push(ValidationError::new("timeouts.read_secs", "must be greater than 0"));
    }
    if config.limits.max_head_bytes < 64 {
        errors.push(ValidationError::new("limits.max_head_bytes", "must be at least 64"));
    }

    if !LOG_LEVELS.contains(&config.observability.log_level.to_ascii_lowercase().as_str()) {
        errors.push(ValidationError::new(
            "observability.log_level",
            format!("unknown level {:?}", config.observability.log_level),
        ));
    }
    if config.observability.metrics_enabled {
        check_addr(&mut errors, "observability.metrics_address", &config.observability.metrics_address);
    }

    let mut names = HashSet::new();
    for (idx, rule) in config.rules.iter().enumerate() {
        let field = format!("rules[{}]", idx);
        if !names.insert(rule.name.as_str()) {
            errors.push(ValidationError::new(&field, format!("duplicate rule name {:?}", rule.name)));
        }
        if let Err(e) = Rule::compile(RuleId::from(0), rule) {
            errors.push(ValidationError::new(&field, e.to_string()));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_addr(errors: &mut Vec<ValidationError>, field: &str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(field, format!("{:?} is not a socket address", value)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::RuleConfig;
    use crate::rules::{ActionConfig, PredicateConfig, RuleTarget};

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&InterceptorConfig::default()).is_ok());
    }

    #[test]
    fn test_collects_every_error() {
        let mut config = InterceptorConfig::default();
        config.listener.bind_address = "not-an-address".into();
        config.hold.timeout_ms = 0;
        config.drop.status = 101;
        config.observability.log_level = "loud".into();

        let bad_rule = RuleConfig {
            name: "bad".into(),
            priority: 0,
            enabled: true,
            target: RuleTarget::Request,
            predicate: PredicateConfig::Body { pattern: "(".into() },
            action: ActionConfig::Drop,
        };
        config.rules = vec![bad_rule.clone(), bad_rule];

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"listener.bind_address"));
        assert!(fields.contains(&"hold.timeout_ms"));
        assert!(fields.contains(&"drop.status"));
        assert!(fields.contains(&"observability.log_level"));
        // Compile error for both, duplicate name for the second
        assert_eq!(fields.iter().filter(|f| f.starts_with("rules[")).count(), 3);
    }
}
