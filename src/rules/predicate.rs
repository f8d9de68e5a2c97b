//! Rule predicates: a closed set of match conditions over message attributes.

use serde::{Deserialize, Serialize};

use crate::highlight::assets::{self, StaticGroups};
use crate::message::{Direction, Message};
use crate::rules::pattern::PatternMatcher;
use crate::rules::{FaultReason, RuleError};
use crate::session::SessionView;

/// Nesting limit for `all` / `any_of` / `not`.
const MAX_DEPTH: usize = 32;

/// Declarative predicate as written in config and the admin API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PredicateConfig {
    Any,
    Method {
        method: String,
    },
    PathPrefix {
        prefix: String,
    },
    /// Wildcard pattern over the path without query.
    Path {
        pattern: String,
    },
    Host {
        pattern: String,
    },
    Header {
        name: String,
        /// Wildcard pattern; absent means "header is present".
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
    /// Regex over the decoded body bytes.
    Body {
        pattern: String,
    },
    JsonKey {
        key: String,
    },
    Status {
        min: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<u16>,
    },
    Secure {
        tls: bool,
    },
    StaticAsset,
    All {
        of: Vec<PredicateConfig>,
    },
    AnyOf {
        of: Vec<PredicateConfig>,
    },
    Not {
        predicate: Box<PredicateConfig>,
    },
}

/// Compiled predicate.
#[derive(Debug, Clone)]
pub enum Predicate {
    Any,
    Method(String),
    PathPrefix(String),
    Path(PatternMatcher),
    Host(PatternMatcher),
    Header {
        name: String,
        value: Option<PatternMatcher>,
    },
    Body(regex::bytes::Regex),
    JsonKey(String),
    Status {
        min: u16,
        max: u16,
    },
    Secure(bool),
    StaticAsset,
    All(Vec<Predicate>),
    AnyOf(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn compile(config: &PredicateConfig) -> Result<Self, RuleError> {
        compile_at(config, 0)
    }

    /// Evaluate against `message`.
    ///
    /// Request attributes (method, path, host) of a response are taken from
    /// the originating request in `session`. A fault means the predicate
    /// could not be decided; callers treat it as non-matching.
    pub fn evaluate(&self, message: &Message, session: &SessionView<'_>) -> Result<bool, FaultReason> {
        let request = match message.direction() {
            Direction::Request => Some(message),
            Direction::Response => session.request,
        };

        let matched = match self {
            Predicate::Any => true,
            Predicate::Method(method) => request
                .and_then(|r| r.method())
                .map(|m| m.eq_ignore_ascii_case(method))
                .unwrap_or(false),
            Predicate::PathPrefix(prefix) => request
                .and_then(|r| r.path())
                .map(|p| p.starts_with(prefix.as_str()))
                .unwrap_or(false),
            Predicate::Path(pattern) => request
                .and_then(|r| r.path())
                .map(|p| pattern.matches(p))
                .unwrap_or(false),
            Predicate::Host(pattern) => request
                .and_then(|r| r.host())
                .map(|h| pattern.matches(&h))
                .unwrap_or(false),
            Predicate::Header { name, value } => match value {
                None => message.has_header(name),
                Some(pattern) => message.headers_named(name).any(|v| pattern.matches(v)),
            },
            Predicate::Body(regex) => {
                let body = message.decoded_body().map_err(FaultReason::Body)?;
                regex.is_match(&body)
            }
            Predicate::JsonKey(key) => {
                if !message.is_json() {
                    return Ok(false);
                }
                let keys = message
                    .json_keys()
                    .map_err(|e| FaultReason::Json(e.to_string()))?;
                keys.iter().any(|k| k == key)
            }
            Predicate::Status { min, max } => message
                .status()
                .map(|s| s >= *min && s <= *max)
                .unwrap_or(false),
            Predicate::Secure(tls) => session.metadata.tls == *tls,
            Predicate::StaticAsset => request
                .and_then(|r| r.path())
                .map(|p| assets::is_static(p, &StaticGroups::all()))
                .unwrap_or(false),
            Predicate::All(predicates) => {
                for predicate in predicates {
                    if !predicate.evaluate(message, session)? {
                        return Ok(false);
                    }
                }
                true
            }
            Predicate::AnyOf(predicates) => {
                for predicate in predicates {
                    if predicate.evaluate(message, session)? {
                        return Ok(true);
                    }
                }
                false
            }
            Predicate::Not(inner) => !inner.evaluate(message, session)?,
        };
        Ok(matched)
    }
}

fn compile_at(config: &PredicateConfig, depth: usize) -> Result<Predicate, RuleError> {
    if depth > MAX_DEPTH {
        return Err(RuleError::TooDeep(MAX_DEPTH));
    }

    let predicate = match config {
        PredicateConfig::Any => Predicate::Any,
        PredicateConfig::Method { method } => Predicate::Method(method.to_ascii_uppercase()),
        PredicateConfig::PathPrefix { prefix } => Predicate::PathPrefix(prefix.clone()),
        PredicateConfig::Path { pattern } => Predicate::Path(PatternMatcher::new(pattern)),
        PredicateConfig::Host { pattern } => Predicate::Host(PatternMatcher::case_insensitive(pattern)),
        PredicateConfig::Header { name, value } => {
            if name.is_empty() {
                return Err(RuleError::Invalid("header predicate needs a name".into()));
            }
            Predicate::Header {
                name: name.clone(),
                value: value.as_deref().map(PatternMatcher::new),
            }
        }
        PredicateConfig::Body { pattern } => Predicate::Body(compile_regex(pattern)?),
        PredicateConfig::JsonKey { key } => Predicate::JsonKey(key.clone()),
        PredicateConfig::Status { min, max } => {
            let max = max.unwrap_or(*min);
            if max < *min {
                return Err(RuleError::Invalid(format!("status range {}..={} is empty", min, max)));
            }
            Predicate::Status { min: *min, max }
        }
        PredicateConfig::Secure { tls } => Predicate::Secure(*tls),
        PredicateConfig::StaticAsset => Predicate::StaticAsset,
        PredicateConfig::All { of } => Predicate::All(
            of.iter()
                .map(|p| compile_at(p, depth + 1))
                .collect::<Result<_, _>>()?,
        ),
        PredicateConfig::AnyOf { of } => Predicate::AnyOf(
            of.iter()
                .map(|p| compile_at(p, depth + 1))
                .collect::<Result<_, _>>()?,
        ),
        PredicateConfig::Not { predicate } => Predicate::Not(Box::new(compile_at(predicate, depth + 1)?)),
    };
    Ok(predicate)
}

pub(crate) fn compile_regex(pattern: &str) -> Result<regex::bytes::Regex, RuleError> {
    regex::bytes::Regex::new(pattern).map_err(|source| RuleError::Regex {
        pattern: pattern.to_string(),
        source,
    })
}
