//! Rule engine subsystem.
//!
//! # Data Flow
//! ```text
//! [[rules]] config / admin API
//!     → RuleConfig (serde)
//!     → Rule::compile (predicate.rs, action.rs, pattern.rs)
//!     → engine.rs RuleSet snapshot (sorted by priority, then id)
//!     → ArcSwap store
//!
//! Message + SessionView
//!     → snapshot.load()
//!     → visit rules in order: predicate → action
//!     → Evaluation { outcome, message, matched, faults }
//! ```
//!
//! # Design Decisions
//! - Predicates and edits are closed enums, compiled once at registration
//! - Mutations build a new snapshot; evaluation never takes a lock
//! - A rule that faults is skipped for that message only

pub mod action;
pub mod engine;
pub mod pattern;
pub mod predicate;

use thiserror::Error;

use crate::message::MalformedMessage;

pub use action::{apply_edits, compile_edits, Action, ActionConfig, Edit, EditConfig};
pub use engine::{Evaluation, Rule, RuleEngine, RuleFault, RuleId, RuleInfo, RuleOutcome, RuleSet, RuleTarget};
pub use predicate::{Predicate, PredicateConfig};

/// A rule that cannot be compiled.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid regex {pattern:?}: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("{0}")]
    Invalid(String),

    #[error("predicate nesting exceeds {0} levels")]
    TooDeep(usize),

    #[error("rule {name:?}: {source}")]
    InRule {
        name: String,
        #[source]
        source: Box<RuleError>,
    },
}

/// Why a rule could not be decided for one message.
#[derive(Debug, Clone, Error)]
pub enum FaultReason {
    #[error("body cannot be decoded: {0}")]
    Body(MalformedMessage),

    #[error("body is not valid JSON: {0}")]
    Json(String),

    #[error("edit cannot be applied: {0}")]
    Edit(MalformedMessage),
}
