//! Ordered rule evaluation over an atomically swapped snapshot.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::config::RuleConfig;
use crate::error::InterceptError;
use crate::message::{Direction, Message};
use crate::observability::metrics;
use crate::rules::action::{apply_edits, Action};
use crate::rules::predicate::Predicate;
use crate::rules::{FaultReason, RuleError};
use crate::session::SessionView;

/// Registration sequence number; the tie-break for equal priorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(u64);

impl RuleId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for RuleId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which messages a rule is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleTarget {
    #[default]
    Request,
    Response,
    Both,
}

impl RuleTarget {
    pub fn applies_to(&self, direction: Direction) -> bool {
        match self {
            RuleTarget::Both => true,
            RuleTarget::Request => direction == Direction::Request,
            RuleTarget::Response => direction == Direction::Response,
        }
    }
}

/// A compiled rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: RuleId,
    pub predicate: Predicate,
    pub action: Action,
    config: RuleConfig,
}

impl Rule {
    pub fn compile(id: RuleId, config: &RuleConfig) -> Result<Self, RuleError> {
        if config.name.trim().is_empty() {
            return Err(RuleError::Invalid("rule name must not be empty".into()));
        }
        Ok(Self {
            id,
            predicate: Predicate::compile(&config.predicate)?,
            action: Action::compile(&config.action)?,
            config: config.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn priority(&self) -> i32 {
        self.config.priority
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn target(&self) -> RuleTarget {
        self.config.target
    }

    pub fn info(&self) -> RuleInfo {
        RuleInfo {
            id: self.id,
            config: self.config.clone(),
        }
    }

    fn sort_key(&self) -> (i32, RuleId) {
        (self.config.priority, self.id)
    }
}

/// Listing entry for the admin API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleInfo {
    pub id: RuleId,
    #[serde(flatten)]
    pub config: RuleConfig,
}

/// Terminal result of evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOutcome {
    Forward,
    Drop { rule: RuleId },
    Hold { rule: RuleId },
}

impl RuleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleOutcome::Forward => "forward",
            RuleOutcome::Drop { .. } => "drop",
            RuleOutcome::Hold { .. } => "hold",
        }
    }
}

/// A rule that could not be decided for one message.
#[derive(Debug, Clone)]
pub struct RuleFault {
    pub rule: RuleId,
    pub name: String,
    pub reason: FaultReason,
}

/// Result of running one message through a snapshot.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub outcome: RuleOutcome,
    /// The message with every applied modification.
    pub message: Message,
    /// Rules whose predicate matched, in visit order.
    pub matched: Vec<RuleId>,
    pub faults: Vec<RuleFault>,
    /// True if any edit changed the wire form.
    pub modified: bool,
}

/// Immutable, ordered rule list.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Arc<Rule>>,
}

impl RuleSet {
    fn from_rules(mut rules: Vec<Arc<Rule>>) -> Self {
        rules.sort_by_key(|r| r.sort_key());
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.rules.iter()
    }

    /// Visit rules in `(priority, id)` order until a terminal action.
    ///
    /// A faulting predicate or edit is recorded and treated as non-matching;
    /// it never aborts evaluation.
    pub fn evaluate(&self, message: &Message, session: &SessionView<'_>) -> Evaluation {
        let direction = message.direction();
        let mut current = message.clone();
        let mut matched = Vec::new();
        let mut faults = Vec::new();
        let mut modified = false;

        for rule in &self.rules {
            if !rule.enabled() || !rule.target().applies_to(direction) {
                continue;
            }

            match rule.predicate.evaluate(&current, session) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(reason) => {
                    faults.push(record_fault(rule, reason));
                    continue;
                }
            }

            let outcome = match &rule.action {
                Action::Forward => RuleOutcome::Forward,
                Action::Drop => RuleOutcome::Drop { rule: rule.id },
                Action::Hold => RuleOutcome::Hold { rule: rule.id },
                Action::Modify { edits, stop } => match apply_edits(&current, edits) {
                    Ok(next) => {
                        matched.push(rule.id);
                        modified |= next.wire_differs(&current);
                        current = next;
                        if *stop {
                            break;
                        }
                        continue;
                    }
                    Err(e) => {
                        faults.push(record_fault(rule, FaultReason::Edit(e)));
                        continue;
                    }
                },
            };

            matched.push(rule.id);
            tracing::debug!(
                rule_id = %rule.id,
                rule = %rule.name(),
                outcome = outcome.as_str(),
                "Terminal rule matched"
            );
            return Evaluation {
                outcome,
                message: current,
                matched,
                faults,
                modified,
            };
        }

        Evaluation {
            outcome: RuleOutcome::Forward,
            message: current,
            matched,
            faults,
            modified,
        }
    }
}

fn record_fault(rule: &Rule, reason: FaultReason) -> RuleFault {
    let fault = InterceptError::RuleEvaluationFault {
        rule: rule.id,
        reason: reason.clone(),
    };
    tracing::warn!(rule = %rule.name(), error = %fault, "Rule faulted, treating as non-matching");
    metrics::record_rule_fault(rule.name());
    RuleFault {
        rule: rule.id,
        name: rule.name().to_string(),
        reason,
    }
}

/// Owns the live rule set.
///
/// Readers load one snapshot per evaluation; writers build a new snapshot and
/// swap it in, so a message already under evaluation never sees a change.
pub struct RuleEngine {
    snapshot: ArcSwap<RuleSet>,
    next_id: AtomicU64,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RuleSet::default()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl RuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an engine from configured rules.
    pub fn from_config(configs: &[RuleConfig]) -> Result<Self, RuleError> {
        let engine = Self::new();
        engine.replace_all(configs)?;
        Ok(engine)
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.snapshot.load_full()
    }

    pub fn evaluate(&self, message: &Message, session: &SessionView<'_>) -> Evaluation {
        self.snapshot.load().evaluate(message, session)
    }

    pub fn add(&self, config: &RuleConfig) -> Result<RuleId, RuleError> {
        let id = self.allocate_id();
        let rule = Arc::new(Rule::compile(id, config)?);
        self.snapshot.rcu(|current| {
            let mut rules = current.rules.clone();
            rules.push(Arc::clone(&rule));
            RuleSet::from_rules(rules)
        });
        tracing::info!(rule_id = %id, rule = %rule.name(), action = rule.action.kind(), "Rule added");
        Ok(id)
    }

    /// Returns false if no rule has this id.
    pub fn remove(&self, id: RuleId) -> bool {
        let mut removed = false;
        self.snapshot.rcu(|current| {
            let rules: Vec<_> = current.rules.iter().filter(|r| r.id != id).cloned().collect();
            removed = rules.len() != current.rules.len();
            RuleSet::from_rules(rules)
        });
        if removed {
            tracing::info!(rule_id = %id, "Rule removed");
        }
        removed
    }

    /// Returns false if no rule has this id.
    pub fn set_enabled(&self, id: RuleId, enabled: bool) -> bool {
        let mut found = false;
        self.snapshot.rcu(|current| {
            found = false;
            let rules = current
                .rules
                .iter()
                .map(|r| {
                    if r.id != id {
                        return Arc::clone(r);
                    }
                    found = true;
                    let mut updated = Rule::clone(r);
                    updated.config.enabled = enabled;
                    Arc::new(updated)
                })
                .collect();
            RuleSet::from_rules(rules)
        });
        if found {
            tracing::info!(rule_id = %id, enabled, "Rule toggled");
        }
        found
    }

    /// Replace every rule. Nothing changes if any rule fails to compile.
    pub fn replace_all(&self, configs: &[RuleConfig]) -> Result<(), RuleError> {
        let rules = configs
            .iter()
            .map(|config| {
                Rule::compile(self.allocate_id(), config)
                    .map(Arc::new)
                    .map_err(|e| RuleError::InRule {
                        name: config.name.clone(),
                        source: Box::new(e),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let count = rules.len();
        self.snapshot.store(Arc::new(RuleSet::from_rules(rules)));
        tracing::info!(rules = count, "Rule set replaced");
        Ok(())
    }

    pub fn get(&self, id: RuleId) -> Option<RuleInfo> {
        self.snapshot.load().rules.iter().find(|r| r.id == id).map(|r| r.info())
    }

    /// Rules in evaluation order.
    pub fn list(&self) -> Vec<RuleInfo> {
        self.snapshot.load().rules.iter().map(|r| r.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }

    fn allocate_id(&self) -> RuleId {
        RuleId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}
