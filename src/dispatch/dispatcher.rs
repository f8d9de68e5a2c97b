//! Held message fan-out and decision collection.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::message::model::decode_latin1;
use crate::message::{Annotations, Direction, Message};
use crate::net::connection::ConnectionId;
use crate::observability::metrics;
use crate::rules::{EditConfig, RuleId};
use crate::session::CorrelationId;

/// Identifier of one hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HoldId(Uuid);

impl HoldId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HoldId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HoldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for HoldId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Where a held message came from.
#[derive(Debug, Clone, Copy)]
pub struct HoldOrigin {
    pub connection: ConnectionId,
    pub correlation_id: Option<CorrelationId>,
    pub rule: Option<RuleId>,
}

/// What observers see for a held message.
#[derive(Debug, Clone, Serialize)]
pub struct HeldEvent {
    pub hold_id: HoldId,
    pub connection: ConnectionId,
    pub correlation_id: Option<CorrelationId>,
    pub rule: Option<RuleId>,
    pub direction: Direction,
    /// Full wire form, one char per byte (ISO-8859-1).
    pub raw: String,
    pub annotations: Annotations,
    /// Unix epoch milliseconds.
    pub held_at: u64,
    #[serde(skip)]
    pub message: Message,
}

impl HeldEvent {
    fn new(hold_id: HoldId, message: &Message, origin: &HoldOrigin) -> Self {
        let held_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            hold_id,
            connection: origin.connection,
            correlation_id: origin.correlation_id,
            rule: origin.rule,
            direction: message.direction(),
            raw: decode_latin1(&message.serialize()),
            annotations: message.annotations().clone(),
            held_at,
            message: message.clone(),
        }
    }
}

/// An observer's verdict on a held message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverDecision {
    /// Release unchanged (rule modifications kept).
    Forward,
    Modify { edits: Vec<EditConfig> },
    /// Replace the whole message with new wire bytes (ISO-8859-1 text).
    Replace { raw: String },
    Drop,
}

impl ObserverDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObserverDecision::Forward => "forward",
            ObserverDecision::Modify { .. } => "modify",
            ObserverDecision::Replace { .. } => "replace",
            ObserverDecision::Drop => "drop",
        }
    }
}

/// How a hold ended.
#[derive(Debug, Clone, PartialEq)]
pub enum HoldOutcome {
    Decided(ObserverDecision),
    TimedOut,
    /// The owning connection closed or the dispatcher shut down.
    Cancelled,
    NoObserver,
}

impl HoldOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoldOutcome::Decided(_) => "decided",
            HoldOutcome::TimedOut => "timed_out",
            HoldOutcome::Cancelled => "cancelled",
            HoldOutcome::NoObserver => "no_observer",
        }
    }
}

/// Reply to [`EventDispatcher::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAck {
    Applied,
    /// Already decided, timed out, cancelled, or never existed.
    AlreadyResolved,
}

/// Pushed to every subscriber.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DispatchEvent {
    Held(HeldEvent),
    Resolved { hold_id: HoldId, outcome: &'static str },
}

/// A live observer registration. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<DispatchEvent>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the dispatcher is gone.
    pub async fn recv(&mut self) -> Option<DispatchEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<DispatchEvent> {
        self.rx.try_recv().ok()
    }
}

struct PendingHold {
    event: HeldEvent,
    decision_tx: oneshot::Sender<ObserverDecision>,
}

/// Removes the pending entry on every exit path of a hold.
struct PendingGuard<'a> {
    pending: &'a DashMap<HoldId, PendingHold>,
    hold_id: HoldId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.hold_id);
    }
}

/// Pushes held messages to observers and waits for their decisions.
pub struct EventDispatcher {
    pending: DashMap<HoldId, PendingHold>,
    subscribers: DashMap<u64, mpsc::UnboundedSender<DispatchEvent>>,
    next_subscriber: AtomicU64,
    timeout_ms: AtomicU64,
}

impl EventDispatcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            subscribers: DashMap::new(),
            next_subscriber: AtomicU64::new(1),
            timeout_ms: AtomicU64::new(timeout.as_millis() as u64),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    /// Applies to holds started after the call.
    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms.store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Register an observer. Every currently pending hold is replayed first.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        // Register before replaying: a hold added concurrently is either in
        // the replay or broadcast to us (possibly both).
        self.subscribers.insert(id, tx.clone());
        let replay: Vec<HeldEvent> = self.pending.iter().map(|p| p.event.clone()).collect();
        for event in replay {
            let _ = tx.send(DispatchEvent::Held(event));
        }

        tracing::info!(subscriber = id, "Observer subscribed");
        Subscription { id, rx }
    }

    /// Live observers.
    pub fn observer_count(&self) -> usize {
        self.subscribers.retain(|_, tx| !tx.is_closed());
        self.subscribers.len()
    }

    /// Currently held messages.
    pub fn pending(&self) -> Vec<HeldEvent> {
        self.pending.iter().map(|p| p.event.clone()).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Hold `message` until an observer decides, the timeout elapses, or
    /// `cancel` fires. Suspends only the calling task.
    pub async fn notify_held(&self, message: &Message, origin: HoldOrigin, cancel: &CancellationToken) -> HoldOutcome {
        if self.observer_count() == 0 {
            tracing::debug!(connection_id = %origin.connection, "No observer subscribed, hold skipped");
            return HoldOutcome::NoObserver;
        }

        let hold_id = HoldId::new();
        let (decision_tx, decision_rx) = oneshot::channel();
        let event = HeldEvent::new(hold_id, message, &origin);
        self.pending.insert(
            hold_id,
            PendingHold {
                event: event.clone(),
                decision_tx,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            hold_id,
        };

        let timeout = self.timeout();
        let started = Instant::now();
        tracing::info!(
            hold_id = %hold_id,
            connection_id = %origin.connection,
            correlation_id = ?origin.correlation_id,
            direction = %message.direction(),
            timeout_ms = timeout.as_millis() as u64,
            "Message held"
        );
        self.broadcast(DispatchEvent::Held(event));

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => HoldOutcome::Cancelled,
            decision = decision_rx => match decision {
                Ok(decision) => HoldOutcome::Decided(decision),
                // Sender dropped without a decision: dispatcher shut down.
                Err(_) => HoldOutcome::Cancelled,
            },
            _ = tokio::time::sleep(timeout) => HoldOutcome::TimedOut,
        };

        let held_for = started.elapsed();
        metrics::record_hold(outcome.as_str(), held_for);
        tracing::info!(
            hold_id = %hold_id,
            outcome = outcome.as_str(),
            held_ms = held_for.as_millis() as u64,
            "Hold released"
        );
        self.broadcast(DispatchEvent::Resolved {
            hold_id,
            outcome: outcome.as_str(),
        });
        outcome
    }

    /// Deliver a decision. Only the first decision for a hold takes effect.
    pub fn decide(&self, hold_id: HoldId, decision: ObserverDecision) -> DecisionAck {
        let Some((_, pending)) = self.pending.remove(&hold_id) else {
            tracing::warn!(hold_id = %hold_id, "Decision for a hold that is no longer pending ignored");
            return DecisionAck::AlreadyResolved;
        };
        let kind = decision.as_str();
        match pending.decision_tx.send(decision) {
            Ok(()) => {
                tracing::info!(hold_id = %hold_id, decision = kind, "Decision applied");
                DecisionAck::Applied
            }
            Err(_) => {
                tracing::warn!(hold_id = %hold_id, "Hold ended before the decision arrived");
                DecisionAck::AlreadyResolved
            }
        }
    }

    /// End every pending hold as cancelled (shutdown).
    pub fn release_all(&self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    fn broadcast(&self, event: DispatchEvent) {
        let mut closed = Vec::new();
        for entry in self.subscribers.iter() {
            if entry.value().send(event.clone()).is_err() {
                closed.push(*entry.key());
            }
        }
        for id in closed {
            self.subscribers.remove(&id);
            tracing::debug!(subscriber = id, "Observer disconnected");
        }
    }
}
