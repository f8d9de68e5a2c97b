//! Per-message lifecycle and the final verdict handed to the transport.

use std::fmt;

use crate::message::Message;

/// Where a message is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Received,
    Normalized,
    RuleEvaluated,
    Held,
    /// An observer released the message.
    Released,
    /// Forwarded without an observer decision (no hold, timeout, no observer).
    AutoForwarded,
    Dropped,
    Delivered,
    /// Malformed or its connection went away.
    Aborted,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Received => "received",
            MessageState::Normalized => "normalized",
            MessageState::RuleEvaluated => "rule_evaluated",
            MessageState::Held => "held",
            MessageState::Released => "released",
            MessageState::AutoForwarded => "auto_forwarded",
            MessageState::Dropped => "dropped",
            MessageState::Delivered => "delivered",
            MessageState::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageState::Delivered | MessageState::Aborted)
    }

    pub fn can_transition_to(&self, next: MessageState) -> bool {
        use MessageState::*;
        matches!(
            (self, next),
            (Received, Normalized)
                | (Received, Aborted)
                | (Normalized, RuleEvaluated)
                | (Normalized, Dropped)
                | (Normalized, Aborted)
                | (RuleEvaluated, Held)
                | (RuleEvaluated, AutoForwarded)
                | (RuleEvaluated, Dropped)
                | (Held, Released)
                | (Held, AutoForwarded)
                | (Held, Dropped)
                | (Held, Aborted)
                | (Released, Delivered)
                | (Released, Dropped)
                | (Released, Aborted)
                | (AutoForwarded, Delivered)
                | (AutoForwarded, Dropped)
                | (AutoForwarded, Aborted)
                | (Dropped, Delivered)
        )
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: MessageState,
    pub to: MessageState,
}

/// Validated walk through [`MessageState`], keeping the path taken.
#[derive(Debug, Clone)]
pub struct StateTracker {
    current: MessageState,
    path: Vec<MessageState>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self {
            current: MessageState::Received,
            path: vec![MessageState::Received],
        }
    }
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> MessageState {
        self.current
    }

    pub fn path(&self) -> &[MessageState] {
        &self.path
    }

    pub fn advance(&mut self, next: MessageState) -> Result<(), InvalidTransition> {
        if !self.current.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.current,
                to: next,
            });
        }
        self.current = next;
        self.path.push(next);
        Ok(())
    }
}

/// What the transport must do with a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Send `message` on towards its destination.
    Forward { message: Message, modified: bool },
    /// Do not forward. Write `reply` back to the client if present, then
    /// close; with no reply just close.
    Drop { reply: Option<Message> },
    /// Tear the connection down without writing anything.
    AbortConnection,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Forward { modified: false, .. } => "forwarded",
            Decision::Forward { modified: true, .. } => "modified",
            Decision::Drop { .. } => "dropped",
            Decision::AbortConnection => "aborted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hold_path() {
        let mut tracker = StateTracker::new();
        for next in [
            MessageState::Normalized,
            MessageState::RuleEvaluated,
            MessageState::Held,
            MessageState::Released,
            MessageState::Delivered,
        ] {
            tracker.advance(next).unwrap();
        }
        assert!(tracker.current().is_terminal());
        assert_eq!(tracker.path().len(), 6);
    }

    #[test]
    fn test_rejects_skipping_evaluation() {
        let mut tracker = StateTracker::new();
        tracker.advance(MessageState::Normalized).unwrap();
        let err = tracker.advance(MessageState::Held).unwrap_err();
        assert_eq!(err.from, MessageState::Normalized);
        assert_eq!(tracker.current(), MessageState::Normalized);

        let mut done = StateTracker::new();
        done.advance(MessageState::Aborted).unwrap();
        assert!(done.advance(MessageState::Normalized).is_err());
    }
}
