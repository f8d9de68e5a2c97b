//! Error taxonomy for interception.
//!
//! Every failure here is scoped to one message or one connection; none of
//! them stop the process.

use std::time::Duration;

use thiserror::Error;

use crate::message::MalformedMessage;
use crate::rules::{FaultReason, RuleId};
use crate::session::{CorrelationId, SessionError};

#[derive(Debug, Error)]
pub enum InterceptError {
    #[error("malformed message: {0}")]
    Malformed(#[from] MalformedMessage),

    #[error("rule {rule} faulted: {reason}")]
    RuleEvaluationFault { rule: RuleId, reason: FaultReason },

    #[error("hold timed out after {0:?}")]
    HoldTimeout(Duration),

    #[error("session {0} expired before its response arrived")]
    SessionTimeout(CorrelationId),

    #[error("observer disconnected")]
    ObserverDisconnected,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}
