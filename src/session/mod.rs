//! Session correlation subsystem.
//!
//! # Data Flow
//! ```text
//! Request observed
//!     → correlator.rs on_request (new Session, PENDING_RESPONSE, queued per connection)
//! Response observed
//!     → expected_response(connection) (head of that connection's queue)
//!     → on_response (COMPLETE, session released to caller)
//! Reaper tick / connection close
//!     → PENDING_RESPONSE sessions past TTL → ABORTED, released
//! ```
//!
//! # Design Decisions
//! - HTTP/1.1 responses complete in request order per connection
//! - Out-of-order responses are rejected, never re-matched
//! - Sharded maps (dashmap) instead of a global lock
//! - TTL is measured on the monotonic clock, from when the request was last
//!   released toward the origin; a request held for review never expires

pub mod correlator;

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::Message;
use crate::net::connection::{ConnectionId, ConnectionMetadata};

pub use correlator::{ExpectedResponse, SessionCorrelator, SessionSummary};

/// Identifier linking a request to its eventual response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    PendingResponse,
    Complete,
    Aborted,
}

/// One request and (eventually) its response.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: CorrelationId,
    pub connection: ConnectionId,
    pub metadata: ConnectionMetadata,
    pub request: Message,
    pub response: Option<Message>,
    pub state: SessionState,
    pub created: Instant,
    /// The request is waiting on an observer and has not reached the origin.
    pub held: bool,
    /// Start of the response wait the TTL applies to.
    pub waiting_since: Instant,
}

/// Read-only context handed to rule predicates.
#[derive(Debug, Clone, Copy)]
pub struct SessionView<'a> {
    pub metadata: &'a ConnectionMetadata,
    /// The originating request when evaluating a response.
    pub request: Option<&'a Message>,
}

/// Correlation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("unknown session {0}")]
    Unknown(CorrelationId),

    #[error("session {0} was aborted")]
    Aborted(CorrelationId),

    #[error("response for {got} arrived while {expected} is still pending")]
    OutOfOrder {
        expected: CorrelationId,
        got: CorrelationId,
    },

    #[error("no request pending on {0}")]
    NoPendingRequest(ConnectionId),

    #[error("session table full ({0} pending)")]
    Capacity(usize),
}
