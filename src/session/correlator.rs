//! Request/response correlation.
//!
//! # Responsibilities
//! - Create a session per observed request
//! - Match responses to the oldest pending request on the same connection
//! - Abort sessions that outlive the TTL and release them
//! - Release every session of a connection when it closes

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::error::InterceptError;
use crate::message::{HighlightColor, Message};
use crate::net::connection::{ConnectionContext, ConnectionId};
use crate::observability::metrics;
use crate::session::{CorrelationId, Session, SessionError, SessionState};

/// Head of a connection's response queue.
#[derive(Debug, Clone)]
pub struct ExpectedResponse {
    pub id: CorrelationId,
    /// The session was aborted after its request was forwarded; the response
    /// must be consumed and suppressed.
    pub aborted: bool,
    pub request: Option<Message>,
}

/// Admin-facing snapshot of a pending session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: CorrelationId,
    pub connection: ConnectionId,
    pub peer_addr: String,
    pub tls: bool,
    pub method: Option<String>,
    pub target: Option<String>,
    pub state: SessionState,
    pub age_ms: u128,
    pub highlight: Option<HighlightColor>,
}

/// Concurrent session table.
#[derive(Debug)]
pub struct SessionCorrelator {
    sessions: DashMap<CorrelationId, Session>,
    /// Per-connection queue of correlation ids in send order.
    queues: DashMap<ConnectionId, VecDeque<CorrelationId>>,
    /// Aborted sessions whose request already reached the origin.
    tombstones: DashMap<CorrelationId, ConnectionId>,
    ttl: Duration,
    max_pending: usize,
}

impl SessionCorrelator {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            queues: DashMap::new(),
            tombstones: DashMap::new(),
            ttl: Duration::from_secs(config.ttl_secs),
            max_pending: config.max_pending,
        }
    }

    /// Register a request and return its correlation id.
    pub fn on_request(&self, request: &Message, conn: &ConnectionContext) -> Result<CorrelationId, SessionError> {
        if self.sessions.len() >= self.max_pending {
            self.reap_expired();
            if self.sessions.len() >= self.max_pending {
                tracing::warn!(max_pending = self.max_pending, "Session table full");
                return Err(SessionError::Capacity(self.max_pending));
            }
        }

        let id = CorrelationId::new();
        let now = Instant::now();
        self.sessions.insert(
            id,
            Session {
                id,
                connection: conn.id,
                metadata: conn.metadata.clone(),
                request: request.clone().with_correlation_id(id),
                response: None,
                state: SessionState::PendingResponse,
                created: now,
                held: false,
                waiting_since: now,
            },
        );
        self.queues.entry(conn.id).or_default().push_back(id);
        metrics::record_pending_sessions(self.sessions.len());

        tracing::trace!(correlation_id = %id, connection_id = %conn.id, "Session opened");
        Ok(id)
    }

    /// Replace the stored request with the version actually forwarded.
    pub fn update_request(&self, id: CorrelationId, request: &Message) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.request = request.clone().with_correlation_id(id);
        }
    }

    /// Exempt a session from TTL reaping while its request waits on an observer.
    pub fn hold(&self, id: CorrelationId) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.held = true;
        }
    }

    /// End a hold and restart the TTL clock.
    ///
    /// Returns `false` when the session no longer exists, in which case the
    /// request must not be sent.
    pub fn release_hold(&self, id: CorrelationId) -> bool {
        match self.sessions.get_mut(&id) {
            Some(mut session) => {
                session.held = false;
                session.waiting_since = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Peek at the request a response on `connection` would answer.
    pub fn expected_response(&self, connection: ConnectionId) -> Option<ExpectedResponse> {
        let id = self.queues.get(&connection)?.front().copied()?;
        if self.tombstones.contains_key(&id) {
            return Some(ExpectedResponse {
                id,
                aborted: true,
                request: None,
            });
        }
        let request = self.sessions.get(&id).map(|s| s.request.clone());
        Some(ExpectedResponse {
            id,
            aborted: request.is_none(),
            request,
        })
    }

    /// Attach a response to its session and release the session.
    ///
    /// The id must be the oldest pending request on its connection.
    pub fn on_response(&self, response: &Message, id: CorrelationId) -> Result<Session, SessionError> {
        let connection = match self.sessions.get(&id) {
            Some(session) => session.connection,
            None => match self.tombstones.get(&id) {
                Some(conn) => *conn,
                None => return Err(SessionError::Unknown(id)),
            },
        };

        self.pop_head(connection, id)?;

        if self.tombstones.remove(&id).is_some() {
            return Err(SessionError::Aborted(id));
        }
        let (_, mut session) = self
            .sessions
            .remove(&id)
            .ok_or(SessionError::Aborted(id))?;
        metrics::record_pending_sessions(self.sessions.len());

        session.response = Some(response.clone().with_correlation_id(id));
        session.state = SessionState::Complete;
        tracing::trace!(correlation_id = %id, connection_id = %connection, "Session complete");
        Ok(session)
    }

    /// Consume the queue slot for a response that will not be delivered
    /// (unparseable, or dropped by a rule) and release the session.
    pub fn discard_response(&self, id: CorrelationId, reason: &'static str) -> Result<(), SessionError> {
        let connection = match self.sessions.get(&id) {
            Some(session) => session.connection,
            None => match self.tombstones.get(&id) {
                Some(conn) => *conn,
                None => return Err(SessionError::Unknown(id)),
            },
        };
        self.pop_head(connection, id)?;
        self.tombstones.remove(&id);
        if self.sessions.remove(&id).is_some() {
            metrics::record_session_aborted(reason);
            metrics::record_pending_sessions(self.sessions.len());
        }
        Ok(())
    }

    /// Release a request that never reached the origin.
    ///
    /// Also clears the queue slot of a session that was aborted before it was
    /// sent, so no response is expected for it.
    pub fn drop_request(&self, id: CorrelationId) -> Option<Session> {
        let Some((_, mut session)) = self.sessions.remove(&id) else {
            if let Some((_, connection)) = self.tombstones.remove(&id) {
                self.remove_queued(connection, id);
            }
            return None;
        };
        self.remove_queued(session.connection, id);
        session.state = SessionState::Aborted;
        metrics::record_session_aborted("dropped");
        metrics::record_pending_sessions(self.sessions.len());
        Some(session)
    }

    fn remove_queued(&self, connection: ConnectionId, id: CorrelationId) {
        if let Some(mut queue) = self.queues.get_mut(&connection) {
            queue.retain(|queued| *queued != id);
        }
    }

    /// Abort a session whose request may already be at the origin.
    ///
    /// The queue slot is kept as a tombstone so the late response is consumed
    /// instead of being matched to the next request.
    pub fn abort(&self, id: CorrelationId, reason: &'static str) -> Option<Session> {
        let (_, mut session) = self.sessions.remove(&id)?;
        let still_queued = self
            .queues
            .get(&session.connection)
            .map(|q| q.contains(&id))
            .unwrap_or(false);
        if still_queued {
            self.tombstones.insert(id, session.connection);
        }
        session.state = SessionState::Aborted;
        metrics::record_session_aborted(reason);
        metrics::record_pending_sessions(self.sessions.len());
        Some(session)
    }

    /// Abort every session of a closed connection. Returns how many were pending.
    pub fn close_connection(&self, connection: ConnectionId) -> usize {
        let Some((_, queue)) = self.queues.remove(&connection) else {
            return 0;
        };
        let mut aborted = 0;
        for id in queue {
            self.tombstones.remove(&id);
            if self.sessions.remove(&id).is_some() {
                aborted += 1;
                metrics::record_session_aborted("connection_closed");
            }
        }
        metrics::record_pending_sessions(self.sessions.len());
        if aborted > 0 {
            tracing::debug!(connection_id = %connection, aborted, "Released sessions of closed connection");
        }
        aborted
    }

    /// Abort sessions older than the TTL. Returns how many were aborted.
    pub fn reap_expired(&self) -> usize {
        let expired: Vec<CorrelationId> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry.state == SessionState::PendingResponse
                    && !entry.held
                    && entry.waiting_since.elapsed() > self.ttl
            })
            .map(|entry| *entry.key())
            .collect();

        for id in &expired {
            if self.abort(*id, "ttl").is_some() {
                tracing::warn!(error = %InterceptError::SessionTimeout(*id), "Session aborted");
            }
        }

        // Tombstones outlive nothing: drop those whose connection is gone.
        self.tombstones
            .retain(|_, connection| self.queues.contains_key(connection));
        self.queues.retain(|_, queue| !queue.is_empty());

        expired.len()
    }

    /// Run `reap_expired` periodically until shutdown.
    pub fn spawn_reaper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(interval = ?interval, ttl = ?self.ttl, "Session reaper starting");
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = self.reap_expired();
                        if reaped > 0 {
                            tracing::info!(reaped, "Reaped expired sessions");
                        }
                    }
                    _ = shutdown.recv() => {
                        tracing::info!("Session reaper received shutdown signal, exiting loop");
                        break;
                    }
                }
            }
        })
    }

    pub fn pending_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| SessionSummary {
                id: entry.id,
                connection: entry.connection,
                peer_addr: entry.metadata.peer_addr.to_string(),
                tls: entry.metadata.tls,
                method: entry.request.method().map(str::to_string),
                target: entry.request.target().map(str::to_string),
                state: entry.state,
                age_ms: entry.created.elapsed().as_millis(),
                highlight: entry.request.annotations().highlight,
            })
            .collect();
        summaries.sort_by(|a, b| b.age_ms.cmp(&a.age_ms));
        summaries
    }

    fn pop_head(&self, connection: ConnectionId, id: CorrelationId) -> Result<(), SessionError> {
        let mut queue = self
            .queues
            .get_mut(&connection)
            .ok_or(SessionError::NoPendingRequest(connection))?;
        match queue.front().copied() {
            Some(head) if head == id => {
                queue.pop_front();
                Ok(())
            }
            Some(head) => {
                tracing::warn!(expected = %head, got = %id, connection_id = %connection, "Out-of-order response rejected");
                Err(SessionError::OutOfOrder { expected: head, got: id })
            }
            None => Err(SessionError::NoPendingRequest(connection)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Direction;
    use crate::net::connection::ConnectionMetadata;

    fn config(ttl_secs: u64, max_pending: usize) -> SessionConfig {
        SessionConfig {
            ttl_secs,
            max_pending,
            ..SessionConfig::default()
        }
    }

    fn conn() -> ConnectionContext {
        ConnectionContext::new(ConnectionMetadata {
            peer_addr: "10.0.0.1:5000".parse().unwrap(),
            tls: false,
        })
    }

    fn get(path: &str) -> Message {
        Message::parse(format!("GET {} HTTP/1.1\r\nHost: t\r\n\r\n", path).as_bytes(), Direction::Request).unwrap()
    }

    fn ok() -> Message {
        Message::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n", Direction::Response).unwrap()
    }

    #[test]
    fn test_responses_match_in_send_order() {
        let correlator = SessionCorrelator::new(&config(60, 100));
        let c = conn();
        let ids: Vec<_> = ["/1", "/2", "/3"]
            .iter()
            .map(|p| correlator.on_request(&get(p), &c).unwrap())
            .collect();

        for (i, id) in ids.iter().enumerate() {
            let expected = correlator.expected_response(c.id).unwrap();
            assert_eq!(expected.id, *id);
            let session = correlator.on_response(&ok(), expected.id).unwrap();
            assert_eq!(session.request.path(), Some(["/1", "/2", "/3"][i]));
            assert_eq!(session.state, SessionState::Complete);
        }
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn test_out_of_order_response_rejected() {
        let correlator = SessionCorrelator::new(&config(60, 100));
        let c = conn();
        let first = correlator.on_request(&get("/1"), &c).unwrap();
        let second = correlator.on_request(&get("/2"), &c).unwrap();

        let err = correlator.on_response(&ok(), second).unwrap_err();
        assert_eq!(err, SessionError::OutOfOrder { expected: first, got: second });

        // The rejected response did not disturb the queue
        assert!(correlator.on_response(&ok(), first).is_ok());
        assert!(correlator.on_response(&ok(), second).is_ok());
    }

    #[test]
    fn test_connections_are_independent() {
        let correlator = SessionCorrelator::new(&config(60, 100));
        let (a, b) = (conn(), conn());
        let id_a = correlator.on_request(&get("/a"), &a).unwrap();
        let id_b = correlator.on_request(&get("/b"), &b).unwrap();

        assert!(correlator.on_response(&ok(), id_b).is_ok());
        assert!(correlator.on_response(&ok(), id_a).is_ok());
    }

    #[test]
    fn test_dropped_request_leaves_queue() {
        let correlator = SessionCorrelator::new(&config(60, 100));
        let c = conn();
        let dropped = correlator.on_request(&get("/drop"), &c).unwrap();
        let kept = correlator.on_request(&get("/keep"), &c).unwrap();

        let session = correlator.drop_request(dropped).unwrap();
        assert_eq!(session.state, SessionState::Aborted);
        assert_eq!(correlator.expected_response(c.id).unwrap().id, kept);
    }

    #[test]
    fn test_ttl_abort_consumes_late_response() {
        let correlator = SessionCorrelator::new(&config(0, 100));
        let c = conn();
        let stale = correlator.on_request(&get("/slow"), &c).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(correlator.reap_expired(), 1);
        assert_eq!(correlator.pending_count(), 0);

        let next = correlator.on_request(&get("/next"), &c).unwrap();
        let expected = correlator.expected_response(c.id).unwrap();
        assert_eq!(expected.id, stale);
        assert!(expected.aborted);
        assert_eq!(correlator.on_response(&ok(), stale).unwrap_err(), SessionError::Aborted(stale));

        // The next response goes to the next request
        assert_eq!(correlator.expected_response(c.id).unwrap().id, next);
    }

    #[test]
    fn test_held_session_is_not_reaped() {
        let correlator = SessionCorrelator::new(&config(0, 100));
        let c = conn();
        let id = correlator.on_request(&get("/review"), &c).unwrap();
        correlator.hold(id);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(correlator.reap_expired(), 0);

        // Release restarts the clock; the session expires only afterwards.
        assert!(correlator.release_hold(id));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(correlator.reap_expired(), 1);
    }

    #[test]
    fn test_dropping_aborted_unsent_request_frees_queue_slot() {
        let correlator = SessionCorrelator::new(&config(60, 100));
        let c = conn();
        let stale = correlator.on_request(&get("/stale"), &c).unwrap();
        let next = correlator.on_request(&get("/next"), &c).unwrap();
        correlator.abort(stale, "ttl").unwrap();
        assert!(!correlator.release_hold(stale));

        assert!(correlator.drop_request(stale).is_none());
        let expected = correlator.expected_response(c.id).unwrap();
        assert_eq!(expected.id, next);
        assert!(!expected.aborted);
    }

    #[test]
    fn test_close_connection_releases_sessions() {
        let correlator = SessionCorrelator::new(&config(60, 100));
        let c = conn();
        correlator.on_request(&get("/1"), &c).unwrap();
        correlator.on_request(&get("/2"), &c).unwrap();

        assert_eq!(correlator.close_connection(c.id), 2);
        assert_eq!(correlator.pending_count(), 0);
        assert!(correlator.expected_response(c.id).is_none());
    }

    #[test]
    fn test_capacity_bound() {
        let correlator = SessionCorrelator::new(&config(60, 2));
        let c = conn();
        correlator.on_request(&get("/1"), &c).unwrap();
        correlator.on_request(&get("/2"), &c).unwrap();
        assert_eq!(
            correlator.on_request(&get("/3"), &c).unwrap_err(),
            SessionError::Capacity(2)
        );
    }

    #[test]
    fn test_unknown_session() {
        let correlator = SessionCorrelator::new(&config(60, 10));
        let id = CorrelationId::new();
        assert_eq!(correlator.on_response(&ok(), id).unwrap_err(), SessionError::Unknown(id));
    }
}
