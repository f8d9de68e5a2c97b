//! Request/response processing from raw bytes to a [`Decision`].

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::config::{DropConfig, DropMode, HoldConfig, HoldPolicy, InterceptorConfig};
use crate::dispatch::{EventDispatcher, HoldOrigin, HoldOutcome, ObserverDecision};
use crate::error::InterceptError;
use crate::highlight::DuplicateHighlighter;
use crate::message::model::try_encode_latin1;
use crate::message::parse::{self, ParseOptions};
use crate::message::{Direction, MalformedMessage, Message, StartLine};
use crate::net::connection::ConnectionContext;
use crate::observability::metrics;
use crate::pipeline::state::{Decision, MessageState, StateTracker};
use crate::rules::{apply_edits, compile_edits, RuleEngine, RuleError, RuleId, RuleOutcome};
use crate::session::{CorrelationId, SessionCorrelator, SessionError, SessionView};

/// Policies that can change on config reload.
#[derive(Debug, Clone, Default)]
pub struct PipelineSettings {
    pub hold: HoldConfig,
    pub drop: DropConfig,
}

impl PipelineSettings {
    pub fn from_config(config: &InterceptorConfig) -> Self {
        Self {
            hold: config.hold.clone(),
            drop: config.drop.clone(),
        }
    }
}

/// How a hold ended, reduced to what the pipeline does next.
enum Resolution {
    Forward(Message, MessageState),
    Drop,
    /// Observer supplied bytes that do not parse.
    Malformed(MalformedMessage),
    Cancelled,
}

/// Drives each message through normalization, rules, holds and correlation.
pub struct Pipeline {
    rules: Arc<RuleEngine>,
    sessions: Arc<SessionCorrelator>,
    dispatcher: Arc<EventDispatcher>,
    highlighter: Arc<DuplicateHighlighter>,
    settings: ArcSwap<PipelineSettings>,
}

impl Pipeline {
    /// Build every component from configuration.
    pub fn new(config: &InterceptorConfig) -> Result<Self, RuleError> {
        Ok(Self::from_parts(
            Arc::new(RuleEngine::from_config(&config.rules)?),
            Arc::new(SessionCorrelator::new(&config.sessions)),
            Arc::new(EventDispatcher::new(Duration::from_millis(config.hold.timeout_ms))),
            Arc::new(DuplicateHighlighter::new(config.highlight.clone())),
            PipelineSettings::from_config(config),
        ))
    }

    pub fn from_parts(
        rules: Arc<RuleEngine>,
        sessions: Arc<SessionCorrelator>,
        dispatcher: Arc<EventDispatcher>,
        highlighter: Arc<DuplicateHighlighter>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            rules,
            sessions,
            dispatcher,
            highlighter,
            settings: ArcSwap::from_pointee(settings),
        }
    }

    pub fn rules(&self) -> &Arc<RuleEngine> {
        &self.rules
    }

    pub fn sessions(&self) -> &Arc<SessionCorrelator> {
        &self.sessions
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn highlighter(&self) -> &Arc<DuplicateHighlighter> {
        &self.highlighter
    }

    pub fn settings(&self) -> Arc<PipelineSettings> {
        self.settings.load_full()
    }

    /// Apply a reloaded configuration. Rules are replaced wholesale; if they
    /// fail to compile nothing changes.
    pub fn apply_config(&self, config: &InterceptorConfig) -> Result<(), RuleError> {
        self.rules.replace_all(&config.rules)?;
        self.settings.store(Arc::new(PipelineSettings::from_config(config)));
        self.dispatcher
            .set_timeout(Duration::from_millis(config.hold.timeout_ms));
        self.highlighter.update(config.highlight.clone());
        tracing::info!(rules = config.rules.len(), "Pipeline configuration applied");
        Ok(())
    }

    /// Process one complete message received on `conn`.
    pub async fn process(&self, raw: &[u8], direction: Direction, conn: &ConnectionContext) -> Decision {
        let decision = match direction {
            Direction::Request => self.process_request(raw, conn).await,
            Direction::Response => self.process_response(raw, conn).await,
        };
        metrics::record_message(direction.as_str(), decision.as_str());
        decision
    }

    /// Release everything owned by a closed connection.
    pub fn connection_closed(&self, conn: &ConnectionContext) {
        conn.closed.cancel();
        self.sessions.close_connection(conn.id);
    }

    async fn process_request(&self, raw: &[u8], conn: &ConnectionContext) -> Decision {
        let mut state = StateTracker::new();

        let original = match Message::parse(raw, Direction::Request) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(connection_id = %conn.id, error = %InterceptError::Malformed(e), "Unparseable request, aborting connection");
                advance(&mut state, MessageState::Aborted);
                return Decision::AbortConnection;
            }
        };
        advance(&mut state, MessageState::Normalized);

        let message = self.highlighter.apply(original.clone(), conn.metadata.tls);
        let id = match self.sessions.on_request(&message, conn) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(connection_id = %conn.id, error = %InterceptError::Session(e), "Request refused");
                advance(&mut state, MessageState::Dropped);
                advance(&mut state, MessageState::Delivered);
                return Decision::Drop {
                    reply: synthesize_reply(503, "session table full"),
                };
            }
        };
        let message = message.with_correlation_id(id);

        let view = SessionView {
            metadata: &conn.metadata,
            request: None,
        };
        let evaluation = self.rules.evaluate(&message, &view);
        advance(&mut state, MessageState::RuleEvaluated);
        tracing::debug!(
            connection_id = %conn.id,
            correlation_id = %id,
            method = message.method().unwrap_or(""),
            target = message.target().unwrap_or(""),
            outcome = evaluation.outcome.as_str(),
            matched = evaluation.matched.len(),
            faults = evaluation.faults.len(),
            "Request evaluated"
        );

        let (message, via) = match evaluation.outcome {
            RuleOutcome::Forward => (evaluation.message, MessageState::AutoForwarded),
            RuleOutcome::Drop { rule } => {
                tracing::info!(connection_id = %conn.id, correlation_id = %id, rule_id = %rule, "Request dropped by rule");
                return self.drop_request(&mut state, id);
            }
            RuleOutcome::Hold { rule } => {
                advance(&mut state, MessageState::Held);
                self.sessions.hold(id);
                match self.hold(evaluation.message, conn, Some(id), rule).await {
                    Resolution::Forward(message, via) => {
                        if !self.sessions.release_hold(id) {
                            tracing::warn!(connection_id = %conn.id, correlation_id = %id, "Session ended while held, request not sent");
                            return self.drop_request(&mut state, id);
                        }
                        (message, via)
                    }
                    Resolution::Drop => return self.drop_request(&mut state, id),
                    Resolution::Malformed(e) => {
                        tracing::warn!(connection_id = %conn.id, correlation_id = %id, error = %e, "Observer replacement is malformed, aborting connection");
                        self.sessions.drop_request(id);
                        advance(&mut state, MessageState::Aborted);
                        return Decision::AbortConnection;
                    }
                    Resolution::Cancelled => {
                        self.sessions.drop_request(id);
                        advance(&mut state, MessageState::Aborted);
                        return Decision::AbortConnection;
                    }
                }
            }
        };
        advance(&mut state, via);

        if let Err(e) = message.check_framing() {
            tracing::warn!(connection_id = %conn.id, correlation_id = %id, error = %e, "Request framing inconsistent after edits, aborting connection");
            self.sessions.drop_request(id);
            advance(&mut state, MessageState::Aborted);
            return Decision::AbortConnection;
        }

        let modified = message.wire_differs(&original);
        if modified {
            self.sessions.update_request(id, &message);
        }
        advance(&mut state, MessageState::Delivered);
        Decision::Forward { message, modified }
    }

    async fn process_response(&self, raw: &[u8], conn: &ConnectionContext) -> Decision {
        let mut state = StateTracker::new();

        let Some(expected) = self.sessions.expected_response(conn.id) else {
            tracing::warn!(connection_id = %conn.id, "Response without a pending request suppressed");
            advance(&mut state, MessageState::Aborted);
            return Decision::Drop { reply: None };
        };
        let id = expected.id;

        let options = ParseOptions {
            no_body: expected
                .request
                .as_ref()
                .and_then(|r| r.method())
                .map(|m| m.eq_ignore_ascii_case("HEAD"))
                .unwrap_or(false),
        };
        let original = match parse::parse(raw, Direction::Response, options) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(connection_id = %conn.id, correlation_id = %id, error = %InterceptError::Malformed(e), "Unparseable response");
                let _ = self.sessions.discard_response(id, "malformed_response");
                advance(&mut state, MessageState::Aborted);
                if expected.aborted {
                    return Decision::Drop { reply: None };
                }
                return Decision::Drop {
                    reply: synthesize_reply(502, "upstream sent an invalid response"),
                };
            }
        };

        // Interim responses precede the final one and leave the session open.
        if matches!(original.status(), Some(status) if (100..200).contains(&status) && status != 101) {
            advance(&mut state, MessageState::Normalized);
            advance(&mut state, MessageState::RuleEvaluated);
            advance(&mut state, MessageState::AutoForwarded);
            advance(&mut state, MessageState::Delivered);
            return Decision::Forward {
                message: original.with_correlation_id(id),
                modified: false,
            };
        }

        if expected.aborted {
            tracing::debug!(connection_id = %conn.id, correlation_id = %id, "Response for aborted session suppressed");
            let _ = self.sessions.discard_response(id, "aborted");
            advance(&mut state, MessageState::Normalized);
            advance(&mut state, MessageState::Dropped);
            return Decision::Drop { reply: None };
        }
        advance(&mut state, MessageState::Normalized);

        let mut message = original.clone().with_correlation_id(id);
        if let Some(color) = expected.request.as_ref().and_then(|r| r.annotations().highlight) {
            message = message.with_highlight(Some(color));
        }

        let view = SessionView {
            metadata: &conn.metadata,
            request: expected.request.as_ref(),
        };
        let evaluation = self.rules.evaluate(&message, &view);
        advance(&mut state, MessageState::RuleEvaluated);
        tracing::debug!(
            connection_id = %conn.id,
            correlation_id = %id,
            status = message.status().unwrap_or(0),
            outcome = evaluation.outcome.as_str(),
            matched = evaluation.matched.len(),
            faults = evaluation.faults.len(),
            "Response evaluated"
        );

        let (message, via) = match evaluation.outcome {
            RuleOutcome::Forward => (evaluation.message, MessageState::AutoForwarded),
            RuleOutcome::Drop { rule } => {
                tracing::info!(connection_id = %conn.id, correlation_id = %id, rule_id = %rule, "Response dropped by rule");
                return self.drop_response(&mut state, id);
            }
            RuleOutcome::Hold { rule } => {
                advance(&mut state, MessageState::Held);
                self.sessions.hold(id);
                match self.hold(evaluation.message, conn, Some(id), rule).await {
                    Resolution::Forward(message, via) => (message, via),
                    Resolution::Drop => return self.drop_response(&mut state, id),
                    Resolution::Malformed(e) => {
                        tracing::warn!(connection_id = %conn.id, correlation_id = %id, error = %e, "Observer replacement is malformed");
                        let _ = self.sessions.discard_response(id, "malformed_response");
                        advance(&mut state, MessageState::Aborted);
                        return Decision::Drop {
                            reply: synthesize_reply(502, "replacement response is invalid"),
                        };
                    }
                    Resolution::Cancelled => {
                        advance(&mut state, MessageState::Aborted);
                        return Decision::AbortConnection;
                    }
                }
            }
        };
        advance(&mut state, via);

        if let Err(e) = message.check_framing() {
            tracing::warn!(connection_id = %conn.id, correlation_id = %id, error = %e, "Response framing inconsistent after edits");
            let _ = self.sessions.discard_response(id, "malformed_response");
            advance(&mut state, MessageState::Aborted);
            return Decision::Drop {
                reply: synthesize_reply(502, "response could not be re-framed"),
            };
        }

        match self.sessions.on_response(&message, id) {
            Ok(_) => {}
            Err(SessionError::Aborted(_)) | Err(SessionError::Unknown(_)) => {
                // Expired or its connection closed while held.
                tracing::debug!(connection_id = %conn.id, correlation_id = %id, "Session gone before release, response suppressed");
                advance(&mut state, MessageState::Dropped);
                return Decision::Drop { reply: None };
            }
            Err(e) => {
                tracing::warn!(connection_id = %conn.id, correlation_id = %id, error = %e, "Response rejected by correlator");
                advance(&mut state, MessageState::Aborted);
                return Decision::AbortConnection;
            }
        }

        let modified = message.wire_differs(&original);
        advance(&mut state, MessageState::Delivered);
        Decision::Forward { message, modified }
    }

    /// Hand a message to observers and turn their answer (or its absence)
    /// into the next step.
    async fn hold(
        &self,
        message: Message,
        conn: &ConnectionContext,
        correlation_id: Option<CorrelationId>,
        rule: RuleId,
    ) -> Resolution {
        let origin = HoldOrigin {
            connection: conn.id,
            correlation_id,
            rule: Some(rule),
        };
        let outcome = self.dispatcher.notify_held(&message, origin, &conn.closed).await;
        let timed_out = outcome == HoldOutcome::TimedOut;

        match outcome {
            HoldOutcome::Decided(ObserverDecision::Forward) => Resolution::Forward(message, MessageState::Released),
            HoldOutcome::Decided(ObserverDecision::Drop) => Resolution::Drop,
            HoldOutcome::Decided(ObserverDecision::Modify { edits }) => {
                let applied = compile_edits(&edits)
                    .map_err(|e| e.to_string())
                    .and_then(|edits| apply_edits(&message, &edits).map_err(|e| e.to_string()));
                match applied {
                    Ok(edited) => Resolution::Forward(edited, MessageState::Released),
                    Err(e) => {
                        tracing::warn!(connection_id = %conn.id, error = %e, "Observer edits rejected, releasing message as held");
                        Resolution::Forward(message, MessageState::Released)
                    }
                }
            }
            HoldOutcome::Decided(ObserverDecision::Replace { raw }) => match replace(&message, &raw) {
                Ok(replacement) => Resolution::Forward(replacement, MessageState::Released),
                Err(e) => Resolution::Malformed(e),
            },
            HoldOutcome::TimedOut | HoldOutcome::NoObserver => {
                let policy = self.settings.load().hold.default_policy;
                let reason = if timed_out {
                    InterceptError::HoldTimeout(self.dispatcher.timeout())
                } else {
                    InterceptError::ObserverDisconnected
                };
                tracing::warn!(connection_id = %conn.id, error = %reason, policy = ?policy, "Applying default hold policy");
                match policy {
                    HoldPolicy::Forward => Resolution::Forward(message, MessageState::AutoForwarded),
                    HoldPolicy::Drop => Resolution::Drop,
                }
            }
            HoldOutcome::Cancelled => Resolution::Cancelled,
        }
    }

    fn drop_request(&self, state: &mut StateTracker, id: CorrelationId) -> Decision {
        self.sessions.drop_request(id);
        advance(state, MessageState::Dropped);
        advance(state, MessageState::Delivered);
        Decision::Drop {
            reply: self.drop_reply(),
        }
    }

    fn drop_response(&self, state: &mut StateTracker, id: CorrelationId) -> Decision {
        let _ = self.sessions.discard_response(id, "dropped");
        advance(state, MessageState::Dropped);
        advance(state, MessageState::Delivered);
        Decision::Drop {
            reply: self.drop_reply(),
        }
    }

    fn drop_reply(&self) -> Option<Message> {
        let settings = self.settings.load();
        match settings.drop.mode {
            DropMode::Reject => synthesize_reply(settings.drop.status, "blocked by interception rule"),
            DropMode::Close => None,
        }
    }
}

/// Parse observer-supplied replacement bytes, keeping correlation and annotations.
fn replace(current: &Message, raw: &str) -> Result<Message, MalformedMessage> {
    let bytes = try_encode_latin1(raw)
        .ok_or_else(|| MalformedMessage::InvalidField("replacement contains characters above U+00FF".into()))?;
    let mut replacement = Message::parse(&bytes, current.direction())?.with_highlight(current.annotations().highlight);
    if let Some(id) = current.correlation_id() {
        replacement = replacement.with_correlation_id(id);
    }
    Ok(replacement)
}

/// A minimal `text/plain` response that closes the connection.
pub fn synthesize_reply(status: u16, text: &str) -> Option<Message> {
    let build = || -> Result<Message, MalformedMessage> {
        let reply = Message::new(StartLine::response(status, reason_phrase(status)))?
            .with_header("Content-Type", "text/plain; charset=utf-8")?
            .with_header("Connection", "close")?
            .with_body(format!("{}\n", text));
        Ok(reply)
    };
    match build() {
        Ok(reply) => Some(reply),
        Err(e) => {
            tracing::error!(status, error = %e, "Failed to build reply, closing instead");
            None
        }
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        429 => "Too Many Requests",
        451 => "Unavailable For Legal Reasons",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Blocked",
    }
}

fn advance(state: &mut StateTracker, next: MessageState) {
    let from = state.current();
    match state.advance(next) {
        Ok(()) => tracing::trace!(from = %from, to = %next, "Message state"),
        Err(e) => tracing::error!(error = %e, "Pipeline state machine violated"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleConfig;
    use crate::dispatch::DispatchEvent;
    use crate::net::connection::ConnectionMetadata;
    use crate::rules::{ActionConfig, EditConfig, PredicateConfig, RuleTarget};

    fn conn() -> ConnectionContext {
        ConnectionContext::new(ConnectionMetadata {
            peer_addr: "127.0.0.1:9000".parse().unwrap(),
            tls: false,
        })
    }

    fn rule(name: &str, target: RuleTarget, predicate: PredicateConfig, action: ActionConfig) -> RuleConfig {
        RuleConfig {
            name: name.into(),
            priority: 0,
            enabled: true,
            target,
            predicate,
            action,
        }
    }

    fn pipeline_with(rules: Vec<RuleConfig>) -> Pipeline {
        let config = InterceptorConfig {
            rules,
            ..InterceptorConfig::default()
        };
        Pipeline::new(&config).unwrap()
    }

    const GET_A: &[u8] = b"GET /a HTTP/1.1\r\nHost: origin.test\r\n\r\n";
    const OK: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";

    #[tokio::test]
    async fn test_unmodified_forward_is_byte_identical() {
        let pipeline = pipeline_with(vec![]);
        let conn = conn();

        match pipeline.process(GET_A, Direction::Request, &conn).await {
            Decision::Forward { message, modified } => {
                assert!(!modified);
                assert_eq!(message.serialize().as_ref(), GET_A);
            }
            other => panic!("unexpected {:?}", other),
        }
        match pipeline.process(OK, Direction::Response, &conn).await {
            Decision::Forward { message, modified } => {
                assert!(!modified);
                assert_eq!(message.serialize().as_ref(), OK);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(pipeline.sessions().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_rule_rejects_and_releases_session() {
        let pipeline = pipeline_with(vec![rule(
            "block-a",
            RuleTarget::Request,
            PredicateConfig::PathPrefix { prefix: "/a".into() },
            ActionConfig::Drop,
        )]);
        let conn = conn();

        match pipeline.process(GET_A, Direction::Request, &conn).await {
            Decision::Drop { reply: Some(reply) } => assert_eq!(reply.status(), Some(403)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(pipeline.sessions().pending_count(), 0);
        assert!(pipeline.sessions().expected_response(conn.id).is_none());
    }

    #[tokio::test]
    async fn test_close_mode_drop() {
        let config = InterceptorConfig {
            drop: DropConfig {
                mode: DropMode::Close,
                status: 403,
            },
            rules: vec![rule("all", RuleTarget::Request, PredicateConfig::Any, ActionConfig::Drop)],
            ..InterceptorConfig::default()
        };
        let pipeline = Pipeline::new(&config).unwrap();
        let decision = pipeline.process(GET_A, Direction::Request, &conn()).await;
        assert_eq!(decision, Decision::Drop { reply: None });
    }

    #[tokio::test]
    async fn test_malformed_request_aborts() {
        let pipeline = pipeline_with(vec![]);
        let raw = b"GET /a HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\nx";
        let decision = pipeline.process(raw, Direction::Request, &conn()).await;
        assert_eq!(decision, Decision::AbortConnection);
    }

    #[tokio::test]
    async fn test_malformed_response_gets_502() {
        let pipeline = pipeline_with(vec![]);
        let conn = conn();
        pipeline.process(GET_A, Direction::Request, &conn).await;

        let decision = pipeline
            .process(b"HTTP/1.1 abc Nope\r\n\r\n", Direction::Response, &conn)
            .await;
        match decision {
            Decision::Drop { reply: Some(reply) } => assert_eq!(reply.status(), Some(502)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(pipeline.sessions().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_modify_rule_recomputes_length() {
        let pipeline = pipeline_with(vec![rule(
            "rewrite",
            RuleTarget::Response,
            PredicateConfig::Any,
            ActionConfig::Modify {
                edits: vec![EditConfig::ReplaceBody {
                    body: "rewritten".into(),
                }],
                stop: false,
            },
        )]);
        let conn = conn();
        pipeline.process(GET_A, Direction::Request, &conn).await;

        match pipeline.process(OK, Direction::Response, &conn).await {
            Decision::Forward { message, modified } => {
                assert!(modified);
                assert_eq!(message.header("content-length"), Some("9"));
                assert_eq!(message.body().as_ref(), b"rewritten");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_interim_response_keeps_session() {
        let pipeline = pipeline_with(vec![]);
        let conn = conn();
        pipeline.process(GET_A, Direction::Request, &conn).await;

        let interim = pipeline
            .process(b"HTTP/1.1 100 Continue\r\n\r\n", Direction::Response, &conn)
            .await;
        assert!(matches!(interim, Decision::Forward { .. }));
        assert_eq!(pipeline.sessions().pending_count(), 1);

        let final_resp = pipeline.process(OK, Direction::Response, &conn).await;
        assert!(matches!(final_resp, Decision::Forward { .. }));
        assert_eq!(pipeline.sessions().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_head_response_has_no_body() {
        let pipeline = pipeline_with(vec![]);
        let conn = conn();
        pipeline
            .process(b"HEAD /a HTTP/1.1\r\nHost: x\r\n\r\n", Direction::Request, &conn)
            .await;
        let decision = pipeline
            .process(b"HTTP/1.1 200 OK\r\nContent-Length: 1234\r\n\r\n", Direction::Response, &conn)
            .await;
        assert!(matches!(decision, Decision::Forward { .. }));
    }

    #[tokio::test]
    async fn test_response_without_request_is_suppressed() {
        let pipeline = pipeline_with(vec![]);
        let decision = pipeline.process(OK, Direction::Response, &conn()).await;
        assert_eq!(decision, Decision::Drop { reply: None });
    }

    #[tokio::test]
    async fn test_observer_modify_decision() {
        let pipeline = Arc::new(pipeline_with(vec![rule(
            "hold-all",
            RuleTarget::Request,
            PredicateConfig::Any,
            ActionConfig::Hold,
        )]));
        let mut sub = pipeline.dispatcher().subscribe();
        let conn = conn();

        let task = {
            let pipeline = Arc::clone(&pipeline);
            let conn = conn.clone();
            tokio::spawn(async move { pipeline.process(GET_A, Direction::Request, &conn).await })
        };

        let held = loop {
            if let Some(DispatchEvent::Held(event)) = sub.recv().await {
                break event;
            }
        };
        assert!(held.correlation_id.is_some());
        pipeline.dispatcher().decide(
            held.hold_id,
            ObserverDecision::Modify {
                edits: vec![EditConfig::SetHeader {
                    name: "X-Reviewed".into(),
                    value: "yes".into(),
                }],
            },
        );

        match task.await.unwrap() {
            Decision::Forward { message, modified } => {
                assert!(modified);
                assert_eq!(message.header("x-reviewed"), Some("yes"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    fn spawn_held_request(pipeline: &Arc<Pipeline>, conn: &ConnectionContext) -> tokio::task::JoinHandle<Decision> {
        let pipeline = Arc::clone(pipeline);
        let conn = conn.clone();
        tokio::spawn(async move { pipeline.process(GET_A, Direction::Request, &conn).await })
    }

    async fn next_held(sub: &mut crate::dispatch::Subscription) -> crate::dispatch::HeldEvent {
        loop {
            if let Some(DispatchEvent::Held(event)) = sub.recv().await {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_held_request_outlives_session_ttl() {
        let mut config = InterceptorConfig {
            rules: vec![rule("hold-all", RuleTarget::Request, PredicateConfig::Any, ActionConfig::Hold)],
            ..InterceptorConfig::default()
        };
        config.sessions.ttl_secs = 0;
        let pipeline = Arc::new(Pipeline::new(&config).unwrap());
        let mut sub = pipeline.dispatcher().subscribe();
        let conn = conn();

        let task = spawn_held_request(&pipeline, &conn);
        let held = next_held(&mut sub).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(pipeline.sessions().reap_expired(), 0);

        pipeline.dispatcher().decide(held.hold_id, ObserverDecision::Forward);
        assert!(matches!(task.await.unwrap(), Decision::Forward { .. }));
        match pipeline.process(OK, Direction::Response, &conn).await {
            Decision::Forward { message, .. } => assert_eq!(message.status(), Some(200)),
            other => panic!("response lost: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_whose_session_ended_while_held_is_not_sent() {
        let pipeline = Arc::new(pipeline_with(vec![rule(
            "hold-all",
            RuleTarget::Request,
            PredicateConfig::Any,
            ActionConfig::Hold,
        )]));
        let mut sub = pipeline.dispatcher().subscribe();
        let conn = conn();

        let task = spawn_held_request(&pipeline, &conn);
        let held = next_held(&mut sub).await;
        let id = held.correlation_id.unwrap();
        pipeline.sessions().abort(id, "ttl").unwrap();

        pipeline.dispatcher().decide(held.hold_id, ObserverDecision::Forward);
        match task.await.unwrap() {
            Decision::Drop { reply: Some(reply) } => assert_eq!(reply.status(), Some(403)),
            other => panic!("expected rejection, got {:?}", other),
        }
        assert!(pipeline.sessions().expected_response(conn.id).is_none());
    }

    #[tokio::test]
    async fn test_hold_without_observer_uses_default_policy() {
        let mut config = InterceptorConfig {
            rules: vec![rule("hold-all", RuleTarget::Request, PredicateConfig::Any, ActionConfig::Hold)],
            ..InterceptorConfig::default()
        };
        let pipeline = Pipeline::new(&config).unwrap();
        let decision = pipeline.process(GET_A, Direction::Request, &conn()).await;
        assert!(matches!(decision, Decision::Forward { modified: false, .. }));

        config.hold.default_policy = HoldPolicy::Drop;
        pipeline.apply_config(&config).unwrap();
        let decision = pipeline.process(GET_A, Direction::Request, &conn()).await;
        assert!(matches!(decision, Decision::Drop { .. }));
    }

    #[tokio::test]
    async fn test_highlight_annotates_without_touching_wire() {
        let pipeline = pipeline_with(vec![]);
        let conn = conn();
        let first = pipeline.process(GET_A, Direction::Request, &conn).await;
        let second = pipeline.process(GET_A, Direction::Request, &conn).await;

        let color = |d: &Decision| match d {
            Decision::Forward { message, modified } => {
                assert!(!modified);
                message.annotations().highlight
            }
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(color(&first), Some(crate::message::HighlightColor::Cyan));
        assert_eq!(color(&second), Some(crate::message::HighlightColor::Gray));
    }
}
