use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;

use crate::admin::AdminState;
use crate::config::RuleConfig;
use crate::dispatch::{HeldEvent, HoldId, ObserverDecision};
use crate::rules::{RuleId, RuleInfo};
use crate::session::SessionSummary;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub rules: usize,
    pub pending_sessions: usize,
    pub pending_holds: usize,
    pub observers: usize,
    pub active_connections: u64,
    pub highlight_seen: usize,
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let pipeline = &state.pipeline;
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        uptime_secs: state.started.elapsed().as_secs(),
        rules: pipeline.rules().len(),
        pending_sessions: pipeline.sessions().pending_count(),
        pending_holds: pipeline.dispatcher().pending_count(),
        observers: pipeline.dispatcher().observer_count(),
        active_connections: state.connections.active_count(),
        highlight_seen: pipeline.highlighter().seen_count(),
    })
}

pub async fn list_sessions(State(state): State<AdminState>) -> Json<Vec<SessionSummary>> {
    Json(state.pipeline.sessions().summaries())
}

pub async fn list_rules(State(state): State<AdminState>) -> Json<Vec<RuleInfo>> {
    Json(state.pipeline.rules().list())
}

pub async fn add_rule(State(state): State<AdminState>, Json(config): Json<RuleConfig>) -> Response {
    match state.pipeline.rules().add(&config) {
        Ok(id) => {
            tracing::info!(rule_id = %id, rule = %config.name, "Rule added via admin API");
            (StatusCode::CREATED, Json(json!({ "id": id }))).into_response()
        }
        Err(e) => error(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

pub async fn remove_rule(State(state): State<AdminState>, Path(id): Path<u64>) -> StatusCode {
    if state.pipeline.rules().remove(RuleId::from(id)) {
        tracing::info!(rule_id = id, "Rule removed via admin API");
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

pub async fn enable_rule(State(state): State<AdminState>, Path(id): Path<u64>) -> Response {
    toggle_rule(&state, id, true)
}

pub async fn disable_rule(State(state): State<AdminState>, Path(id): Path<u64>) -> Response {
    toggle_rule(&state, id, false)
}

fn toggle_rule(state: &AdminState, id: u64, enabled: bool) -> Response {
    let rules = state.pipeline.rules();
    if !rules.set_enabled(RuleId::from(id), enabled) {
        return error(StatusCode::NOT_FOUND, format!("no rule {}", id));
    }
    match rules.get(RuleId::from(id)) {
        Some(info) => Json(info).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

pub async fn list_holds(State(state): State<AdminState>) -> Json<Vec<HeldEvent>> {
    Json(state.pipeline.dispatcher().pending())
}

pub async fn decide_hold(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(decision): Json<ObserverDecision>,
) -> Response {
    let Ok(hold_id) = id.parse::<HoldId>() else {
        return error(StatusCode::BAD_REQUEST, format!("invalid hold id {:?}", id));
    };
    let ack = state.pipeline.dispatcher().decide(hold_id, decision);
    Json(json!({ "status": ack })).into_response()
}

pub async fn reset_highlight(State(state): State<AdminState>) -> Json<serde_json::Value> {
    let cleared = state.pipeline.highlighter().reset();
    Json(json!({ "cleared": cleared }))
}

/// Push every dispatch event to a WebSocket observer. Decisions go through
/// `POST /admin/holds/{id}/decision`, or can be sent on the socket as
/// `{"hold_id": ..., "decision": {...}}`.
pub async fn events(State(state): State<AdminState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| stream_events(socket, state))
}

#[derive(serde::Deserialize)]
struct SocketDecision {
    hold_id: HoldId,
    decision: ObserverDecision,
}

async fn stream_events(mut socket: WebSocket, state: AdminState) {
    let dispatcher = state.pipeline.dispatcher();
    let mut subscription = dispatcher.subscribe();
    tracing::info!(subscriber = subscription.id(), "WebSocket observer connected");

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to encode dispatch event");
                        continue;
                    }
                };
                if socket.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        let reply = match serde_json::from_str::<SocketDecision>(text.as_str()) {
                            Ok(SocketDecision { hold_id, decision }) => {
                                json!({ "hold_id": hold_id, "ack": dispatcher.decide(hold_id, decision) })
                            }
                            Err(e) => json!({ "error": e.to_string() }),
                        };
                        if socket.send(WsMessage::Text(reply.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    tracing::info!(subscriber = subscription.id(), "WebSocket observer disconnected");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::admin::{setup_admin_router, AdminState};
    use crate::config::InterceptorConfig;
    use crate::net::connection::ConnectionTracker;
    use crate::pipeline::Pipeline;

    fn state() -> AdminState {
        let pipeline = Pipeline::new(&InterceptorConfig::default()).unwrap();
        AdminState::new(Arc::new(pipeline), ConnectionTracker::new(), "secret")
    }

    fn get(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_requires_bearer_token() {
        let app = setup_admin_router(state());
        let response = app.clone().oneshot(get("/admin/status", None)).await.unwrap();
        assert_eq!(response.status(), 401);

        let response = app.clone().oneshot(get("/admin/status", Some("wrong"))).await.unwrap();
        assert_eq!(response.status(), 401);

        let response = app.oneshot(get("/admin/status", Some("secret"))).await.unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn test_unknown_hold_is_acknowledged_as_resolved() {
        let app = setup_admin_router(state());
        let request = Request::builder()
            .method("POST")
            .uri(format!("/admin/holds/{}/decision", crate::dispatch::HoldId::new()))
            .header("Authorization", "Bearer secret")
            .header("Content-Type", "application/json")
            .body(Body::from(r#"{"type":"forward"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), 200);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "already_resolved");
    }
}
