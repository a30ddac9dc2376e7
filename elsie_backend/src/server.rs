use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::EngineConfig;
use crate::dispatch::{Dispatcher, ResponseRequest};
use crate::journal::{DecisionJournal, DecisionRecord, TransitionRecord};
use crate::roleplay::{
    EngagementBinding, EngineEvent, IncomingMessage, MessageOutcome, RoleplayEngine, Session,
};
use crate::runtime::BackendRuntime;

const DEFAULT_BIND: &str = "127.0.0.1:8790";

#[derive(Clone)]
pub struct ServerState {
    pub engine: Arc<RoleplayEngine>,
    pub journal: Arc<DecisionJournal>,
    pub dispatcher: Dispatcher,
    pub auth: BackendAuthConfig,
    pub config: Arc<tokio::sync::RwLock<EngineConfig>>,
    pub ws_events: broadcast::Sender<ApiEventEnvelope>,
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

impl BackendAuthConfig {
    pub fn required(token: &str) -> Self {
        Self {
            mode: AuthMode::Required,
            token: Some(token.to_string()),
        }
    }

    pub fn disabled() -> Self {
        Self {
            mode: AuthMode::Disabled,
            token: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEventEnvelope {
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChannelHistoryQuery {
    channel: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionsResponse {
    pub engaged: Option<EngagementBinding>,
    pub sessions: Vec<Session>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SweepResponse {
    pub closed: usize,
}

pub async fn serve_backend(
    runtime: BackendRuntime,
    event_rx: flume::Receiver<EngineEvent>,
) -> Result<()> {
    let bind_addr = std::env::var("ELSIE_BACKEND_BIND")
        .unwrap_or_else(|_| DEFAULT_BIND.to_string())
        .parse::<SocketAddr>()
        .context("Invalid ELSIE_BACKEND_BIND (expected host:port)")?;

    let auth = load_auth_config()?;

    let journal = runtime
        .journal
        .clone()
        .ok_or_else(|| anyhow!("Decision journal unavailable"))?;
    let (ws_events, _) = broadcast::channel(512);

    let state = Arc::new(ServerState {
        engine: runtime.engine.clone(),
        journal: journal.clone(),
        dispatcher: runtime.dispatcher.clone(),
        auth,
        config: Arc::new(tokio::sync::RwLock::new(runtime.config.clone())),
        ws_events: ws_events.clone(),
    });

    spawn_event_bridge(event_rx, journal, ws_events.clone());
    spawn_response_bridge(runtime.responses.subscribe(), ws_events);
    runtime.spawn_sweeper();

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Elsie backend listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Backend server failed")?;
    Ok(())
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/config", get(get_config))
        .route("/messages", post(post_message))
        .route("/sessions", get(list_sessions))
        .route("/sessions/sweep", post(sweep_sessions))
        .route("/sessions/:key", get(get_session))
        .route("/decisions", get(list_decisions))
        .route("/transitions", get(list_transitions))
        .route("/ws/events", get(ws_events_route))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new().nest("/v1", protected)
}

/// Journal every engine event, then rebroadcast it.
fn spawn_event_bridge(
    event_rx: flume::Receiver<EngineEvent>,
    journal: Arc<DecisionJournal>,
    ws_events: broadcast::Sender<ApiEventEnvelope>,
) {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            if let Err(e) = journal.record(&event) {
                tracing::warn!("Failed to journal {}: {:#}", event.event_type(), e);
            }
            let _ = ws_events.send(map_engine_event(&event));
        }
    });
}

fn spawn_response_bridge(
    mut responses: broadcast::Receiver<ResponseRequest>,
    ws_events: broadcast::Sender<ApiEventEnvelope>,
) {
    tokio::spawn(async move {
        loop {
            match responses.recv().await {
                Ok(request) => {
                    let payload =
                        serde_json::to_value(&request).unwrap_or_else(|_| serde_json::json!({}));
                    let _ = ws_events.send(envelope("response_requested", payload));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Response bridge lagged; skipped {} request(s)", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn map_engine_event(event: &EngineEvent) -> ApiEventEnvelope {
    match event {
        EngineEvent::DecisionMade {
            session_key,
            channel,
            decision,
            ..
        } => envelope(
            event.event_type(),
            serde_json::json!({
                "session_key": session_key,
                "channel": channel,
                "decision": decision,
            }),
        ),
        EngineEvent::SessionChanged {
            session_key,
            from,
            to,
            reason,
            session,
            ..
        } => envelope(
            event.event_type(),
            serde_json::json!({
                "session_key": session_key,
                "from": from,
                "to": to,
                "reason": reason,
                "participants": session.roster_names(),
            }),
        ),
    }
}

fn envelope(event_type: &str, payload: serde_json::Value) -> ApiEventEnvelope {
    ApiEventEnvelope {
        event_type: event_type.to_string(),
        emitted_at: Utc::now(),
        payload,
    }
}

fn load_auth_config() -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(std::env::var("ELSIE_BACKEND_AUTH_MODE").ok())?;
    let token = std::env::var("ELSIE_BACKEND_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "ELSIE_BACKEND_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid ELSIE_BACKEND_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let expected = format!("Bearer {}", token);
    if auth_value.trim() != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn get_config(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<EngineConfig>, (StatusCode, String)> {
    let config = state.config.read().await.clone();
    Ok(Json(config))
}

async fn post_message(
    State(state): State<Arc<ServerState>>,
    Json(message): Json<IncomingMessage>,
) -> Result<Json<MessageOutcome>, (StatusCode, String)> {
    if message.raw_text.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "raw_text cannot be empty".to_string(),
        ));
    }

    let outcome = state.engine.process(&message).await;
    if let Some(request) = ResponseRequest::from_outcome(&message, &outcome) {
        state.dispatcher.spawn_dispatch(request);
    }
    Ok(Json(outcome))
}

async fn list_sessions(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<SessionsResponse>, (StatusCode, String)> {
    let registry = state.engine.registry();
    Ok(Json(SessionsResponse {
        engaged: registry.binding(),
        sessions: registry.snapshots().await,
    }))
}

async fn get_session(
    State(state): State<Arc<ServerState>>,
    Path(key): Path<String>,
) -> Result<Json<Session>, (StatusCode, String)> {
    match state.engine.registry().snapshot(&key).await {
        Some(session) => Ok(Json(session)),
        None => Err(not_found(format!("session '{}' not found", key))),
    }
}

async fn sweep_sessions(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<SweepResponse>, (StatusCode, String)> {
    let closed = state.engine.sweep(Utc::now()).await;
    Ok(Json(SweepResponse { closed }))
}

async fn list_decisions(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ChannelHistoryQuery>,
) -> Result<Json<Vec<DecisionRecord>>, (StatusCode, String)> {
    let limit = clamp_limit(query.limit, 100, 1, 1000);
    state
        .journal
        .recent_decisions(query.channel.as_deref(), limit)
        .map(Json)
        .map_err(internal_error)
}

async fn list_transitions(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ChannelHistoryQuery>,
) -> Result<Json<Vec<TransitionRecord>>, (StatusCode, String)> {
    let limit = clamp_limit(query.limit, 100, 1, 1000);
    state
        .journal
        .recent_transitions(query.channel.as_deref(), limit)
        .map(Json)
        .map_err(internal_error)
}

async fn ws_events_route(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(state, socket))
}

async fn handle_events_socket(state: Arc<ServerState>, mut socket: WebSocket) {
    let mut rx = state.ws_events.subscribe();

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let payload = match serde_json::to_string(&event) {
                            Ok(serialized) => serialized,
                            Err(error) => {
                                tracing::warn!("Failed to serialize websocket event: {}", error);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

fn clamp_limit(value: Option<usize>, default: usize, min: usize, max: usize) -> usize {
    value.unwrap_or(default).clamp(min, max)
}

fn not_found(message: String) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, message)
}

fn internal_error(error: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}
