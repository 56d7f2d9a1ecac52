//! HTTP API — POST /chat plus read-only status views.
//!
//! /chat enqueues a control item carrying a oneshot future and awaits
//! its resolution; the item passes through the same queue as everything
//! else, so HTTP requests serialize with transport messages.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::app::AppState;
use crate::dispatch::{ControlRequest, Ingress};

#[derive(Clone)]
pub struct HttpState {
    pub app: Arc<AppState>,
    pub tx: mpsc::Sender<Ingress>,
}

pub fn router(state: HttpState) -> Router {
    let body_limit = state.app.config.http.max_body_bytes;
    Router::new()
        .route("/chat", post(chat_handler))
        .route("/status", get(status_handler))
        .route("/sessions", get(sessions_handler))
        .route("/cost", get(cost_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: HttpState) -> anyhow::Result<()> {
    let addr = format!(
        "{}:{}",
        state.app.config.http.host, state.app.config.http.port
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "HTTP API listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn check_auth(state: &HttpState, headers: &HeaderMap) -> bool {
    let token = &state.app.config.http.auth_token;
    if token.is_empty() {
        return true;
    }
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|t| t == token)
}

fn unauthorized() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"error": "unauthorized"})),
    )
}

#[derive(Deserialize)]
struct ChatBody {
    text: String,
    #[serde(default)]
    sender: Option<String>,
    #[serde(default)]
    tier: Option<String>,
    #[serde(default)]
    notify_meta: Option<serde_json::Value>,
}

/// POST /chat — submit a message and wait for the pipeline to resolve
/// it. 503 when the queue is full, 504 when the agent deadline passes.
async fn chat_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    if !check_auth(&state, &headers) {
        return Err(unauthorized());
    }
    if body.text.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "text cannot be empty"})),
        ));
    }

    let (resp_tx, resp_rx) = oneshot::channel();
    let req = ControlRequest {
        kind: "http".to_string(),
        sender: body.sender.unwrap_or_else(|| "http".to_string()),
        text: body.text,
        tier: body.tier,
        attachments: Vec::new(),
        notify_meta: body.notify_meta,
        session_id: None,
        all: false,
        respond: Some(resp_tx),
    };

    if state.tx.try_send(Ingress::Control(req)).is_err() {
        warn!("chat request rejected: queue full");
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": "queue full"})),
        ));
    }

    let timeout = Duration::from_secs(state.app.config.behavior.agent_timeout_secs + 30);
    match tokio::time::timeout(timeout, resp_rx).await {
        Ok(Ok(result)) => Ok(Json(result)),
        Ok(Err(_)) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": "pipeline dropped the request"})),
        )),
        Err(_) => Err((
            StatusCode::GATEWAY_TIMEOUT,
            Json(serde_json::json!({"error": "agent timeout"})),
        )),
    }
}

async fn status_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    if !check_auth(&state, &headers) {
        return Err(unauthorized());
    }
    Ok(Json(state.app.build_status()))
}

async fn sessions_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    if !check_auth(&state, &headers) {
        return Err(unauthorized());
    }
    let sessions = state.app.sessions.snapshot();
    Ok(Json(serde_json::json!({"sessions": sessions})))
}

#[derive(Deserialize)]
struct CostQuery {
    #[serde(default = "default_period")]
    period: String,
}

fn default_period() -> String {
    "today".to_string()
}

async fn cost_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<CostQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    if !check_auth(&state, &headers) {
        return Err(unauthorized());
    }
    let breakdown = state.app.ledger.period_breakdown(&query.period);
    Ok(Json(serde_json::to_value(breakdown).unwrap_or_default()))
}
