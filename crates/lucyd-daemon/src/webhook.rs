//! Webhook callback — fired after every processed message, including
//! failures (with an empty reply). Failures here log and never raise.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::app::AppState;

#[derive(Debug, Serialize)]
pub struct Payload {
    pub reply: String,
    pub session_id: String,
    pub sender: String,
    pub source: String,
    pub silent: bool,
    pub tokens: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify_meta: Option<serde_json::Value>,
}

/// POST the payload to the configured callback URL. No-op when
/// unconfigured.
pub async fn fire(state: &Arc<AppState>, payload: Payload) {
    let cfg = &state.config.webhook;
    if cfg.url.is_empty() {
        return;
    }

    let mut request = state
        .http_client
        .post(&cfg.url)
        .timeout(Duration::from_secs(cfg.timeout_secs))
        .json(&payload);
    if !cfg.token.is_empty() {
        request = request.header("Authorization", format!("Bearer {}", cfg.token));
    }

    if let Err(e) = request.send().await {
        warn!(url = %cfg.url, error = %e, "webhook callback failed");
    }
}
