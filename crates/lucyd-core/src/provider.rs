use async_trait::async_trait;

use crate::types::{ChatMessage, SystemBlock, ToolCall, Usage};

/// Final response of one provider completion call.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub text: String,
    /// Provider-reported stop reason (`"end_turn"`, `"tool_use"`, …).
    pub stop_reason: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
}

/// Common interface for all LLM providers.
///
/// `format_system` / `format_messages` return opaque payloads in the
/// provider's native wire shape; callers thread them into `complete`
/// without inspecting them. This keeps provider-specific concerns (cache
/// breakpoints, content block encodings) out of the orchestration core.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    /// Format tiered system blocks into the provider's system payload.
    fn format_system(&self, blocks: &[SystemBlock]) -> serde_json::Value;

    /// Format the session message log into the provider's message payload.
    fn format_messages(&self, messages: &[ChatMessage]) -> serde_json::Value;

    /// One completion call with tool definitions.
    async fn complete(
        &self,
        system: &serde_json::Value,
        messages: &serde_json::Value,
        tools: &[serde_json::Value],
    ) -> Result<CompletionResponse, ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Request timeout after {ms}ms")]
    Timeout { ms: u64 },
}

impl ProviderError {
    /// Whether a retry has a realistic chance of succeeding.
    ///
    /// Network timeouts, connection failures, rate limits, and server-side
    /// errors are transient; everything else (auth, malformed requests,
    /// unparseable responses) is fatal and must not be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Http(e) => e.is_timeout() || e.is_connect(),
            ProviderError::Api { status, .. } => *status == 429 || *status >= 500,
            ProviderError::RateLimited { .. } => true,
            ProviderError::Unavailable(_) => true,
            ProviderError::Timeout { .. } => true,
            ProviderError::Parse(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_and_5xx_are_transient() {
        assert!(ProviderError::RateLimited { retry_after_ms: 100 }.is_transient());
        assert!(ProviderError::Api {
            status: 429,
            message: String::new()
        }
        .is_transient());
        assert!(ProviderError::Api {
            status: 503,
            message: String::new()
        }
        .is_transient());
        assert!(ProviderError::Timeout { ms: 1000 }.is_transient());
    }

    #[test]
    fn client_errors_are_fatal() {
        assert!(!ProviderError::Api {
            status: 400,
            message: String::new()
        }
        .is_transient());
        assert!(!ProviderError::Api {
            status: 401,
            message: String::new()
        }
        .is_transient());
        assert!(!ProviderError::Parse("bad json".to_string()).is_transient());
    }
}
