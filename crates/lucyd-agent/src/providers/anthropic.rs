use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use lucyd_core::provider::{CompletionResponse, Provider, ProviderError};
use lucyd_core::types::{
    CacheTier, ChatMessage, Content, ContentBlock, Role, SystemBlock, ToolCall, Usage,
};

const API_VERSION: &str = "2023-06-01";

/// Provider adapter for the Anthropic Messages API and compatible
/// endpoints.
///
/// System blocks are rendered with `cache_control` breakpoints at the
/// stable and semi-stable tier boundaries, so repeated turns hit the
/// provider-side prompt cache.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicProvider {
    pub fn new(model: &str, api_key: &str, base_url: Option<&str>, max_tokens: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.to_string(),
            base_url: base_url
                .unwrap_or("https://api.anthropic.com")
                .trim_end_matches('/')
                .to_string(),
            model: model.to_string(),
            max_tokens,
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn format_system(&self, blocks: &[SystemBlock]) -> serde_json::Value {
        let mut out: Vec<serde_json::Value> = Vec::with_capacity(blocks.len());
        for (i, block) in blocks.iter().enumerate() {
            let mut value = serde_json::json!({
                "type": "text",
                "text": block.text,
            });
            // Cache breakpoint on the last block of each cacheable tier.
            let tier_ends = blocks.get(i + 1).map(|next| next.tier) != Some(block.tier);
            if tier_ends && block.tier != CacheTier::Dynamic {
                value["cache_control"] = serde_json::json!({"type": "ephemeral"});
            }
            out.push(value);
        }
        serde_json::Value::Array(out)
    }

    fn format_messages(&self, messages: &[ChatMessage]) -> serde_json::Value {
        let out: Vec<serde_json::Value> = messages.iter().map(format_message).collect();
        serde_json::Value::Array(out)
    }

    async fn complete(
        &self,
        system: &serde_json::Value,
        messages: &serde_json::Value,
        tools: &[serde_json::Value],
    ) -> Result<CompletionResponse, ProviderError> {
        let mut body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": system,
            "messages": messages,
            "stream": false,
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::Value::Array(tools.to_vec());
        }

        let url = format!("{}/v1/messages", self.base_url);
        debug!(model = %self.model, "sending request to Anthropic");

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(5000);
            return Err(ProviderError::RateLimited {
                retry_after_ms: retry,
            });
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "Anthropic API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(parse_response(api_resp))
    }
}

fn format_message(msg: &ChatMessage) -> serde_json::Value {
    match msg.role {
        Role::User => {
            let content = match &msg.content {
                Content::Text(text) => serde_json::Value::String(text.clone()),
                Content::Blocks(blocks) => serde_json::Value::Array(
                    blocks.iter().map(format_content_block).collect(),
                ),
            };
            serde_json::json!({ "role": "user", "content": content })
        }
        Role::Assistant => {
            if msg.tool_calls.is_empty() {
                return serde_json::json!({
                    "role": "assistant",
                    "content": msg.text(),
                });
            }
            let mut content: Vec<serde_json::Value> = Vec::new();
            let text = msg.text();
            if !text.is_empty() {
                content.push(serde_json::json!({"type": "text", "text": text}));
            }
            for call in &msg.tool_calls {
                content.push(serde_json::json!({
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.name,
                    "input": call.arguments,
                }));
            }
            serde_json::json!({ "role": "assistant", "content": content })
        }
        // Tool results travel back as a user message of tool_result blocks.
        Role::ToolResults => {
            let content: Vec<serde_json::Value> = msg
                .results
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "type": "tool_result",
                        "tool_use_id": r.tool_use_id,
                        "content": r.content,
                        "is_error": r.is_error,
                    })
                })
                .collect();
            serde_json::json!({ "role": "user", "content": content })
        }
    }
}

fn format_content_block(block: &ContentBlock) -> serde_json::Value {
    match block {
        ContentBlock::Text { text } => serde_json::json!({"type": "text", "text": text}),
        ContentBlock::Image { media_type, data } => serde_json::json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": media_type,
                "data": data,
            }
        }),
    }
}

fn parse_response(resp: ApiResponse) -> CompletionResponse {
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in resp.content {
        match block {
            ApiContentBlock::Text { text } => text_parts.push(text),
            ApiContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: input,
                });
            }
            ApiContentBlock::Unknown => {}
        }
    }

    CompletionResponse {
        text: text_parts.join(""),
        stop_reason: resp.stop_reason.unwrap_or_default(),
        tool_calls,
        usage: Usage {
            input_tokens: resp.usage.input_tokens,
            output_tokens: resp.usage.output_tokens,
            cache_read_tokens: resp.usage.cache_read_input_tokens.unwrap_or(0),
            cache_write_tokens: resp.usage.cache_creation_input_tokens.unwrap_or(0),
        },
    }
}

// Anthropic API response types (private — only used for deserialization)

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ApiContentBlock>,
    stop_reason: Option<String>,
    usage: ApiUsage,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ApiContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct ApiUsage {
    input_tokens: u64,
    output_tokens: u64,
    cache_read_input_tokens: Option<u64>,
    cache_creation_input_tokens: Option<u64>,
}
