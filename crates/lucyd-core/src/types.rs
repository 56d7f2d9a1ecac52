use serde::{Deserialize, Serialize};
use std::fmt;

/// Message author role inside a session log.
///
/// `ToolResults` is a first-class role: the agentic loop appends one
/// tool-results message per turn collecting all results of that turn's
/// tool calls, and the session store persists it as its own event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ToolResults,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::ToolResults => write!(f, "tool_results"),
        }
    }
}

/// One block inside a multi-part message content.
///
/// Image data is base64; `media_type` is the original MIME type. Provider
/// adapters convert these neutral blocks into their native wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { media_type: String, data: String },
}

/// Message content: plain text or a list of blocks.
///
/// Plain text is the common case; blocks appear only transiently while a
/// message with image attachments is in flight (the pipeline restores
/// text-only content before the log is persisted).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Content {
    /// Extract the text portion. For block lists, text blocks are joined
    /// with a space; image blocks contribute nothing.
    pub fn as_text(&self) -> String {
        match self {
            Content::Text(s) => s.clone(),
            Content::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Content::Text(s) => s.is_empty(),
            Content::Blocks(b) => b.is_empty(),
        }
    }
}

impl Default for Content {
    fn default() -> Self {
        Content::Text(String::new())
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::Text(s)
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Content::Text(s.to_string())
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One executed tool result, paired back to its call by `tool_use_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultEntry {
    pub tool_use_id: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

/// A single entry in a session's message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: Content,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<ToolResultEntry>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Content::Text(text.into()),
            tool_calls: Vec::new(),
            results: Vec::new(),
        }
    }

    pub fn assistant(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: Content::Text(text.into()),
            tool_calls,
            results: Vec::new(),
        }
    }

    pub fn tool_results(results: Vec<ToolResultEntry>) -> Self {
        Self {
            role: Role::ToolResults,
            content: Content::default(),
            tool_calls: Vec::new(),
            results,
        }
    }

    /// Text portion of this message's content.
    pub fn text(&self) -> String {
        self.content.as_text()
    }
}

/// Token accounting for one provider response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
}

impl Usage {
    pub fn accumulate(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
    }
}

/// Cache-affinity hint for a system prompt block.
///
/// Providers that support prompt caching place breakpoints between tiers;
/// providers that don't simply concatenate the block texts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    /// Persona files and tool descriptions — identical across turns.
    Stable,
    /// Memory files and always-on skills — changes occasionally.
    SemiStable,
    /// Current time, source annotation, recall — changes every turn.
    Dynamic,
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheTier::Stable => write!(f, "stable"),
            CacheTier::SemiStable => write!(f, "semi_stable"),
            CacheTier::Dynamic => write!(f, "dynamic"),
        }
    }
}

/// One system prompt block with its cache tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemBlock {
    pub text: String,
    pub tier: CacheTier,
}

impl SystemBlock {
    pub fn new(text: impl Into<String>, tier: CacheTier) -> Self {
        Self {
            text: text.into(),
            tier,
        }
    }
}
