//! Shared types and contracts for the Lucyd daemon.
//!
//! Everything the other crates agree on lives here: the chat log data
//! model, the `Provider` capability set, and the daemon configuration.

pub mod config;
pub mod error;
pub mod provider;
pub mod types;

pub use config::LucydConfig;
pub use error::ConfigError;
pub use provider::{CompletionResponse, Provider, ProviderError};
pub use types::{
    CacheTier, ChatMessage, Content, ContentBlock, Role, SystemBlock, ToolCall, ToolResultEntry,
    Usage,
};
