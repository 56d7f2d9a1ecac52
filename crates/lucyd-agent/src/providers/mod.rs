//! Built-in provider adapters.
//!
//! The daemon only ships the Anthropic-messages-compatible adapter;
//! other provider families plug in through the `Provider` trait.

mod anthropic;

pub use anthropic::AnthropicProvider;
