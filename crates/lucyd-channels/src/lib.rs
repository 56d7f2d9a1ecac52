//! Channel abstraction — the contract between the daemon and messaging
//! transports, plus the built-in CLI adapter.

pub mod channel;
pub mod cli;
pub mod error;
pub mod types;

pub use channel::Channel;
pub use cli::CliChannel;
pub use error::ChannelError;
pub use types::{Attachment, InboundMessage};
