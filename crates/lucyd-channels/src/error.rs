use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Send failed to {target}: {reason}")]
    Send { target: String, reason: String },

    #[error("Unknown contact: {0}")]
    UnknownContact(String),

    #[error("Invalid reaction: {0}")]
    InvalidReaction(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
