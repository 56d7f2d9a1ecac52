use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::ChannelError;
use crate::types::InboundMessage;

/// Common interface implemented by every transport adapter.
///
/// Implementations must be `Send + Sync` so the daemon can share one
/// adapter between the reader task and the pipeline.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Stable lowercase identifier for this channel (e.g. "cli").
    fn name(&self) -> &str;

    /// Establish the connection to the external service. May fail startup.
    async fn connect(&self) -> Result<(), ChannelError>;

    /// Long-lived inbound stream. The stream ends on unrecoverable channel
    /// close — the daemon's reader task enqueues a shutdown sentinel then.
    fn receive(&self) -> BoxStream<'static, InboundMessage>;

    /// Deliver text (and optional attachment paths) to a target.
    async fn send(
        &self,
        target: &str,
        text: &str,
        attachments: Option<&[String]>,
    ) -> Result<(), ChannelError>;

    /// Best-effort typing indicator; implementations never propagate errors.
    async fn send_typing(&self, _target: &str) {}

    /// React to an inbound message identified by its timestamp token.
    async fn send_reaction(
        &self,
        _target: &str,
        _emoji: &str,
        _timestamp_ms: i64,
    ) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Idempotent cleanup.
    async fn disconnect(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// Round-trip a transport message id through the millisecond token space.
///
/// Transports that key reactions by message id encode it as `id * 1000`;
/// decoding divides back. Must be lossless for any id.
pub fn message_id_to_token(message_id: i64) -> i64 {
    message_id * 1000
}

pub fn token_to_message_id(token: i64) -> i64 {
    token / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reaction_token_roundtrip() {
        for id in [0i64, 1, 42, 987_654_321] {
            assert_eq!(token_to_message_id(message_id_to_token(id)), id);
        }
    }
}
