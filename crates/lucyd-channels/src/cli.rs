//! CLI channel — stdin/stdout for testing and piping.
//!
//! The simplest possible channel: one inbound message per stdin line,
//! replies printed to stdout. Stream ends on EOF, which shuts the daemon
//! down cleanly (useful for `echo "hi" | lucyd`).

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::channel::Channel;
use crate::error::ChannelError;
use crate::types::InboundMessage;

pub struct CliChannel;

impl CliChannel {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CliChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        "cli"
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    fn receive(&self) -> BoxStream<'static, InboundMessage> {
        Box::pin(async_stream::stream! {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        yield InboundMessage {
                            text: line,
                            sender: "cli".to_string(),
                            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
                            source: "cli".to_string(),
                            quote: None,
                            attachments: None,
                        };
                    }
                    // EOF or read error — end the stream
                    Ok(None) => return,
                    Err(_) => return,
                }
            }
        })
    }

    async fn send(
        &self,
        _target: &str,
        text: &str,
        attachments: Option<&[String]>,
    ) -> Result<(), ChannelError> {
        if !text.is_empty() {
            println!("Agent> {text}");
        }
        if let Some(paths) = attachments {
            for p in paths {
                println!("Agent> [attachment: {p}]");
            }
        }
        Ok(())
    }
}
