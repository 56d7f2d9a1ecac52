use serde::{Deserialize, Serialize};

/// A file attached to an inbound message.
///
/// The transport downloads the file and hands over a local path; the core
/// owns the file's lifecycle from then on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    /// MIME type ("image/jpeg", "audio/ogg", …).
    pub content_type: String,
    /// Absolute path on disk.
    pub local_path: String,
    /// Original filename or "".
    #[serde(default)]
    pub filename: String,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
    /// Voice note (as opposed to a forwarded audio file).
    #[serde(default)]
    pub is_voice: bool,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.content_type.starts_with("image/")
    }

    pub fn is_audio(&self) -> bool {
        self.content_type.starts_with("audio/")
    }
}

/// Transport-neutral inbound message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub text: String,
    /// Phone number, username, "cli", …
    pub sender: String,
    /// Seconds since epoch, monotonic per transport.
    pub timestamp: f64,
    /// Ingress source tag ("telegram", "cli", …).
    pub source: String,
    /// Quoted/replied-to text, when the transport carries it.
    #[serde(default)]
    pub quote: Option<String>,
    #[serde(default)]
    pub attachments: Option<Vec<Attachment>>,
}
