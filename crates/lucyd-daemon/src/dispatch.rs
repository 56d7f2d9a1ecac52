//! Dispatch loop — single consumer of the bounded ingress queue.
//!
//! Applies per-sender debouncing to transport and FIFO items, routes
//! HTTP items straight through (each carries its own response future),
//! handles reset commands, and drains pending work on the shutdown
//! sentinel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use lucyd_channels::{Attachment, InboundMessage};

use crate::app::AppState;
use crate::pipeline::{self, CombinedMessage};

/// One item on the ingress queue.
pub enum Ingress {
    /// A transport message.
    Inbound(InboundMessage),
    /// A control-pipe or HTTP item.
    Control(ControlRequest),
    /// Drain pending debounced items, then exit the loop.
    Shutdown,
}

/// Validated control item (FIFO line or HTTP /chat body).
pub struct ControlRequest {
    /// Item type: "reset", "http", "user", "system", "notify", …
    /// Doubles as the ingress source for non-reset items.
    pub kind: String,
    pub sender: String,
    pub text: String,
    pub tier: Option<String>,
    pub attachments: Vec<Attachment>,
    pub notify_meta: Option<serde_json::Value>,
    pub session_id: Option<String>,
    pub all: bool,
    /// Present on HTTP items; resolving it delivers the reply.
    pub respond: Option<oneshot::Sender<serde_json::Value>>,
}

/// Validate a decoded FIFO line. Returns None (with a log line) for
/// anything malformed; the daemon never crashes on pipe input.
pub fn parse_control(value: &serde_json::Value) -> Option<ControlRequest> {
    let Some(obj) = value.as_object() else {
        warn!("control message not an object, ignoring");
        return None;
    };

    let kind = obj
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("system")
        .to_string();

    if kind == "reset" {
        return Some(ControlRequest {
            kind,
            sender: obj
                .get("sender")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            text: String::new(),
            tier: None,
            attachments: Vec::new(),
            notify_meta: None,
            session_id: obj
                .get("session_id")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            all: obj.get("all").and_then(|v| v.as_bool()).unwrap_or(false),
            respond: None,
        });
    }

    // Normal items require text + sender.
    let (Some(text), Some(sender)) = (
        obj.get("text").and_then(|v| v.as_str()),
        obj.get("sender").and_then(|v| v.as_str()),
    ) else {
        warn!("control message missing required fields, ignoring");
        return None;
    };

    // Reconstruct attachments from serialized dicts; entries without a
    // local_path are dropped.
    let attachments = obj
        .get("attachments")
        .and_then(|v| v.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|a| {
                    let a = a.as_object()?;
                    let local_path = a.get("local_path")?.as_str()?.to_string();
                    if local_path.is_empty() {
                        return None;
                    }
                    Some(Attachment {
                        content_type: a
                            .get("content_type")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        local_path,
                        filename: a
                            .get("filename")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        size: a.get("size").and_then(|v| v.as_u64()).unwrap_or(0),
                        is_voice: a.get("is_voice").and_then(|v| v.as_bool()).unwrap_or(false),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Some(ControlRequest {
        kind,
        sender: sender.to_string(),
        text: text.to_string(),
        tier: obj.get("tier").and_then(|v| v.as_str()).map(str::to_string),
        attachments,
        notify_meta: obj.get("notify_meta").cloned(),
        session_id: None,
        all: false,
        respond: None,
    })
}

struct PendingItem {
    text: String,
    source: String,
    tier: String,
    attachments: Vec<Attachment>,
    notify_meta: Option<serde_json::Value>,
}

pub struct Dispatcher {
    state: Arc<AppState>,
    rx: mpsc::Receiver<Ingress>,
    pending: HashMap<String, Vec<PendingItem>>,
}

impl Dispatcher {
    pub fn new(state: Arc<AppState>, rx: mpsc::Receiver<Ingress>) -> Self {
        Self {
            state,
            rx,
            pending: HashMap::new(),
        }
    }

    /// Run until the queue closes or a shutdown sentinel arrives.
    pub async fn run(mut self) {
        let debounce = Duration::from_millis(self.state.config.behavior.debounce_ms);

        loop {
            let item = match tokio::time::timeout(Duration::from_secs(1), self.rx.recv()).await {
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(item)) => item,
            };

            match item {
                Ingress::Shutdown => {
                    self.drain_all().await;
                    info!("dispatcher: shutdown sentinel, exiting");
                    break;
                }
                other => {
                    let opened = self.admit(other).await;
                    if !opened {
                        continue;
                    }
                    // Debounce window: keep consuming the queue so rapid
                    // successive messages from one sender combine into a
                    // single pipeline run.
                    let deadline = tokio::time::Instant::now() + debounce;
                    loop {
                        let Some(remaining) =
                            deadline.checked_duration_since(tokio::time::Instant::now())
                        else {
                            break;
                        };
                        match tokio::time::timeout(remaining, self.rx.recv()).await {
                            Err(_) | Ok(None) => break,
                            Ok(Some(Ingress::Shutdown)) => {
                                self.drain_all().await;
                                info!("dispatcher: shutdown sentinel, exiting");
                                return;
                            }
                            Ok(Some(item)) => {
                                self.admit(item).await;
                            }
                        }
                    }
                    self.drain_all().await;
                }
            }
        }
    }

    /// Route one non-sentinel item. Returns true when the item entered
    /// the pending map (and a debounce window should be open).
    async fn admit(&mut self, item: Ingress) -> bool {
        match item {
            Ingress::Shutdown => false,

            Ingress::Inbound(msg) => {
                self.state
                    .contact_timestamps
                    .lock()
                    .unwrap()
                    .put(msg.sender.clone(), (msg.timestamp * 1000.0) as i64);
                if msg.text.is_empty() && msg.attachments.is_none() {
                    return false;
                }
                self.enqueue_pending(
                    &msg.sender.clone(),
                    PendingItem {
                        text: msg.text,
                        source: msg.source,
                        tier: "full".to_string(),
                        attachments: msg.attachments.unwrap_or_default(),
                        notify_meta: None,
                    },
                );
                true
            }

            Ingress::Control(req) if req.kind == "reset" => {
                self.handle_reset(req).await;
                false
            }

            // HTTP items carry their own future — combining them with
            // debounced messages would orphan the future. They bypass
            // the window and run immediately.
            Ingress::Control(req) if req.respond.is_some() => {
                let combined = CombinedMessage {
                    text: req.text,
                    sender: if req.sender.is_empty() {
                        "http".to_string()
                    } else {
                        req.sender
                    },
                    source: req.kind,
                    tier: req.tier.unwrap_or_else(|| "full".to_string()),
                    attachments: req.attachments,
                    notify_meta: req.notify_meta,
                    respond: req.respond,
                };
                pipeline::process_message(&self.state, combined).await;
                false
            }

            Ingress::Control(req) => {
                if req.text.is_empty() && req.attachments.is_empty() {
                    return false;
                }
                let sender = if req.sender.is_empty() {
                    "system".to_string()
                } else {
                    req.sender.clone()
                };
                let default_tier = if req.kind == "user" { "full" } else { "operational" };
                self.enqueue_pending(
                    &sender,
                    PendingItem {
                        text: req.text,
                        source: req.kind,
                        tier: req.tier.unwrap_or_else(|| default_tier.to_string()),
                        attachments: req.attachments,
                        notify_meta: req.notify_meta,
                    },
                );
                true
            }
        }
    }

    fn enqueue_pending(&mut self, sender: &str, item: PendingItem) {
        self.pending.entry(sender.to_string()).or_default().push(item);
    }

    /// Drain every pending sender, one combined message each.
    async fn drain_all(&mut self) {
        let senders: Vec<String> = self.pending.keys().cloned().collect();
        for sender in senders {
            let Some(items) = self.pending.remove(&sender) else {
                continue;
            };
            if items.is_empty() {
                continue;
            }
            let combined = combine(&sender, items);
            pipeline::process_message(&self.state, combined).await;
        }
    }

    async fn handle_reset(&self, req: ControlRequest) {
        let sessions = &self.state.sessions;

        if req.all {
            let contacts = sessions.contacts();
            let count = contacts.len();
            for contact in contacts {
                if let Err(e) = sessions.close_session(&contact).await {
                    warn!(contact = %contact, error = %e, "reset failed");
                }
            }
            info!(count, "all sessions reset");
            return;
        }

        if let Some(session_id) = &req.session_id {
            match sessions.close_session_by_id(session_id).await {
                Ok(true) => info!(session = %session_id, "session reset by id"),
                Ok(false) => warn!(session = %session_id, "no session found for id"),
                Err(e) => warn!(session = %session_id, error = %e, "reset failed"),
            }
            return;
        }

        // Reset by sender name. The convenience alias "user" targets the
        // first contact that is not an internal sender.
        let mut target = req.sender;
        if target == "user" {
            if let Some(contact) = sessions
                .contacts()
                .into_iter()
                .find(|c| c != "system" && c != "cli")
            {
                target = contact;
            }
        }
        if target.is_empty() {
            return;
        }
        match sessions.close_session(&target).await {
            Ok(true) => info!(contact = %target, "session reset"),
            Ok(false) => warn!(contact = %target, "no session found to reset"),
            Err(e) => warn!(contact = %target, error = %e, "reset failed"),
        }
    }
}

/// Combine a sender's debounced items into one message: texts joined
/// with newlines, attachment lists merged, first item's source/tier/meta
/// win.
fn combine(sender: &str, items: Vec<PendingItem>) -> CombinedMessage {
    let source = items[0].source.clone();
    let tier = items[0].tier.clone();
    let notify_meta = items[0].notify_meta.clone();

    let text = items
        .iter()
        .map(|i| i.text.as_str())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    let attachments: Vec<Attachment> = items.into_iter().flat_map(|i| i.attachments).collect();

    CombinedMessage {
        text,
        sender: sender.to_string(),
        source,
        tier,
        attachments,
        notify_meta,
        respond: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_control_rejects_non_objects() {
        assert!(parse_control(&serde_json::json!("just a string")).is_none());
        assert!(parse_control(&serde_json::json!([1, 2])).is_none());
        assert!(parse_control(&serde_json::json!(null)).is_none());
    }

    #[test]
    fn parse_control_requires_text_and_sender() {
        assert!(parse_control(&serde_json::json!({"text": "hi"})).is_none());
        assert!(parse_control(&serde_json::json!({"sender": "x"})).is_none());
        let ok = parse_control(&serde_json::json!({"text": "hi", "sender": "x"})).unwrap();
        assert_eq!(ok.kind, "system");
        assert_eq!(ok.text, "hi");
    }

    #[test]
    fn parse_control_reset_variants() {
        let by_sender =
            parse_control(&serde_json::json!({"type": "reset", "sender": "alice"})).unwrap();
        assert_eq!(by_sender.kind, "reset");
        assert_eq!(by_sender.sender, "alice");

        let by_id =
            parse_control(&serde_json::json!({"type": "reset", "session_id": "abc"})).unwrap();
        assert_eq!(by_id.session_id.as_deref(), Some("abc"));

        let all = parse_control(&serde_json::json!({"type": "reset", "all": true})).unwrap();
        assert!(all.all);
    }

    #[test]
    fn parse_control_reconstructs_attachments() {
        let req = parse_control(&serde_json::json!({
            "type": "notify",
            "text": "see file",
            "sender": "alice",
            "attachments": [
                {"content_type": "image/png", "local_path": "/tmp/a.png", "size": 10},
                {"content_type": "image/png", "local_path": ""},
                "not-a-dict",
            ],
        }))
        .unwrap();
        assert_eq!(req.attachments.len(), 1);
        assert_eq!(req.attachments[0].local_path, "/tmp/a.png");
    }

    #[test]
    fn combine_joins_text_and_merges_attachments() {
        let items = vec![
            PendingItem {
                text: "first".to_string(),
                source: "telegram".to_string(),
                tier: "full".to_string(),
                attachments: vec![Attachment {
                    content_type: "image/png".to_string(),
                    local_path: "/tmp/a.png".to_string(),
                    filename: String::new(),
                    size: 0,
                    is_voice: false,
                }],
                notify_meta: Some(serde_json::json!({"k": 1})),
            },
            PendingItem {
                text: String::new(),
                source: "cli".to_string(),
                tier: "operational".to_string(),
                attachments: vec![Attachment {
                    content_type: "audio/ogg".to_string(),
                    local_path: "/tmp/b.ogg".to_string(),
                    filename: String::new(),
                    size: 0,
                    is_voice: true,
                }],
                notify_meta: None,
            },
            PendingItem {
                text: "third".to_string(),
                source: "cli".to_string(),
                tier: "full".to_string(),
                attachments: Vec::new(),
                notify_meta: None,
            },
        ];
        let combined = combine("alice", items);
        assert_eq!(combined.text, "first\nthird");
        assert_eq!(combined.source, "telegram");
        assert_eq!(combined.tier, "full");
        assert_eq!(combined.attachments.len(), 2);
        assert_eq!(combined.notify_meta, Some(serde_json::json!({"k": 1})));
    }
}
