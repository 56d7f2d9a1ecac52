use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use lucyd_core::types::{ChatMessage, Content, Role, ToolResultEntry};

use crate::error::Result;

/// Tool result content is truncated to this many chars in the event log.
/// The checkpoint keeps the full content.
const AUDIT_TRUNCATION: usize = 2_000;

/// Checkpoint shape written to `<id>.json`.
#[derive(Debug, Serialize, Deserialize)]
struct SessionState {
    id: String,
    contact: String,
    model: String,
    compaction_count: u32,
    last_input_tokens: u64,
    pending_system_warning: String,
    warned_about_compaction: bool,
    created_at: String,
    messages: Vec<ChatMessage>,
}

/// One live session: in-memory message log plus its two backing files.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub contact: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Increases by exactly one per compaction, never decreases.
    pub compaction_count: u32,
    /// Input tokens reported by the last provider response.
    pub last_input_tokens: u64,
    /// Injected into the next user message, "" if none.
    pub pending_system_warning: String,
    /// Set when the 80% warning fired; cleared by compaction.
    pub warned_about_compaction: bool,
    pub created_at: String,
    dir: PathBuf,
}

impl Session {
    pub fn create(dir: &Path, contact: &str, model: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            contact: contact.to_string(),
            model: model.to_string(),
            messages: Vec::new(),
            compaction_count: 0,
            last_input_tokens: 0,
            pending_system_warning: String::new(),
            warned_about_compaction: false,
            created_at: Utc::now().to_rfc3339(),
            dir: dir.to_path_buf(),
        }
    }

    /// Load from a checkpoint file. The event log is not replayed — the
    /// checkpoint is authoritative.
    pub fn load(dir: &Path, state_path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(state_path)?;
        let state: SessionState = serde_json::from_str(&raw)?;
        Ok(Self {
            id: state.id,
            contact: state.contact,
            model: state.model,
            messages: state.messages,
            compaction_count: state.compaction_count,
            last_input_tokens: state.last_input_tokens,
            pending_system_warning: state.pending_system_warning,
            warned_about_compaction: state.warned_about_compaction,
            created_at: state.created_at,
            dir: dir.to_path_buf(),
        })
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.id))
    }

    fn events_path(&self) -> PathBuf {
        let date = Utc::now().format("%Y-%m-%d");
        self.dir.join(format!("{}.{}.jsonl", self.id, date))
    }

    /// Append a user message: event first, then checkpoint.
    pub fn add_user_message(&mut self, text: &str, sender: &str, source: &str) -> Result<()> {
        self.append_event(&serde_json::json!({
            "type": "message",
            "role": "user",
            "content": text,
            "from": sender,
            "source": source,
            "timestamp": Utc::now().to_rfc3339(),
        }));
        self.messages.push(ChatMessage::user(text));
        self.save_state()
    }

    /// Persist an assistant message the agentic loop already appended.
    pub fn persist_assistant_message(&mut self, msg: &ChatMessage) {
        self.append_event(&serde_json::json!({
            "type": "message",
            "role": "assistant",
            "text": msg.text(),
            "timestamp": Utc::now().to_rfc3339(),
        }));
    }

    /// Persist a tool-results message, truncating result content for the
    /// audit log.
    pub fn persist_tool_results(&mut self, results: &[ToolResultEntry]) {
        let audited: Vec<serde_json::Value> = results
            .iter()
            .map(|r| {
                serde_json::json!({
                    "tool_use_id": r.tool_use_id,
                    "content": truncate_chars(&r.content, AUDIT_TRUNCATION),
                })
            })
            .collect();
        self.append_event(&serde_json::json!({
            "type": "message",
            "role": "tool_results",
            "results": audited,
            "timestamp": Utc::now().to_rfc3339(),
        }));
    }

    /// Rewrite the checkpoint atomically (temp + rename).
    pub fn save_state(&self) -> Result<()> {
        let state = SessionState {
            id: self.id.clone(),
            contact: self.contact.clone(),
            model: self.model.clone(),
            compaction_count: self.compaction_count,
            last_input_tokens: self.last_input_tokens,
            pending_system_warning: self.pending_system_warning.clone(),
            warned_about_compaction: self.warned_about_compaction,
            created_at: self.created_at.clone(),
            messages: self.messages.clone(),
        };
        let path = self.state_path();
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(&state)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Event append is best-effort: the checkpoint is authoritative, and
    /// a failed audit line must not fail the user-facing turn.
    fn append_event(&self, event: &serde_json::Value) {
        let path = self.events_path();
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{event}"));
        if let Err(e) = result {
            warn!(session = %self.id, error = %e, "event log append failed");
        }
    }

    pub fn needs_compaction(&self, threshold: u64) -> bool {
        threshold > 0 && self.last_input_tokens >= threshold
    }

    /// Merge trailing consecutive user messages into one (recovery from a
    /// prior crash or an orphaned message). Returns how many merges ran.
    pub fn merge_trailing_user_messages(&mut self) -> usize {
        let mut merged = 0;
        while self.messages.len() >= 2 {
            let n = self.messages.len();
            if self.messages[n - 2].role != Role::User || self.messages[n - 1].role != Role::User {
                break;
            }
            let last = self.messages.pop().map(|m| m.text()).unwrap_or_default();
            let prev = self.messages[n - 2].text();
            self.messages[n - 2].content = Content::Text(format!("{prev}\n{last}"));
            merged += 1;
            warn!(session = %self.id, "merged consecutive user messages");
        }
        merged
    }

    /// Drop a trailing user message left behind by a failed turn.
    pub fn remove_orphaned_user_message(&mut self) -> bool {
        if matches!(self.messages.last(), Some(m) if m.role == Role::User) {
            self.messages.pop();
            return true;
        }
        false
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}
