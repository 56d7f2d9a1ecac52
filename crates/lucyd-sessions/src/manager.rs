use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use lucyd_core::provider::Provider;
use lucyd_core::types::{ChatMessage, Role, SystemBlock};

use crate::error::{Result, SessionError};
use crate::types::Session;

/// Fired before a closing session is archived, so the hook still sees
/// the full message log. Breaks the wiring cycle between the daemon,
/// the session store, and the memory subsystem.
#[async_trait]
pub trait SessionCloseHook: Send + Sync {
    async fn on_close(&self, session: &Session);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    session_id: String,
    created_at: String,
}

/// Read-only session row for the HTTP /sessions view.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub contact: String,
    pub session_id: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compaction_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Manages the per-contact session files and the contact index.
///
/// Sessions are handed out behind `Arc<tokio::sync::Mutex<…>>`: the
/// pipeline holds the lock for the whole of one message's processing,
/// which is the exclusive-ownership window the rest of the daemon
/// assumes.
pub struct SessionManager {
    dir: PathBuf,
    index: Mutex<HashMap<String, IndexEntry>>,
    live: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Session>>>>,
    close_hook: Mutex<Option<Arc<dyn SessionCloseHook>>>,
}

impl SessionManager {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let index = Self::load_index(dir);
        Ok(Self {
            dir: dir.to_path_buf(),
            index: Mutex::new(index),
            live: Mutex::new(HashMap::new()),
            close_hook: Mutex::new(None),
        })
    }

    /// Register the close callback. Last registration wins.
    pub fn on_close(&self, hook: Arc<dyn SessionCloseHook>) {
        *self.close_hook.lock().unwrap() = Some(hook);
    }

    fn index_path(dir: &Path) -> PathBuf {
        dir.join("index.json")
    }

    fn load_index(dir: &Path) -> HashMap<String, IndexEntry> {
        let path = Self::index_path(dir);
        match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(error = %e, "session index corrupt, starting fresh");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        }
    }

    fn save_index(&self) -> Result<()> {
        let index = self.index.lock().unwrap().clone();
        let path = Self::index_path(&self.dir);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(&index)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Return the existing session for a contact or create a fresh one.
    ///
    /// Indexed sessions whose checkpoint survives a restart are loaded
    /// back; a missing or corrupt checkpoint falls through to creation.
    pub fn get_or_create(
        &self,
        contact: &str,
        model: &str,
    ) -> Result<Arc<tokio::sync::Mutex<Session>>> {
        if let Some(existing) = self.live.lock().unwrap().get(contact) {
            return Ok(Arc::clone(existing));
        }

        let indexed = self.index.lock().unwrap().get(contact).cloned();
        if let Some(entry) = indexed {
            let state_path = self.dir.join(format!("{}.json", entry.session_id));
            match Session::load(&self.dir, &state_path) {
                Ok(session) => {
                    info!(contact, session = %session.id, "session resumed from checkpoint");
                    let arc = Arc::new(tokio::sync::Mutex::new(session));
                    self.live
                        .lock()
                        .unwrap()
                        .insert(contact.to_string(), Arc::clone(&arc));
                    return Ok(arc);
                }
                Err(e) => {
                    warn!(contact = %contact, error = %e, "session checkpoint unreadable, creating fresh");
                }
            }
        }

        let session = Session::create(&self.dir, contact, model);
        info!(contact, session = %session.id, "session created");
        self.index.lock().unwrap().insert(
            contact.to_string(),
            IndexEntry {
                session_id: session.id.clone(),
                created_at: session.created_at.clone(),
            },
        );
        self.save_index()?;
        session.save_state()?;

        let arc = Arc::new(tokio::sync::Mutex::new(session));
        self.live
            .lock()
            .unwrap()
            .insert(contact.to_string(), Arc::clone(&arc));
        Ok(arc)
    }

    /// Compact a session: summarize everything but the recent tail, then
    /// atomically replace the log with `[summary] + tail`.
    pub async fn compact_session(
        &self,
        session: &mut Session,
        provider: &dyn Provider,
        prompt: &str,
        keep_recent: usize,
    ) -> Result<()> {
        let split = session.messages.len().saturating_sub(keep_recent);
        if split == 0 {
            return Ok(());
        }

        let transcript = render_transcript(&session.messages[..split]);
        let system = provider.format_system(&[SystemBlock::new(
            prompt,
            lucyd_core::types::CacheTier::Stable,
        )]);
        let messages = provider.format_messages(&[ChatMessage::user(format!(
            "Conversation to summarize:\n\n{transcript}"
        ))]);

        let response = provider
            .complete(&system, &messages, &[])
            .await
            .map_err(|e| SessionError::Compaction(e.to_string()))?;
        if response.text.trim().is_empty() {
            return Err(SessionError::Compaction("empty summary".to_string()));
        }

        let mut new_log = vec![ChatMessage::user(format!(
            "[Conversation summary]\n{}",
            response.text.trim()
        ))];
        for msg in session.messages[split..].iter().cloned() {
            // Keep the no-consecutive-users invariant across the splice
            if msg.role == Role::User
                && new_log.last().map(|m| m.role) == Some(Role::User)
            {
                let prev = new_log.last().map(|m| m.text()).unwrap_or_default();
                if let Some(last) = new_log.last_mut() {
                    last.content =
                        lucyd_core::types::Content::Text(format!("{prev}\n{}", msg.text()));
                }
                continue;
            }
            new_log.push(msg);
        }

        session.messages = new_log;
        session.compaction_count += 1;
        session.warned_about_compaction = false;
        session.last_input_tokens = 0;
        session.save_state()?;

        info!(
            session = %session.id,
            compaction_count = session.compaction_count,
            kept = keep_recent,
            "session compacted"
        );
        Ok(())
    }

    /// Close and archive a contact's session. The close hook fires before
    /// archival. Returns false when the contact has no session.
    pub async fn close_session(&self, contact: &str) -> Result<bool> {
        let live = self.live.lock().unwrap().remove(contact);
        let entry = self.index.lock().unwrap().get(contact).cloned();

        let session_arc = match live {
            Some(arc) => arc,
            None => {
                let Some(entry) = entry.as_ref() else {
                    return Ok(false);
                };
                let state_path = self.dir.join(format!("{}.json", entry.session_id));
                match Session::load(&self.dir, &state_path) {
                    Ok(s) => Arc::new(tokio::sync::Mutex::new(s)),
                    Err(_) => {
                        // Index entry without a checkpoint: just drop it.
                        self.index.lock().unwrap().remove(contact);
                        self.save_index()?;
                        return Ok(true);
                    }
                }
            }
        };

        let session = session_arc.lock().await;
        let hook = self.close_hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook.on_close(&session).await;
        }
        session.save_state()?;
        self.archive(&session)?;

        self.index.lock().unwrap().remove(contact);
        self.save_index()?;
        info!(contact, session = %session.id, "session closed and archived");
        Ok(true)
    }

    /// Close by session UUID (`--reset <uuid>` path).
    pub async fn close_session_by_id(&self, session_id: &str) -> Result<bool> {
        let contact = self
            .index
            .lock()
            .unwrap()
            .iter()
            .find(|(_, e)| e.session_id == session_id)
            .map(|(c, _)| c.clone());
        match contact {
            Some(contact) => self.close_session(&contact).await,
            None => Ok(false),
        }
    }

    fn archive_dir(&self) -> PathBuf {
        self.dir.join("archive")
    }

    fn archive(&self, session: &Session) -> Result<()> {
        let archive_dir = self.archive_dir();
        std::fs::create_dir_all(&archive_dir)?;
        let from = session.state_path();
        let to = archive_dir.join(format!("{}.json", session.id));
        if from.exists() {
            std::fs::rename(&from, &to)?;
        }
        Ok(())
    }

    /// Short excerpt from the contact's most recently archived session,
    /// used as the fresh-session recall prefix. Empty when no archive
    /// exists.
    pub fn build_recall(&self, contact: &str) -> String {
        let archive_dir = self.archive_dir();
        let Ok(entries) = std::fs::read_dir(&archive_dir) else {
            return String::new();
        };

        let mut newest: Option<(String, Session)> = None;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().is_none_or(|x| x != "json") {
                continue;
            }
            let Ok(session) = Session::load(&archive_dir, &path) else {
                continue;
            };
            if session.contact != contact {
                continue;
            }
            let ts = session.created_at.clone();
            if newest.as_ref().is_none_or(|(best, _)| ts > *best) {
                newest = Some((ts, session));
            }
        }

        let Some((_, session)) = newest else {
            return String::new();
        };

        let mut lines: Vec<String> = Vec::new();
        for msg in session.messages.iter().rev() {
            let label = match msg.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::ToolResults => continue,
            };
            let text = msg.text();
            if text.is_empty() {
                continue;
            }
            lines.push(format!("  {label}: {}", excerpt(&text, 200)));
            if lines.len() >= 4 {
                break;
            }
        }
        if lines.is_empty() {
            return String::new();
        }
        lines.reverse();
        format!("[From the previous conversation]\n{}", lines.join("\n"))
    }

    /// Snapshot of the session index for the HTTP /sessions view.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let index = self.index.lock().unwrap().clone();
        let live = self.live.lock().unwrap();
        index
            .into_iter()
            .map(|(contact, entry)| {
                let mut info = SessionInfo {
                    contact: contact.clone(),
                    session_id: entry.session_id,
                    created_at: entry.created_at,
                    message_count: None,
                    compaction_count: None,
                    model: None,
                };
                if let Some(arc) = live.get(&contact) {
                    if let Ok(session) = arc.try_lock() {
                        info.message_count = Some(session.messages.len());
                        info.compaction_count = Some(session.compaction_count);
                        info.model = Some(session.model.clone());
                    }
                }
                info
            })
            .collect()
    }

    pub fn contacts(&self) -> Vec<String> {
        self.index.lock().unwrap().keys().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.index.lock().unwrap().len()
    }

    /// Checkpoint every live session. Used at shutdown — close hooks do
    /// NOT fire; sessions resume from their checkpoints on next startup.
    pub fn checkpoint_all(&self) {
        let sessions: Vec<_> = self.live.lock().unwrap().values().cloned().collect();
        for arc in sessions {
            if let Ok(session) = arc.try_lock() {
                if let Err(e) = session.save_state() {
                    warn!(session = %session.id, error = %e, "shutdown checkpoint failed");
                }
            }
        }
    }
}

/// Plain-text transcript for the compaction prompt.
fn render_transcript(messages: &[ChatMessage]) -> String {
    let mut parts = Vec::new();
    for msg in messages {
        match msg.role {
            Role::User => parts.push(format!("User: {}", msg.text())),
            Role::Assistant => {
                let text = msg.text();
                if !text.is_empty() {
                    parts.push(format!("Assistant: {text}"));
                }
            }
            Role::ToolResults => {}
        }
    }
    parts.join("\n\n")
}

fn excerpt(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lucyd_core::provider::{CompletionResponse, ProviderError};
    use lucyd_core::types::Usage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SummaryProvider;

    #[async_trait]
    impl Provider for SummaryProvider {
        fn name(&self) -> &str {
            "summary"
        }
        fn format_system(&self, _b: &[SystemBlock]) -> serde_json::Value {
            serde_json::Value::Null
        }
        fn format_messages(&self, _m: &[ChatMessage]) -> serde_json::Value {
            serde_json::Value::Null
        }
        async fn complete(
            &self,
            _s: &serde_json::Value,
            _m: &serde_json::Value,
            _t: &[serde_json::Value],
        ) -> std::result::Result<CompletionResponse, ProviderError> {
            Ok(CompletionResponse {
                text: "They talked about many things.".to_string(),
                stop_reason: "end_turn".to_string(),
                tool_calls: Vec::new(),
                usage: Usage::default(),
            })
        }
    }

    #[tokio::test]
    async fn get_or_create_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let id;
        {
            let mgr = SessionManager::new(dir.path()).unwrap();
            let session = mgr.get_or_create("alice", "primary").unwrap();
            let mut s = session.lock().await;
            s.add_user_message("hi", "alice", "cli").unwrap();
            id = s.id.clone();
        }
        // New manager instance — same contact resumes the same session
        let mgr = SessionManager::new(dir.path()).unwrap();
        let session = mgr.get_or_create("alice", "primary").unwrap();
        let s = session.lock().await;
        assert_eq!(s.id, id);
        assert_eq!(s.messages.len(), 1);
    }

    #[tokio::test]
    async fn compaction_replaces_log_and_increments_count() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SessionManager::new(dir.path()).unwrap();
        let session = mgr.get_or_create("bob", "primary").unwrap();
        let mut s = session.lock().await;
        for i in 0..20 {
            if i % 2 == 0 {
                s.messages.push(ChatMessage::user(format!("q{i}")));
            } else {
                s.messages.push(ChatMessage::assistant(format!("a{i}"), Vec::new()));
            }
        }
        s.warned_about_compaction = true;

        mgr.compact_session(&mut s, &SummaryProvider, "Summarize.", 10)
            .await
            .unwrap();

        assert_eq!(s.messages.len(), 11);
        assert!(s.messages[0].text().starts_with("[Conversation summary]"));
        assert_eq!(s.compaction_count, 1);
        assert!(!s.warned_about_compaction);
        // Tail starts with q10 (user) — summary message is user-role, so
        // the two must have been merged or remain non-consecutive.
        let mut prev_user = false;
        for msg in &s.messages {
            let is_user = msg.role == Role::User;
            assert!(!(is_user && prev_user), "consecutive user messages after compaction");
            prev_user = is_user;
        }
    }

    #[tokio::test]
    async fn compaction_merges_leading_user_tail_into_summary() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SessionManager::new(dir.path()).unwrap();
        let session = mgr.get_or_create("carol", "primary").unwrap();
        let mut s = session.lock().await;
        s.messages.push(ChatMessage::user("old question"));
        s.messages.push(ChatMessage::assistant("old answer", Vec::new()));
        s.messages.push(ChatMessage::user("recent question"));

        mgr.compact_session(&mut s, &SummaryProvider, "Summarize.", 1)
            .await
            .unwrap();

        assert_eq!(s.messages.len(), 1);
        let text = s.messages[0].text();
        assert!(text.starts_with("[Conversation summary]"));
        assert!(text.contains("recent question"));
    }

    struct CountingHook {
        calls: AtomicUsize,
        saw_messages: AtomicUsize,
    }

    #[async_trait]
    impl SessionCloseHook for CountingHook {
        async fn on_close(&self, session: &Session) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.saw_messages
                .store(session.messages.len(), Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn close_fires_hook_before_archival_and_archives() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SessionManager::new(dir.path()).unwrap();
        let hook = Arc::new(CountingHook {
            calls: AtomicUsize::new(0),
            saw_messages: AtomicUsize::new(0),
        });
        mgr.on_close(hook.clone());

        let session = mgr.get_or_create("dave", "primary").unwrap();
        let id = {
            let mut s = session.lock().await;
            s.add_user_message("bye", "dave", "cli").unwrap();
            s.id.clone()
        };
        drop(session);

        assert!(mgr.close_session("dave").await.unwrap());
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
        // Hook saw the full log (fired before archival)
        assert_eq!(hook.saw_messages.load(Ordering::SeqCst), 1);
        assert!(dir.path().join("archive").join(format!("{id}.json")).exists());
        assert!(!dir.path().join(format!("{id}.json")).exists());
        // Closing again reports not found
        assert!(!mgr.close_session("dave").await.unwrap());
    }

    #[tokio::test]
    async fn close_by_id_resolves_contact() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SessionManager::new(dir.path()).unwrap();
        let session = mgr.get_or_create("erin", "primary").unwrap();
        let id = session.lock().await.id.clone();
        drop(session);

        assert!(mgr.close_session_by_id(&id).await.unwrap());
        assert!(!mgr.close_session_by_id(&id).await.unwrap());
    }

    #[tokio::test]
    async fn build_recall_reads_archived_predecessor() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SessionManager::new(dir.path()).unwrap();
        let session = mgr.get_or_create("fay", "primary").unwrap();
        {
            let mut s = session.lock().await;
            s.add_user_message("remember the lake house", "fay", "cli").unwrap();
            s.messages.push(ChatMessage::assistant("noted!", Vec::new()));
            s.save_state().unwrap();
        }
        drop(session);
        mgr.close_session("fay").await.unwrap();

        let recall = mgr.build_recall("fay");
        assert!(recall.contains("lake house"));
        assert!(recall.contains("assistant: noted!"));
        // Unknown contact yields empty recall
        assert_eq!(mgr.build_recall("nobody"), "");
    }
}
