//! Turn-by-turn progress files, written atomically (temp + rename) so
//! external watchers never read a torn JSON document.

use std::path::PathBuf;
use std::sync::Mutex;

use serde::Serialize;
use tracing::warn;

/// One completed turn, kept for the current message only.
#[derive(Debug, Clone, Serialize)]
pub struct TurnInfo {
    pub duration_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub stop_reason: String,
    pub tools: Vec<String>,
}

#[derive(Serialize)]
struct MonitorState<'a> {
    state: &'a str,
    contact: &'a str,
    session_id: &'a str,
    model: &'a str,
    turn: u32,
    tools_in_flight: &'a [String],
    turns: &'a [TurnInfo],
    updated_at: String,
}

/// Writer for `state/monitor.json`.
pub struct MonitorWriter {
    path: PathBuf,
    turns: Mutex<Vec<TurnInfo>>,
}

impl MonitorWriter {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            turns: Mutex::new(Vec::new()),
        }
    }

    /// Reset turn history at the start of a new message.
    pub fn begin_message(&self) {
        self.turns.lock().unwrap().clear();
    }

    pub fn push_turn(&self, turn: TurnInfo) {
        self.turns.lock().unwrap().push(turn);
    }

    pub fn write(
        &self,
        state: &str,
        contact: &str,
        session_id: &str,
        model: &str,
        turn: u32,
        tools_in_flight: &[String],
    ) {
        let turns = self.turns.lock().unwrap().clone();
        let doc = MonitorState {
            state,
            contact,
            session_id,
            model,
            turn,
            tools_in_flight,
            turns: &turns,
            updated_at: chrono::Utc::now().to_rfc3339(),
        };
        if let Err(e) = write_atomic(&self.path, &doc) {
            warn!(error = %e, "monitor write failed");
        }
    }
}

/// Serialize and write via temp + rename.
pub fn write_atomic<T: Serialize>(path: &PathBuf, value: &T) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_vec(value)?)?;
    std::fs::rename(&tmp, path)
}
