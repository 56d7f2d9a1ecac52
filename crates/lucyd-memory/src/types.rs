use serde::{Deserialize, Serialize};

/// One entity-attribute-value fact.
///
/// For any (entity, attribute) pair, at most one row is current
/// (`invalidated_at` null). Updates invalidate the prior row and insert a
/// fresh one, so history is preserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: i64,
    pub entity: String,
    pub attribute: String,
    pub value: String,
    pub confidence: f64,
    pub source_session: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub accessed_at: String,
    pub invalidated_at: Option<String>,
}

/// A narrative session summary produced by consolidation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: i64,
    pub session_id: String,
    /// ISO date (YYYY-MM-DD).
    pub date: String,
    pub topics: Vec<String>,
    pub decisions: Vec<String>,
    pub summary: String,
    pub emotional_tone: String,
}

/// Commitment lifecycle. Transitions only leave `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitmentStatus {
    Open,
    Done,
    Expired,
    Cancelled,
}

impl std::fmt::Display for CommitmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Done => write!(f, "done"),
            Self::Expired => write!(f, "expired"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for CommitmentStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "done" => Ok(Self::Done),
            "expired" => Ok(Self::Expired),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown commitment status: {other}")),
        }
    }
}

/// A tracked promise or obligation, linked to its source episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commitment {
    pub id: i64,
    pub episode_id: Option<i64>,
    pub who: String,
    pub what: String,
    pub deadline: Option<String>,
    pub status: CommitmentStatus,
    pub created_at: String,
}

/// Per-session consolidation progress marker.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsolidationState {
    pub last_compaction_count: u32,
    pub last_message_count: usize,
}

/// One search hit from the indexed chunks.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkHit {
    pub id: String,
    pub path: String,
    pub source: Option<String>,
    pub text: String,
    pub score: f64,
    pub days_old: f64,
}

/// One assembled recall section, ephemeral per query.
#[derive(Debug, Clone, PartialEq)]
pub struct RecallBlock {
    /// Higher priority is kept longer under budget pressure.
    pub priority: i32,
    /// Section label, e.g. "[Known facts]".
    pub section: String,
    pub text: String,
    /// len(text) / 4 — coarse but stable.
    pub est_tokens: usize,
}

impl RecallBlock {
    pub fn new(priority: i32, section: impl Into<String>, text: String) -> Self {
        let est_tokens = text.len() / 4;
        Self {
            priority,
            section: section.into(),
            text,
            est_tokens,
        }
    }
}
