//! Consolidation — extract structured data from conversations and files.
//!
//! Facts (entity-attribute-value), episodes (narrative summaries), and
//! commitments (trackable promises) are extracted from session message
//! ranges and stored in the memory database. Progress markers make every
//! pass incremental and idempotent; all writes of one pass share a single
//! transaction.

use std::path::Path;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use lucyd_core::provider::Provider;
use lucyd_core::types::{ChatMessage, Role, SystemBlock};

use crate::error::MemoryError;
use crate::store::{normalize_entity, MemoryStore};

/// Extraction text budget (~12k tokens, within a small model's window).
pub const MAX_EXTRACTION_CHARS: usize = 50_000;
/// Per-tool-output truncation inside the serialized transcript.
const MAX_TOOL_OUTPUT: usize = 2_000;

const FACT_EXTRACTION_PROMPT: &str = r#"Extract factual information from this text as JSON.
Return ONLY valid JSON, no markdown fences, no preamble.

Schema:
{"facts": [
  {"entity": "lowercase_name", "attribute": "lowercase_attr",
   "value": "the fact", "confidence": 0.0-1.0}
],
"aliases": [
  {"alias": "alternative_name", "canonical": "primary_entity_name"}
]}

Rules:
- Only extract facts explicitly stated or strongly implied
- Entity names: use the shortest common name as the canonical entity
  (anna not anna_gruber, max not max_berger). Lowercase, underscores
  for spaces.
- Attributes: lowercase, descriptive (lives_in, role, preference)
- Confidence: 1.0 = directly stated, 0.8 = strongly implied, 0.6 = weakly implied
- Below 0.6 = do not extract
- When a person or thing is referred to by multiple names, include alias entries
  mapping each alternative name to the primary entity name
- Also include component-word aliases for multi-word entities:
  e.g. entity "uncle_charles" gets aliases "uncle" and "charles"
  pointing to "uncle_charles"
- If nothing worth extracting, return {"facts": [], "aliases": []}
"#;

const EPISODE_EXTRACTION_SYSTEM: &str = r#"You are performing a structured data extraction task.
You MUST respond with ONLY valid JSON. No prose, no roleplay, no conversation, no markdown fences.

The following persona context describes the agent whose perspective
to use when writing the episode summary. Use it for voice and tone
only — do not adopt this identity or respond in character:

---
{persona_context}
---

Now extract an episode summary from the conversation text the user provides.

Return ONLY valid JSON matching this schema:

{"episode": {
  "topics": ["topic1", "topic2"],
  "decisions": ["decision made"],
  "commitments": [
    {"who": "name", "what": "the commitment", "deadline": "YYYY-MM-DD or null"}
  ],
  "summary": "2-3 sentences describing what happened, written from the agent's perspective",
  "emotional_tone": "one word or short phrase"
}}

If the conversation was trivial or purely mechanical, return:
{"episode": {"topics": [], "decisions": [], "commitments": [],
  "summary": "Brief mechanical exchange.", "emotional_tone": "neutral"}}"#;

/// Result of one consolidation pass.
#[derive(Debug, Clone, Default)]
pub struct ConsolidationOutcome {
    pub facts_added: usize,
    pub episode_id: Option<i64>,
}

// ─── State tracking ──────────────────────────────────────────────

/// Return (start_idx, end_idx) of messages needing consolidation.
///
/// Handles all lifecycle states:
/// - first run: process everything
/// - normal accumulation: process new messages only
/// - post-compaction: skip the summary message at index 0, process rest
/// - no new content: (0, 0)
pub fn get_unprocessed_range(
    session_id: &str,
    message_count: usize,
    compaction_count: u32,
    store: &MemoryStore,
) -> Result<(usize, usize), MemoryError> {
    let Some(state) = store.consolidation_state(session_id)? else {
        return Ok((0, message_count));
    };

    if compaction_count > state.last_compaction_count {
        // Compaction happened since last consolidation. Index 0 is the
        // summary of already-processed content.
        return Ok((1, message_count));
    }

    if message_count > state.last_message_count {
        return Ok((state.last_message_count, message_count));
    }

    Ok((0, 0))
}

// ─── Message serializer ──────────────────────────────────────────

/// Serialize a range of session messages to plain text for extraction.
///
/// If total output exceeds `max_chars`, oldest messages in the range are
/// dropped first (keep most recent).
pub fn serialize_messages(
    messages: &[ChatMessage],
    start_idx: usize,
    end_idx: usize,
    max_chars: usize,
) -> String {
    if start_idx >= end_idx || start_idx >= messages.len() {
        return String::new();
    }
    let end_idx = end_idx.min(messages.len());

    let mut parts: Vec<String> = Vec::new();
    for msg in &messages[start_idx..end_idx] {
        match msg.role {
            Role::User => {
                parts.push(format!("Human: {}", msg.text()));
            }
            Role::Assistant => {
                let text = msg.text();
                if !text.is_empty() {
                    parts.push(format!("Assistant: {text}"));
                }
                for tc in &msg.tool_calls {
                    let args = truncate_chars(&tc.arguments.to_string(), MAX_TOOL_OUTPUT);
                    parts.push(format!("Tool call: {}({})", tc.name, args));
                }
            }
            Role::ToolResults => {
                for r in &msg.results {
                    parts.push(format!(
                        "Tool result: {}",
                        truncate_chars(&r.content, MAX_TOOL_OUTPUT)
                    ));
                }
            }
        }
    }

    if parts.is_empty() {
        return String::new();
    }

    let mut result = parts.join("\n\n");
    while result.len() > max_chars && parts.len() > 1 {
        parts.remove(0);
        result = parts.join("\n\n");
    }
    result
}

/// Strip markdown code fences around a JSON payload.
pub fn strip_json_fences(text: &str) -> &str {
    let mut text = text.trim();
    if let Some(rest) = text.strip_prefix("```json") {
        text = rest;
    } else if let Some(rest) = text.strip_prefix("```") {
        text = rest;
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    text.trim()
}

// ─── Fact extraction ─────────────────────────────────────────────

#[derive(Deserialize, Default)]
struct FactPayload {
    #[serde(default)]
    facts: Vec<FactEntry>,
    #[serde(default)]
    aliases: Vec<AliasEntry>,
}

#[derive(Deserialize)]
struct FactEntry {
    #[serde(default)]
    entity: String,
    #[serde(default)]
    attribute: String,
    #[serde(default)]
    value: String,
    #[serde(default)]
    confidence: f64,
}

#[derive(Deserialize)]
struct AliasEntry {
    #[serde(default)]
    alias: String,
    #[serde(default)]
    canonical: String,
}

/// Extract facts from text and store them. Returns the count of
/// new/updated facts. Invalid model output yields zero facts, no error;
/// database failures propagate so the enclosing transaction rolls back.
pub async fn extract_facts(
    text: &str,
    session_id: &str,
    provider: &dyn Provider,
    store: &MemoryStore,
    confidence_threshold: f64,
) -> Result<usize, MemoryError> {
    let system = provider.format_system(&[SystemBlock::new(
        FACT_EXTRACTION_PROMPT,
        lucyd_core::types::CacheTier::Stable,
    )]);
    let messages = provider.format_messages(&[ChatMessage::user(text)]);

    let response = match provider.complete(&system, &messages, &[]).await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "fact extraction LLM call failed");
            return Ok(0);
        }
    };

    let raw = strip_json_fences(&response.text);
    let payload: FactPayload = match serde_json::from_str(raw) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, raw = %truncate_chars(raw, 200), "fact extraction returned invalid JSON");
            return Ok(0);
        }
    };

    // Aliases are stored FIRST so entity resolution works for new
    // entities extracted in the same batch.
    for alias in &payload.aliases {
        store.add_alias(&alias.alias, &alias.canonical)?;
    }

    let mut count = 0;
    for fact in &payload.facts {
        if fact.confidence < confidence_threshold {
            continue;
        }
        let entity = normalize_entity(&fact.entity);
        let attribute = normalize_entity(&fact.attribute);
        if entity.is_empty() || attribute.is_empty() || fact.value.is_empty() {
            continue;
        }
        let entity = store.resolve_entity(&entity)?;
        match store.upsert_fact(&entity, &attribute, &fact.value, fact.confidence, session_id)? {
            crate::store::FactWrite::Unchanged => {}
            _ => count += 1,
        }
    }
    Ok(count)
}

// ─── Episode extraction ──────────────────────────────────────────

#[derive(Deserialize, Default)]
struct EpisodePayload {
    #[serde(default)]
    episode: EpisodeEntry,
}

#[derive(Deserialize, Default)]
struct EpisodeEntry {
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    decisions: Vec<String>,
    #[serde(default)]
    commitments: Vec<CommitmentEntry>,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    emotional_tone: String,
}

#[derive(Deserialize, serde::Serialize)]
struct CommitmentEntry {
    #[serde(default)]
    who: String,
    #[serde(default)]
    what: String,
    #[serde(default)]
    deadline: Option<String>,
}

/// Extract an episode summary and its commitments. Returns the episode
/// id, or None when extraction failed or the episode was trivial.
pub async fn extract_episode(
    text: &str,
    session_id: &str,
    provider: &dyn Provider,
    persona_blocks: &[SystemBlock],
    store: &MemoryStore,
) -> Result<Option<i64>, MemoryError> {
    // Persona blocks are flattened into the extraction prompt: voice
    // only, not identity.
    let persona_text = persona_blocks
        .iter()
        .map(|b| b.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let system_text = EPISODE_EXTRACTION_SYSTEM.replace("{persona_context}", &persona_text);

    let system = provider.format_system(&[SystemBlock::new(
        system_text,
        lucyd_core::types::CacheTier::Stable,
    )]);
    let messages = provider.format_messages(&[ChatMessage::user(text)]);

    let response = match provider.complete(&system, &messages, &[]).await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "episode extraction LLM call failed");
            return Ok(None);
        }
    };

    let raw = strip_json_fences(&response.text);
    let payload: EpisodePayload = match serde_json::from_str(raw) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, raw = %truncate_chars(raw, 200), "episode extraction returned invalid JSON");
            return Ok(None);
        }
    };

    let ep = payload.episode;
    let trivial = ep.topics.is_empty()
        && ep.decisions.is_empty()
        && ep.commitments.is_empty()
        && ep.emotional_tone == "neutral";
    if trivial || ep.summary.is_empty() {
        return Ok(None);
    }

    let commitments_json = serde_json::to_string(&ep.commitments).unwrap_or_default();
    let episode_id = store.insert_episode(
        session_id,
        &ep.topics,
        &ep.decisions,
        &commitments_json,
        &ep.summary,
        &ep.emotional_tone,
    )?;

    for c in &ep.commitments {
        // Models sometimes emit the string "null" instead of JSON null.
        let deadline = c.deadline.as_deref().filter(|d| *d != "null");
        if !c.who.is_empty() && !c.what.is_empty() {
            store.insert_commitment(episode_id, &c.who, &c.what, deadline)?;
        }
    }

    Ok(Some(episode_id))
}

// ─── Entry points ────────────────────────────────────────────────

/// Parameters shared by the session consolidation entry point.
pub struct SessionPass<'a> {
    pub session_id: &'a str,
    pub messages: &'a [ChatMessage],
    pub compaction_count: u32,
    pub min_messages: usize,
    pub max_extraction_chars: usize,
    pub confidence_threshold: f64,
}

/// Run full consolidation on a session's unprocessed message range.
///
/// All writes share one transaction: on any failure the transaction rolls
/// back, the error propagates, and the consolidation state is untouched —
/// the next pass retries the same range.
pub async fn consolidate_session(
    pass: SessionPass<'_>,
    subagent_provider: &dyn Provider,
    primary_provider: &dyn Provider,
    persona_blocks: &[SystemBlock],
    store: &MemoryStore,
) -> Result<ConsolidationOutcome, MemoryError> {
    let (start_idx, end_idx) = get_unprocessed_range(
        pass.session_id,
        pass.messages.len(),
        pass.compaction_count,
        store,
    )?;
    if end_idx <= start_idx {
        return Ok(ConsolidationOutcome::default());
    }
    if end_idx - start_idx < pass.min_messages {
        return Ok(ConsolidationOutcome::default());
    }

    let text = serialize_messages(pass.messages, start_idx, end_idx, pass.max_extraction_chars);
    if text.trim().is_empty() {
        return Ok(ConsolidationOutcome::default());
    }

    store.begin()?;
    let result: Result<ConsolidationOutcome, MemoryError> = async {
        let facts_added = extract_facts(
            &text,
            pass.session_id,
            subagent_provider,
            store,
            pass.confidence_threshold,
        )
        .await?;

        let episode_id =
            extract_episode(&text, pass.session_id, primary_provider, persona_blocks, store)
                .await?;

        store.set_consolidation_state(
            pass.session_id,
            pass.compaction_count,
            pass.messages.len(),
        )?;

        Ok(ConsolidationOutcome {
            facts_added,
            episode_id,
        })
    }
    .await;

    match result {
        Ok(outcome) => {
            store.commit()?;
            Ok(outcome)
        }
        Err(e) => {
            store.rollback();
            Err(e)
        }
    }
}

/// Extract facts from a workspace file, skipping unchanged content by
/// hash. Only facts — episodes come from conversations.
pub async fn consolidate_file(
    file_path: &str,
    provider: &dyn Provider,
    store: &MemoryStore,
    confidence_threshold: f64,
) -> Result<usize, MemoryError> {
    let path = Path::new(file_path);
    if !path.exists() {
        return Ok(0);
    }

    let content = std::fs::read_to_string(path)?;
    let content_hash = {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        hex::encode(hasher.finalize())
    };

    if store.file_hash(file_path)?.as_deref() == Some(content_hash.as_str()) {
        return Ok(0);
    }

    store.begin()?;
    let result: Result<usize, MemoryError> = async {
        let count = extract_facts(
            &content,
            &format!("file:{file_path}"),
            provider,
            store,
            confidence_threshold,
        )
        .await?;
        store.set_file_hash(file_path, &content_hash)?;
        Ok(count)
    }
    .await;

    match result {
        Ok(count) => {
            store.commit()?;
            Ok(count)
        }
        Err(e) => {
            store.rollback();
            Err(e)
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}
