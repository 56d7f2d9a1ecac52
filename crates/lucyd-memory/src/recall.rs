//! Recall — priority-budgeted context assembly.
//!
//! Three-stage retrieval (facts → episodes → vector fallback) plus the
//! always-included open commitments, assembled into sections and trimmed
//! to a token budget, dropping lowest-priority sections first.

use std::collections::BTreeSet;

use tracing::debug;

use lucyd_core::config::RecallConfig;

use crate::error::MemoryError;
use crate::store::{normalize_entity, MemoryStore};
use crate::types::{Commitment, Episode, Fact, RecallBlock};

/// Shown by the memory_search tool when nothing matched anywhere.
pub const EMPTY_RECALL_FALLBACK: &str =
    "No results found in structured memory or vector search. \
     Try memory_get with workspace-relative paths (e.g., 'memory/YYYY-MM-DD.md', 'MEMORY.md') \
     to check memory files directly.";

fn strip_token(word: &str) -> &str {
    word.trim_matches(|c: char| "?.,!\"'()".contains(c))
}

/// Extract known entity names from a natural-language query.
///
/// Candidates are unigrams, bigrams, and trigrams (underscore-joined,
/// punctuation stripped); each is probed against the facts table and the
/// alias table. Returned set is sorted for deterministic lookups.
pub fn extract_query_entities(
    query: &str,
    store: &MemoryStore,
) -> Result<Vec<String>, MemoryError> {
    let lowered = query.to_lowercase().replace("'s", "");
    let words: Vec<&str> = lowered.split_whitespace().collect();

    let mut candidates: Vec<String> = Vec::new();
    for w in &words {
        candidates.push(strip_token(w).to_string());
    }
    for pair in words.windows(2) {
        candidates.push(format!("{}_{}", strip_token(pair[0]), strip_token(pair[1])));
    }
    for triple in words.windows(3) {
        candidates.push(format!(
            "{}_{}_{}",
            strip_token(triple[0]),
            strip_token(triple[1]),
            strip_token(triple[2])
        ));
    }

    let mut entities = BTreeSet::new();
    for candidate in candidates {
        if candidate.is_empty() {
            continue;
        }
        if store.entity_exists(&candidate)? {
            entities.insert(candidate.clone());
        }
        let canonical = store.resolve_entity(&candidate)?;
        if canonical != normalize_entity(&candidate) {
            entities.insert(canonical);
        }
    }
    Ok(entities.into_iter().collect())
}

fn format_fact(f: &Fact, fmt: &str) -> String {
    if fmt == "compact" {
        return format!("  {}.{}: {}", f.entity, f.attribute, f.value);
    }
    format!(
        "  {} — {}: {}",
        f.entity.replace('_', " "),
        f.attribute.replace('_', " "),
        f.value
    )
}

fn format_episode(e: &Episode, show_tone: bool) -> String {
    if show_tone && !e.emotional_tone.is_empty() && e.emotional_tone.to_lowercase() != "neutral" {
        format!("  [{}] {} (tone: {})", e.date, e.summary, e.emotional_tone)
    } else {
        format!("  [{}] {}", e.date, e.summary)
    }
}

fn format_commitment(c: &Commitment) -> String {
    let deadline = c
        .deadline
        .as_deref()
        .map(|d| format!(" (by {d})"))
        .unwrap_or_default();
    format!("  #{} - {}: {}{}", c.id, c.who, c.what, deadline)
}

fn commitments_block(store: &MemoryStore, priority: i32) -> Result<Option<RecallBlock>, MemoryError> {
    let commitments = store.open_commitments()?;
    if commitments.is_empty() {
        return Ok(None);
    }
    let text = commitments
        .iter()
        .map(format_commitment)
        .collect::<Vec<_>>()
        .join("\n");
    Ok(Some(RecallBlock::new(priority, "[Open commitments]", text)))
}

/// Query-driven recall: facts, episodes, vector snippets, commitments.
///
/// Returns blocks sorted by priority descending, ready for
/// [`inject_recall`].
pub async fn recall(
    query: &str,
    store: &MemoryStore,
    cfg: &RecallConfig,
    top_k: usize,
) -> Result<Vec<RecallBlock>, MemoryError> {
    let mut blocks: Vec<RecallBlock> = Vec::new();

    // Stage 1: structured fact lookup
    let entities = extract_query_entities(query, store)?;
    if !entities.is_empty() {
        let facts = store.lookup_facts(&entities, cfg.max_facts)?;
        if !facts.is_empty() {
            let text = facts
                .iter()
                .map(|f| format_fact(f, &cfg.fact_format))
                .collect::<Vec<_>>()
                .join("\n");
            blocks.push(RecallBlock::new(cfg.priority_facts, "[Known facts]", text));
        }
    }

    // Stage 2: episode search over tokens long enough to be topical
    let keywords: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .filter(|w| w.len() > 3)
        .map(|w| w.to_string())
        .collect();
    if !keywords.is_empty() {
        let episodes = store.search_episodes(&keywords, None, cfg.max_episodes_at_start)?;
        if !episodes.is_empty() {
            let text = episodes
                .iter()
                .map(|e| format_episode(e, cfg.show_emotional_tone))
                .collect::<Vec<_>>()
                .join("\n");
            blocks.push(RecallBlock::new(
                cfg.priority_episodes,
                format!("[{}]", cfg.episode_section_header),
                text,
            ));
        }
    }

    // Stage 3: vector search with recency decay. No pre-throttle —
    // inject_recall handles budget overflow by dropping low-priority
    // blocks.
    let mut hits = store.search(query, Some(top_k)).await?;
    if !hits.is_empty() {
        for hit in &mut hits {
            hit.score *= (-cfg.decay_rate * hit.days_old).exp();
        }
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        let text = hits
            .iter()
            .take(top_k)
            .map(|h| format!("  {}", truncate_chars(&h.text, 200)))
            .collect::<Vec<_>>()
            .join("\n");
        blocks.push(RecallBlock::new(cfg.priority_vector, "[Memory search]", text));
    }

    // Stage 4: open commitments, always included
    if let Some(block) = commitments_block(store, cfg.priority_commitments)? {
        blocks.push(block);
    }

    blocks.sort_by(|a, b| b.priority.cmp(&a.priority));
    Ok(blocks)
}

/// Apply the token budget to priority-sorted blocks.
///
/// Greedily appends blocks whose estimate fits the remaining budget and
/// drops the rest. The footer names included sections, tokens used, and
/// dropped sections so the agent knows what to fetch via memory tools.
pub fn inject_recall(blocks: &[RecallBlock], max_tokens: usize) -> String {
    let mut result: Vec<String> = Vec::new();
    let mut included: Vec<String> = Vec::new();
    let mut dropped: Vec<String> = Vec::new();
    let mut remaining = max_tokens;

    for block in blocks {
        if block.est_tokens <= remaining {
            result.push(format!("{}\n{}", block.section, block.text));
            included.push(block.section.trim_matches(['[', ']']).to_string());
            remaining -= block.est_tokens;
        } else {
            dropped.push(block.section.trim_matches(['[', ']']).to_string());
        }
    }

    if result.is_empty() {
        debug!(budget = max_tokens, "recall budget: no blocks included");
        return String::new();
    }

    let used = max_tokens - remaining;
    debug!(
        included = %included.join(", "),
        used,
        budget = max_tokens,
        dropped = %dropped.join(", "),
        "recall budget applied"
    );

    let mut footer = format!(
        "[Memory loaded: {} | {}/{} tokens used]",
        included.join(", "),
        used,
        max_tokens
    );
    if !dropped.is_empty() {
        footer.push_str(&format!(
            "\n[Dropped (over budget): {} — use memory_search to access]",
            dropped.join(", ")
        ));
    }
    result.push(footer);
    result.join("\n\n")
}

/// Unconditional warm-up context for the first message of a session:
/// most-recently-accessed facts, recent episodes, all open commitments.
pub fn session_start_context(
    store: &MemoryStore,
    cfg: &RecallConfig,
) -> Result<String, MemoryError> {
    let mut blocks: Vec<RecallBlock> = Vec::new();

    let facts = store.recent_facts(cfg.max_facts)?;
    if !facts.is_empty() {
        let text = facts
            .iter()
            .map(|f| format_fact(f, &cfg.fact_format))
            .collect::<Vec<_>>()
            .join("\n");
        blocks.push(RecallBlock::new(cfg.priority_facts, "[Known facts]", text));
    }

    let episodes = store.recent_episodes(cfg.max_episodes_at_start)?;
    if !episodes.is_empty() {
        let text = episodes
            .iter()
            .map(|e| format_episode(e, cfg.show_emotional_tone))
            .collect::<Vec<_>>()
            .join("\n");
        blocks.push(RecallBlock::new(
            cfg.priority_episodes,
            format!("[{}]", cfg.episode_section_header),
            text,
        ));
    }

    if let Some(block) = commitments_block(store, cfg.priority_commitments)? {
        blocks.push(block);
    }

    blocks.sort_by(|a, b| b.priority.cmp(&a.priority));
    Ok(inject_recall(&blocks, cfg.max_dynamic_tokens))
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}
