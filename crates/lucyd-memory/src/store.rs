use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, warn};

use crate::embed::{cosine_sim, hash_text, EmbeddingClient};
use crate::error::MemoryError;
use crate::schema;
use crate::types::*;

/// Hard cap on rows scanned by the vector fallback.
const VECTOR_SEARCH_LIMIT: usize = 10_000;

/// Result of a fact upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactWrite {
    /// Same value already current — only `accessed_at` was touched.
    Unchanged,
    /// Prior value invalidated, new row inserted.
    Updated,
    /// No prior row — fresh insert.
    Inserted,
}

/// Normalize an entity or attribute name: lowercase, trimmed, underscores
/// for spaces.
pub fn normalize_entity(name: &str) -> String {
    name.to_lowercase().trim().replace(' ', "_")
}

/// Persistent structured memory over a single SQLite connection.
///
/// Thread-safe via `Mutex<Connection>`; the daemon's single-pipeline
/// scheduling means contention is negligible. Consolidation passes wrap
/// their writes in an explicit BEGIN/COMMIT through [`MemoryStore::begin`].
pub struct MemoryStore {
    db: Mutex<Connection>,
    embedding: Option<EmbeddingClient>,
    top_k: usize,
}

impl MemoryStore {
    pub fn open(
        path: &Path,
        embedding: Option<EmbeddingClient>,
        top_k: usize,
    ) -> Result<Self, MemoryError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        schema::ensure_schema(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            embedding,
            top_k,
        })
    }

    /// Ephemeral in-memory store — tests and embedders that want recall
    /// without persistence.
    pub fn open_in_memory() -> Result<Self, MemoryError> {
        let conn = Connection::open_in_memory()?;
        schema::ensure_schema(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            embedding: None,
            top_k: 10,
        })
    }

    // ─── Transaction control ─────────────────────────────────────

    /// Open an explicit transaction spanning multiple store calls.
    pub fn begin(&self) -> Result<(), MemoryError> {
        self.db.lock().unwrap().execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    pub fn commit(&self) -> Result<(), MemoryError> {
        self.db.lock().unwrap().execute_batch("COMMIT")?;
        Ok(())
    }

    /// Roll back the open transaction. Failure here is swallowed — there
    /// is nothing more to do, and the outer error is what matters.
    pub fn rollback(&self) {
        if let Err(e) = self.db.lock().unwrap().execute_batch("ROLLBACK") {
            warn!(error = %e, "rollback failed");
        }
    }

    // ─── Facts ───────────────────────────────────────────────────

    /// Apply the upsert invariant for one fact.
    ///
    /// The entity must already be alias-resolved and normalized.
    pub fn upsert_fact(
        &self,
        entity: &str,
        attribute: &str,
        value: &str,
        confidence: f64,
        source_session: &str,
    ) -> Result<FactWrite, MemoryError> {
        let db = self.db.lock().unwrap();
        let existing: Option<(i64, String)> = db
            .query_row(
                "SELECT id, value FROM facts
                 WHERE entity = ?1 AND attribute = ?2 AND invalidated_at IS NULL",
                rusqlite::params![entity, attribute],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();

        let write = match existing {
            Some((id, old_value)) if old_value == value => {
                db.execute(
                    "UPDATE facts SET accessed_at = datetime('now') WHERE id = ?1",
                    rusqlite::params![id],
                )?;
                return Ok(FactWrite::Unchanged);
            }
            Some((id, _)) => {
                db.execute(
                    "UPDATE facts SET invalidated_at = datetime('now') WHERE id = ?1",
                    rusqlite::params![id],
                )?;
                FactWrite::Updated
            }
            None => FactWrite::Inserted,
        };

        db.execute(
            "INSERT INTO facts (entity, attribute, value, confidence, source_session)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![entity, attribute, value, confidence, source_session],
        )?;
        Ok(write)
    }

    /// Soft-delete the current fact for (entity, attribute).
    pub fn invalidate_fact(&self, entity: &str, attribute: &str) -> Result<bool, MemoryError> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE facts SET invalidated_at = datetime('now')
             WHERE entity = ?1 AND attribute = ?2 AND invalidated_at IS NULL",
            rusqlite::params![normalize_entity(entity), normalize_entity(attribute)],
        )?;
        Ok(changed > 0)
    }

    /// Whether any current fact exists for this entity.
    pub fn entity_exists(&self, entity: &str) -> Result<bool, MemoryError> {
        let db = self.db.lock().unwrap();
        let found = db
            .query_row(
                "SELECT 1 FROM facts WHERE entity = ?1 AND invalidated_at IS NULL LIMIT 1",
                rusqlite::params![entity],
                |_| Ok(()),
            )
            .is_ok();
        Ok(found)
    }

    /// Current facts for the given entities, confidence-desc, touching
    /// `accessed_at` on every returned row.
    pub fn lookup_facts(
        &self,
        entities: &[String],
        max_results: usize,
    ) -> Result<Vec<Fact>, MemoryError> {
        if entities.is_empty() {
            return Ok(Vec::new());
        }
        let db = self.db.lock().unwrap();
        let placeholders = vec!["?"; entities.len()].join(",");
        let sql = format!(
            "SELECT id, entity, attribute, value, confidence, source_session,
                    created_at, updated_at, accessed_at, invalidated_at
             FROM facts
             WHERE entity IN ({placeholders}) AND invalidated_at IS NULL
             ORDER BY confidence DESC
             LIMIT ?"
        );
        let mut stmt = db.prepare(&sql)?;
        let max = max_results as i64;
        let mut params: Vec<&dyn rusqlite::ToSql> = entities
            .iter()
            .map(|e| e as &dyn rusqlite::ToSql)
            .collect();
        params.push(&max);

        let facts: Vec<Fact> = stmt
            .query_map(params.as_slice(), row_to_fact)?
            .filter_map(|r| r.ok())
            .collect();

        if !facts.is_empty() {
            let ids = facts
                .iter()
                .map(|f| f.id.to_string())
                .collect::<Vec<_>>()
                .join(",");
            db.execute(
                &format!("UPDATE facts SET accessed_at = datetime('now') WHERE id IN ({ids})"),
                [],
            )?;
        }
        Ok(facts)
    }

    /// Most recently accessed current facts (session-start warm-up).
    pub fn recent_facts(&self, max_results: usize) -> Result<Vec<Fact>, MemoryError> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, entity, attribute, value, confidence, source_session,
                    created_at, updated_at, accessed_at, invalidated_at
             FROM facts
             WHERE invalidated_at IS NULL
             ORDER BY accessed_at DESC
             LIMIT ?1",
        )?;
        let facts = stmt
            .query_map(rusqlite::params![max_results as i64], row_to_fact)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(facts)
    }

    // ─── Aliases ─────────────────────────────────────────────────

    /// Store one alias → canonical mapping. Both sides are normalized;
    /// self-referential mappings are skipped.
    pub fn add_alias(&self, alias: &str, canonical: &str) -> Result<(), MemoryError> {
        let alias = normalize_entity(alias);
        let canonical = normalize_entity(canonical);
        if alias.is_empty() || canonical.is_empty() || alias == canonical {
            return Ok(());
        }
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO entity_aliases (alias, canonical) VALUES (?1, ?2)",
            rusqlite::params![alias, canonical],
        )?;
        Ok(())
    }

    /// Resolve a name through the alias table; unknown names resolve to
    /// their own normalized form, making resolution idempotent.
    pub fn resolve_entity(&self, name: &str) -> Result<String, MemoryError> {
        let normalized = normalize_entity(name);
        let db = self.db.lock().unwrap();
        let canonical = db
            .query_row(
                "SELECT canonical FROM entity_aliases WHERE alias = ?1",
                rusqlite::params![normalized],
                |row| row.get::<_, String>(0),
            )
            .unwrap_or(normalized);
        Ok(canonical)
    }

    // ─── Episodes ────────────────────────────────────────────────

    pub fn insert_episode(
        &self,
        session_id: &str,
        topics: &[String],
        decisions: &[String],
        commitments_json: &str,
        summary: &str,
        emotional_tone: &str,
    ) -> Result<i64, MemoryError> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO episodes (session_id, topics, decisions, commitments, summary, emotional_tone)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                session_id,
                serde_json::to_string(topics).unwrap_or_default(),
                serde_json::to_string(decisions).unwrap_or_default(),
                commitments_json,
                summary,
                emotional_tone,
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    /// Keyword search over topics OR summary, newest first.
    pub fn search_episodes(
        &self,
        keywords: &[String],
        days_back: Option<u32>,
        max_results: usize,
    ) -> Result<Vec<Episode>, MemoryError> {
        let mut conditions: Vec<String> = Vec::new();
        let mut params: Vec<String> = Vec::new();

        if let Some(days) = days_back {
            conditions.push("date >= date('now', ?)".to_string());
            params.push(format!("-{days} days"));
        }

        if !keywords.is_empty() {
            let kw_conditions: Vec<String> = keywords
                .iter()
                .map(|_| "(topics LIKE ? OR summary LIKE ?)".to_string())
                .collect();
            for kw in keywords {
                params.push(format!("%{kw}%"));
                params.push(format!("%{kw}%"));
            }
            conditions.push(format!("({})", kw_conditions.join(" OR ")));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let sql = format!(
            "SELECT id, session_id, date, topics, decisions, summary, emotional_tone
             FROM episodes {where_clause}
             ORDER BY date DESC LIMIT {max_results}"
        );

        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&sql)?;
        let episodes = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), row_to_episode)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(episodes)
    }

    /// Most recent episodes regardless of keywords.
    pub fn recent_episodes(&self, max_results: usize) -> Result<Vec<Episode>, MemoryError> {
        self.search_episodes(&[], None, max_results)
    }

    // ─── Commitments ─────────────────────────────────────────────

    pub fn insert_commitment(
        &self,
        episode_id: i64,
        who: &str,
        what: &str,
        deadline: Option<&str>,
    ) -> Result<i64, MemoryError> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO commitments (episode_id, who, what, deadline) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![episode_id, who, what, deadline],
        )?;
        Ok(db.last_insert_rowid())
    }

    /// All open commitments: dated ones first by deadline, then undated
    /// by recency.
    pub fn open_commitments(&self) -> Result<Vec<Commitment>, MemoryError> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, episode_id, who, what, deadline, status, created_at
             FROM commitments
             WHERE status = 'open'
             ORDER BY deadline IS NULL, deadline ASC, created_at DESC",
        )?;
        let commitments = stmt
            .query_map([], row_to_commitment)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(commitments)
    }

    /// Transition an open commitment. Only `open` rows are affected;
    /// anything else reports `CommitmentNotOpen`.
    pub fn update_commitment_status(
        &self,
        id: i64,
        status: CommitmentStatus,
    ) -> Result<(), MemoryError> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE commitments SET status = ?1 WHERE id = ?2 AND status = 'open'",
            rusqlite::params![status.to_string(), id],
        )?;
        if changed == 0 {
            return Err(MemoryError::CommitmentNotOpen(id));
        }
        Ok(())
    }

    // ─── Consolidation state ─────────────────────────────────────

    pub fn consolidation_state(
        &self,
        session_id: &str,
    ) -> Result<Option<ConsolidationState>, MemoryError> {
        let db = self.db.lock().unwrap();
        let state = db
            .query_row(
                "SELECT last_compaction_count, last_message_count
                 FROM consolidation_state WHERE session_id = ?1",
                rusqlite::params![session_id],
                |row| {
                    Ok(ConsolidationState {
                        last_compaction_count: row.get::<_, i64>(0)? as u32,
                        last_message_count: row.get::<_, i64>(1)? as usize,
                    })
                },
            )
            .ok();
        Ok(state)
    }

    pub fn set_consolidation_state(
        &self,
        session_id: &str,
        compaction_count: u32,
        message_count: usize,
    ) -> Result<(), MemoryError> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO consolidation_state
                (session_id, last_compaction_count, last_message_count, last_consolidated_at)
             VALUES (?1, ?2, ?3, datetime('now'))",
            rusqlite::params![session_id, compaction_count as i64, message_count as i64],
        )?;
        Ok(())
    }

    pub fn file_hash(&self, path: &str) -> Result<Option<String>, MemoryError> {
        let db = self.db.lock().unwrap();
        let hash = db
            .query_row(
                "SELECT content_hash FROM consolidation_file_hashes WHERE file_path = ?1",
                rusqlite::params![path],
                |row| row.get::<_, String>(0),
            )
            .ok();
        Ok(hash)
    }

    pub fn set_file_hash(&self, path: &str, hash: &str) -> Result<(), MemoryError> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO consolidation_file_hashes
                (file_path, content_hash, last_processed_at)
             VALUES (?1, ?2, datetime('now'))",
            rusqlite::params![path, hash],
        )?;
        Ok(())
    }

    // ─── Chunk search (FTS + vector fallback) ────────────────────

    /// Search indexed chunks: FTS first, cosine fallback when FTS comes
    /// up short and an embedding endpoint is configured.
    pub async fn search(
        &self,
        query: &str,
        top_k: Option<usize>,
    ) -> Result<Vec<ChunkHit>, MemoryError> {
        let k = top_k.unwrap_or(self.top_k);

        let fts_results = self.fts_search(query, k)?;
        if fts_results.len() >= 3 {
            return Ok(fts_results);
        }

        let Some(client) = &self.embedding else {
            return Ok(fts_results);
        };

        let query_embedding = match client.embed_cached(self, query).await {
            Ok(v) if !v.is_empty() => v,
            Ok(_) => return Ok(fts_results),
            Err(e) => {
                warn!(error = %e, "vector fallback unavailable");
                return Ok(fts_results);
            }
        };

        let vector_results = self.vector_search(&query_embedding, k)?;

        // Merge: dedup by chunk id, FTS hits win, then re-rank by score.
        let mut merged = fts_results;
        let seen: std::collections::HashSet<String> =
            merged.iter().map(|r| r.id.clone()).collect();
        for hit in vector_results {
            if !seen.contains(&hit.id) {
                merged.push(hit);
            }
        }
        merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        merged.truncate(k);
        Ok(merged)
    }

    /// FTS5 MATCH with the sanitized query. FTS syntax errors degrade to
    /// an empty result rather than failing the turn.
    pub fn fts_search(&self, query: &str, top_k: usize) -> Result<Vec<ChunkHit>, MemoryError> {
        let safe_query = sanitize_fts5(query);
        if safe_query.is_empty() {
            return Ok(Vec::new());
        }

        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT c.id, c.path, c.source, c.text, c.days_old, fts.rank
             FROM chunks_fts fts
             JOIN chunks c ON c.rowid = fts.rowid
             WHERE chunks_fts MATCH ?1
             ORDER BY fts.rank
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![safe_query, top_k as i64], |row| {
            Ok(ChunkHit {
                id: row.get(0)?,
                path: row.get(1)?,
                source: row.get(2)?,
                text: row.get(3)?,
                days_old: row.get::<_, f64>(4).unwrap_or(0.0),
                // FTS rank is negative (more negative = better) — flip it
                // so merge ordering is uniform with cosine scores.
                score: -row.get::<_, f64>(5).unwrap_or(0.0),
            })
        });
        match rows {
            Ok(rows) => Ok(rows.filter_map(|r| r.ok()).collect()),
            Err(e) => {
                debug!(error = %e, "FTS query failed");
                Ok(Vec::new())
            }
        }
    }

    /// Cosine similarity over all chunks with embeddings, capped at
    /// [`VECTOR_SEARCH_LIMIT`] rows.
    fn vector_search(
        &self,
        query_embedding: &[f64],
        top_k: usize,
    ) -> Result<Vec<ChunkHit>, MemoryError> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, path, source, text, days_old, embedding FROM chunks
             WHERE embedding IS NOT NULL LIMIT ?1",
        )?;
        let rows: Vec<(String, String, Option<String>, String, f64, String)> = stmt
            .query_map(rusqlite::params![VECTOR_SEARCH_LIMIT as i64], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get::<_, f64>(4).unwrap_or(0.0),
                    row.get(5)?,
                ))
            })?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        drop(db);

        if rows.len() == VECTOR_SEARCH_LIMIT {
            warn!(
                limit = VECTOR_SEARCH_LIMIT,
                "vector search hit row limit — results may be incomplete"
            );
        }

        let mut results: Vec<ChunkHit> = rows
            .into_iter()
            .filter_map(|(id, path, source, text, days_old, emb_json)| {
                let stored: Vec<f64> = serde_json::from_str(&emb_json).ok()?;
                Some(ChunkHit {
                    id,
                    path,
                    source,
                    text,
                    days_old,
                    score: cosine_sim(query_embedding, &stored),
                })
            })
            .collect();
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(top_k);
        Ok(results)
    }

    /// Chunk text overlapping the requested line range of a file.
    pub fn get_file_snippet(
        &self,
        file_path: &str,
        start_line: u32,
        end_line: u32,
    ) -> Result<String, MemoryError> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT text FROM chunks
             WHERE path = ?1 AND start_line < ?2 AND end_line > ?3
             ORDER BY start_line",
        )?;
        let parts: Vec<String> = stmt
            .query_map(
                rusqlite::params![file_path, end_line as i64, start_line as i64],
                |row| row.get(0),
            )?
            .filter_map(|r| r.ok())
            .collect();
        if parts.is_empty() {
            return Ok(format!(
                "No chunks found for {file_path} lines {start_line}-{end_line}"
            ));
        }
        Ok(parts.join("\n"))
    }

    // ─── Embedding cache ─────────────────────────────────────────

    pub fn cached_embedding(&self, text: &str, model: &str) -> Option<Vec<f64>> {
        let hash = hash_text(text);
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT embedding FROM embedding_cache WHERE hash = ?1 AND model = ?2",
            rusqlite::params![hash, model],
            |row| row.get::<_, String>(0),
        )
        .ok()
        .and_then(|json| serde_json::from_str(&json).ok())
    }

    pub fn cache_embedding(
        &self,
        text: &str,
        model: &str,
        provider: &str,
        embedding: &[f64],
    ) -> Result<(), MemoryError> {
        let hash = hash_text(text);
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO embedding_cache
                (provider, model, provider_key, hash, embedding, dims, updated_at)
             VALUES (?1, ?2, '', ?3, ?4, ?5, datetime('now'))",
            rusqlite::params![
                provider,
                model,
                hash,
                serde_json::to_string(embedding).unwrap_or_default(),
                embedding.len() as i64,
            ],
        )?;
        Ok(())
    }
}

impl EmbeddingClient {
    /// Embed with the store's cache in front of the network call.
    pub async fn embed_cached(
        &self,
        store: &MemoryStore,
        text: &str,
    ) -> Result<Vec<f64>, MemoryError> {
        if let Some(cached) = store.cached_embedding(text, &self.model) {
            return Ok(cached);
        }
        let embedding = self.embed(text).await?;
        if let Err(e) = store.cache_embedding(text, &self.model, &self.provider, &embedding) {
            warn!(error = %e, "failed to cache embedding");
        }
        Ok(embedding)
    }
}

/// Sanitize a query for safe FTS5 MATCH.
///
/// Double-quotes each token so FTS5 treats hyphens, apostrophes, and
/// other special characters as literals, not operators.
pub fn sanitize_fts5(query: &str) -> String {
    let cleaned = query.replace('"', "");
    let tokens: Vec<&str> = cleaned.split_whitespace().collect();
    if tokens.is_empty() {
        return String::new();
    }
    tokens
        .iter()
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(" ")
}

// ─── Row mappers ─────────────────────────────────────────────────

fn row_to_fact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Fact> {
    Ok(Fact {
        id: row.get(0)?,
        entity: row.get(1)?,
        attribute: row.get(2)?,
        value: row.get(3)?,
        confidence: row.get(4)?,
        source_session: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        accessed_at: row.get(8)?,
        invalidated_at: row.get(9)?,
    })
}

fn row_to_episode(row: &rusqlite::Row<'_>) -> rusqlite::Result<Episode> {
    let topics_json: Option<String> = row.get(3)?;
    let decisions_json: Option<String> = row.get(4)?;
    Ok(Episode {
        id: row.get(0)?,
        session_id: row.get(1)?,
        date: row.get(2)?,
        topics: topics_json
            .and_then(|j| serde_json::from_str(&j).ok())
            .unwrap_or_default(),
        decisions: decisions_json
            .and_then(|j| serde_json::from_str(&j).ok())
            .unwrap_or_default(),
        summary: row.get(5)?,
        emotional_tone: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
    })
}

fn row_to_commitment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Commitment> {
    let status_str: String = row.get(5)?;
    Ok(Commitment {
        id: row.get(0)?,
        episode_id: row.get(1)?,
        who: row.get(2)?,
        what: row.get(3)?,
        deadline: row.get(4)?,
        status: status_str.parse().unwrap_or(CommitmentStatus::Open),
        created_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fact_upsert_invariant_holds() {
        let store = MemoryStore::open_in_memory().unwrap();

        assert_eq!(
            store.upsert_fact("nico", "lives_in", "vienna", 1.0, "s1").unwrap(),
            FactWrite::Inserted
        );
        // Same value — untouched
        assert_eq!(
            store.upsert_fact("nico", "lives_in", "vienna", 1.0, "s1").unwrap(),
            FactWrite::Unchanged
        );
        // Changed value — invalidate + insert
        assert_eq!(
            store.upsert_fact("nico", "lives_in", "berlin", 0.9, "s2").unwrap(),
            FactWrite::Updated
        );

        let facts = store.lookup_facts(&["nico".to_string()], 10).unwrap();
        let current: Vec<_> = facts
            .iter()
            .filter(|f| f.attribute == "lives_in")
            .collect();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].value, "berlin");
    }

    #[test]
    fn alias_resolution_is_idempotent() {
        let store = MemoryStore::open_in_memory().unwrap();
        store.add_alias("Uncle Charles", "uncle_charles").unwrap();
        store.add_alias("charles", "uncle_charles").unwrap();

        let once = store.resolve_entity("charles").unwrap();
        let twice = store.resolve_entity(&once).unwrap();
        assert_eq!(once, "uncle_charles");
        assert_eq!(once, twice);

        // Unknown names resolve to their normalized selves
        assert_eq!(store.resolve_entity("Somebody Else").unwrap(), "somebody_else");
    }

    #[test]
    fn self_referential_alias_is_skipped() {
        let store = MemoryStore::open_in_memory().unwrap();
        store.add_alias("nico", "nico").unwrap();
        assert_eq!(store.resolve_entity("nico").unwrap(), "nico");
    }

    #[test]
    fn commitment_transitions_only_leave_open() {
        let store = MemoryStore::open_in_memory().unwrap();
        let ep = store
            .insert_episode("s1", &["plans".into()], &[], "[]", "Made plans.", "upbeat")
            .unwrap();
        let id = store
            .insert_commitment(ep, "user", "send invoice", Some("2026-08-05"))
            .unwrap();

        store.update_commitment_status(id, CommitmentStatus::Done).unwrap();
        // Second transition must fail — row is no longer open
        assert!(store
            .update_commitment_status(id, CommitmentStatus::Cancelled)
            .is_err());
        assert!(store.open_commitments().unwrap().is_empty());
    }

    #[test]
    fn open_commitments_order_deadlines_first() {
        let store = MemoryStore::open_in_memory().unwrap();
        let ep = store
            .insert_episode("s1", &["x".into()], &[], "[]", "Sum.", "neutral")
            .unwrap();
        store.insert_commitment(ep, "user", "no deadline", None).unwrap();
        store
            .insert_commitment(ep, "user", "later", Some("2026-09-01"))
            .unwrap();
        store
            .insert_commitment(ep, "user", "sooner", Some("2026-08-02"))
            .unwrap();

        let open = store.open_commitments().unwrap();
        assert_eq!(open[0].what, "sooner");
        assert_eq!(open[1].what, "later");
        assert_eq!(open[2].what, "no deadline");
    }

    #[test]
    fn episode_keyword_search_matches_topics_or_summary() {
        let store = MemoryStore::open_in_memory().unwrap();
        store
            .insert_episode("s1", &["sailing".into()], &[], "[]", "Planned a trip.", "excited")
            .unwrap();
        store
            .insert_episode("s2", &["work".into()], &[], "[]", "Debugged the sailing app.", "tired")
            .unwrap();
        store
            .insert_episode("s3", &["cooking".into()], &[], "[]", "Made pasta.", "relaxed")
            .unwrap();

        let hits = store
            .search_episodes(&["sailing".to_string()], None, 10)
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn sanitize_fts5_quotes_tokens() {
        assert_eq!(sanitize_fts5("hello world"), "\"hello\" \"world\"");
        assert_eq!(sanitize_fts5("it's a test-case"), "\"it's\" \"a\" \"test-case\"");
        assert_eq!(sanitize_fts5("say \"hi\""), "\"say\" \"hi\"");
        assert_eq!(sanitize_fts5("   "), "");
    }

    #[test]
    fn fts_search_empty_query_returns_nothing() {
        let store = MemoryStore::open_in_memory().unwrap();
        assert!(store.fts_search("", 5).unwrap().is_empty());
    }

    #[test]
    fn consolidation_state_roundtrip() {
        let store = MemoryStore::open_in_memory().unwrap();
        assert!(store.consolidation_state("s1").unwrap().is_none());
        store.set_consolidation_state("s1", 2, 40).unwrap();
        let state = store.consolidation_state("s1").unwrap().unwrap();
        assert_eq!(state.last_compaction_count, 2);
        assert_eq!(state.last_message_count, 40);
    }

    #[test]
    fn transaction_rollback_discards_writes() {
        let store = MemoryStore::open_in_memory().unwrap();
        store.begin().unwrap();
        store.upsert_fact("a", "b", "c", 1.0, "s").unwrap();
        store.rollback();
        assert!(store.lookup_facts(&["a".to_string()], 5).unwrap().is_empty());
    }
}
