use rusqlite::{Connection, Result};

/// Create all memory tables if they don't exist.
///
/// Safe to call on every startup — all statements use IF NOT EXISTS.
/// WAL mode is enabled by the store on open.
pub fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "-- Entity-attribute-value triples with soft deletion
        CREATE TABLE IF NOT EXISTS facts (
            id             INTEGER PRIMARY KEY,
            entity         TEXT NOT NULL,
            attribute      TEXT NOT NULL,
            value          TEXT NOT NULL,
            confidence     REAL DEFAULT 1.0,
            source_session TEXT,
            created_at     TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at     TEXT NOT NULL DEFAULT (datetime('now')),
            accessed_at    TEXT NOT NULL DEFAULT (datetime('now')),
            invalidated_at TEXT
        );

        -- Timestamped session summaries
        CREATE TABLE IF NOT EXISTS episodes (
            id             INTEGER PRIMARY KEY,
            session_id     TEXT NOT NULL,
            date           TEXT NOT NULL DEFAULT (date('now')),
            topics         TEXT,
            decisions      TEXT,
            commitments    TEXT,
            summary        TEXT NOT NULL,
            emotional_tone TEXT
        );

        -- Promises and obligations with status tracking
        CREATE TABLE IF NOT EXISTS commitments (
            id             INTEGER PRIMARY KEY,
            episode_id     INTEGER REFERENCES episodes(id),
            who            TEXT NOT NULL,
            what           TEXT NOT NULL,
            deadline       TEXT,
            status         TEXT DEFAULT 'open',
            created_at     TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Canonical name resolution (lowercase normalized)
        CREATE TABLE IF NOT EXISTS entity_aliases (
            id             INTEGER PRIMARY KEY,
            alias          TEXT NOT NULL UNIQUE,
            canonical      TEXT NOT NULL
        );

        -- Tracks which messages in a session have been consolidated
        CREATE TABLE IF NOT EXISTS consolidation_state (
            session_id            TEXT PRIMARY KEY,
            last_compaction_count INTEGER NOT NULL DEFAULT 0,
            last_message_count    INTEGER NOT NULL DEFAULT 0,
            last_consolidated_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Tracks file content hashes to skip unchanged files
        CREATE TABLE IF NOT EXISTS consolidation_file_hashes (
            file_path         TEXT PRIMARY KEY,
            content_hash      TEXT NOT NULL,
            last_processed_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Indexed text chunks (written by the off-line indexer)
        CREATE TABLE IF NOT EXISTS chunks (
            id          TEXT PRIMARY KEY,
            path        TEXT NOT NULL,
            source      TEXT,
            text        TEXT NOT NULL,
            start_line  INTEGER NOT NULL DEFAULT 0,
            end_line    INTEGER NOT NULL DEFAULT 0,
            days_old    REAL NOT NULL DEFAULT 0,
            embedding   TEXT
        );

        CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts
            USING fts5(text, content='chunks', content_rowid='rowid');

        -- Embedding cache keyed by content hash + model
        CREATE TABLE IF NOT EXISTS embedding_cache (
            provider     TEXT NOT NULL DEFAULT '',
            model        TEXT NOT NULL,
            provider_key TEXT NOT NULL DEFAULT '',
            hash         TEXT NOT NULL,
            embedding    TEXT NOT NULL,
            dims         INTEGER NOT NULL,
            updated_at   TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (hash, model)
        );

        -- Fast lookup of current facts by entity (excludes invalidated)
        CREATE INDEX IF NOT EXISTS idx_facts_entity
            ON facts (entity, invalidated_at);

        -- Lookup by entity + attribute for dedup and update checks
        CREATE INDEX IF NOT EXISTS idx_facts_entity_attr
            ON facts (entity, attribute, invalidated_at);

        CREATE INDEX IF NOT EXISTS idx_commitments_status
            ON commitments (status);

        CREATE INDEX IF NOT EXISTS idx_commitments_episode
            ON commitments (episode_id);

        CREATE INDEX IF NOT EXISTS idx_episodes_date
            ON episodes (date);

        CREATE INDEX IF NOT EXISTS idx_entity_aliases_canonical
            ON entity_aliases (canonical);

        CREATE INDEX IF NOT EXISTS idx_chunks_path
            ON chunks (path, start_line);",
    )
}
