use rusqlite::{Connection, Result};

/// Initialise the cost table. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS costs (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp          INTEGER NOT NULL,
            session_id         TEXT NOT NULL,
            model              TEXT NOT NULL,
            input_tokens       INTEGER NOT NULL DEFAULT 0,
            output_tokens      INTEGER NOT NULL DEFAULT 0,
            cache_read_tokens  INTEGER NOT NULL DEFAULT 0,
            cache_write_tokens INTEGER NOT NULL DEFAULT 0,
            cost_usd           REAL NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_costs_ts
            ON costs(timestamp);
        CREATE INDEX IF NOT EXISTS idx_costs_session
            ON costs(session_id, timestamp);",
    )
}
