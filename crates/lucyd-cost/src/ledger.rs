use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{Local, TimeZone, Utc};
use rusqlite::Connection;
use serde::Serialize;
use tracing::debug;

use lucyd_core::types::Usage;

use crate::db;
use crate::error::CostError;

/// Per-model token/cost sums within a period.
#[derive(Debug, Clone, Serialize)]
pub struct ModelBreakdown {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

/// Aggregated cost view for the HTTP /cost endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PeriodCost {
    pub period: String,
    pub total_cost: f64,
    pub models: Vec<ModelBreakdown>,
}

/// Thread-safe append-only cost ledger over SQLite.
pub struct CostLedger {
    path: PathBuf,
    db: Mutex<Connection>,
}

impl CostLedger {
    /// Open (and initialise) the ledger at `path`.
    pub fn open(path: &Path) -> Result<Self, CostError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        db::init_db(&conn)?;
        Ok(Self {
            path: path.to_path_buf(),
            db: Mutex::new(conn),
        })
    }

    /// Append one usage record and return the computed cost in USD.
    ///
    /// `cost_rates` is USD per million tokens in the order
    /// [input, output, cache_read, cache_write]; missing entries price as 0.
    pub fn record(
        &self,
        session_id: &str,
        model: &str,
        usage: &Usage,
        cost_rates: &[f64],
    ) -> Result<f64, CostError> {
        let cost = compute_cost(usage, cost_rates);
        let now = Utc::now().timestamp();

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO costs
             (timestamp, session_id, model, input_tokens, output_tokens,
              cache_read_tokens, cache_write_tokens, cost_usd)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                now,
                session_id,
                model,
                usage.input_tokens as i64,
                usage.output_tokens as i64,
                usage.cache_read_tokens as i64,
                usage.cache_write_tokens as i64,
                cost,
            ],
        )?;

        debug!(session = %session_id, model, cost_usd = cost, "cost recorded");
        Ok(cost)
    }

    /// Total cost since local midnight. Missing ledger reads as 0.
    pub fn today_total(&self) -> f64 {
        let since = today_start_ts();
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT COALESCE(SUM(cost_usd), 0) FROM costs WHERE timestamp >= ?1",
            rusqlite::params![since],
            |row| row.get::<_, f64>(0),
        )
        .unwrap_or(0.0)
    }

    /// Per-model breakdown for "today", "week", or "all".
    pub fn period_breakdown(&self, period: &str) -> PeriodCost {
        let since = match period {
            "today" => today_start_ts(),
            "week" => today_start_ts() - 6 * 86_400,
            _ => 0,
        };

        let db = self.db.lock().unwrap();
        let mut models = Vec::new();
        let mut total = 0.0;

        let query = db.prepare(
            "SELECT model,
                    COALESCE(SUM(input_tokens), 0),
                    COALESCE(SUM(output_tokens), 0),
                    COALESCE(SUM(cost_usd), 0)
             FROM costs
             WHERE timestamp >= ?1
             GROUP BY model",
        );
        if let Ok(mut stmt) = query {
            let rows = stmt.query_map(rusqlite::params![since], |row| {
                Ok(ModelBreakdown {
                    model: row.get(0)?,
                    input_tokens: row.get::<_, i64>(1)? as u64,
                    output_tokens: row.get::<_, i64>(2)? as u64,
                    cost_usd: row.get(3)?,
                })
            });
            if let Ok(rows) = rows {
                for row in rows.flatten() {
                    total += row.cost_usd;
                    models.push(row);
                }
            }
        }

        PeriodCost {
            period: period.to_string(),
            total_cost: (total * 10_000.0).round() / 10_000.0,
            models,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// USD cost of one usage record at the given per-MTok rates.
pub fn compute_cost(usage: &Usage, rates: &[f64]) -> f64 {
    let rate = |i: usize| rates.get(i).copied().unwrap_or(0.0);
    (usage.input_tokens as f64 * rate(0)
        + usage.output_tokens as f64 * rate(1)
        + usage.cache_read_tokens as f64 * rate(2)
        + usage.cache_write_tokens as f64 * rate(3))
        / 1_000_000.0
}

/// Unix timestamp of local midnight.
fn today_start_ts() -> i64 {
    let now = Local::now();
    let midnight = now.date_naive().and_hms_opt(0, 0, 0).unwrap_or_default();
    Local
        .from_local_datetime(&midnight)
        .single()
        .map(|dt| dt.timestamp())
        .unwrap_or_else(|| now.timestamp() - now.timestamp() % 86_400)
}
