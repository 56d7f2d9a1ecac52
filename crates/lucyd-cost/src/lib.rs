//! Append-only token/cost ledger.
//!
//! One row per provider response, keyed by time, session, and model. The
//! ledger file is the source of truth for daily and all-time cost queries;
//! a missing file reads as zero.

mod db;
mod error;
mod ledger;

pub use error::CostError;
pub use ledger::{compute_cost, CostLedger, ModelBreakdown, PeriodCost};
