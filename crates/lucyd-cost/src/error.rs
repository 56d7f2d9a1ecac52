use thiserror::Error;

#[derive(Debug, Error)]
pub enum CostError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}
