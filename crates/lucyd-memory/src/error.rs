use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Embedding request failed: {0}")]
    Embedding(String),

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("Commitment not found or not open: {0}")]
    CommitmentNotOpen(i64),
}
