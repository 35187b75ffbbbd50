use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("no active fact for key: {key}")]
    NotFound { key: String },

    #[error("embedding dimension mismatch: store has {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("cannot set embedding on a superseded row (id {id})")]
    InactiveRow { id: i64 },

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
