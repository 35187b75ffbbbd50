use thiserror::Error;

#[derive(Debug, Error)]
pub enum LearnError {
    #[error("store error: {0}")]
    Store(#[from] engram_store::StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LearnError>;
