use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngramError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed key: {0}")]
    MalformedKey(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngramError>;
