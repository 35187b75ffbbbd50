use thiserror::Error;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("lock held by live pid {pid}")]
    LockHeld { pid: u32 },

    #[error("free RAM {free_mb} MB below floor {floor_mb} MB")]
    ResourceExhausted { free_mb: u64, floor_mb: u64 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GateError>;
