use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed transcript {source_id}: {reason}")]
    MalformedTranscript { source_id: String, reason: String },

    #[error("extractor unavailable: {0}")]
    ExtractorUnavailable(String),

    #[error("malformed extractor output: {0}")]
    MalformedOutput(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("store error: {0}")]
    Store(#[from] engram_store::StoreError),

    #[error("provider error: {0}")]
    Provider(#[from] engram_provider::ProviderError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
