use async_trait::async_trait;

/// A single-shot completion request. The consolidation pipeline only ever
/// needs system + one user turn — no history, no streaming, no tools.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
}

/// Common interface for LLM providers (Ollama, OpenAI-compatible).
///
/// Implementations must be cheap to share behind an `Arc` and must map
/// connection/timeout failures to `ProviderError::Unavailable` so callers
/// can classify them as transient.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    /// Send the request, wait for the full response text.
    async fn complete(&self, req: &CompletionRequest) -> Result<String, ProviderError>;
}

/// Text → fixed-dimension vector, batched.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Embed a batch. Must return exactly one vector per input, in order.
    async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Provider timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// Transient failures are skipped and retried on the next invocation;
    /// everything else is a data or configuration problem.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Http(_)
            | ProviderError::Unavailable(_)
            | ProviderError::Timeout { .. } => true,
            ProviderError::Api { status, .. } => *status >= 500 || *status == 429,
            ProviderError::Parse(_) | ProviderError::NotConfigured(_) => false,
        }
    }
}
