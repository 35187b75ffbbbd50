pub mod ollama;
pub mod openai;
pub mod provider;
pub mod registry;

pub use provider::{
    CompletionRequest, EmbeddingProvider, LlmProvider, ProviderError,
};
pub use registry::build_providers;
