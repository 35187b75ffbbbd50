//! Provider construction from config.

use std::sync::Arc;

use engram_core::config::EngramConfig;

use crate::ollama::OllamaProvider;
use crate::openai::OpenAiProvider;
use crate::provider::{EmbeddingProvider, LlmProvider, ProviderError};

/// Resolve the configured extractor slot into concrete providers.
///
/// Both the LLM and embedding provider come from the same slot; Ollama needs
/// no credentials, OpenAI-compatible endpoints need an api_key in config.
pub fn build_providers(
    config: &EngramConfig,
) -> Result<(Arc<dyn LlmProvider>, Arc<dyn EmbeddingProvider>), ProviderError> {
    match config.extractor.provider.as_str() {
        "ollama" => {
            let base = config.providers.ollama.as_ref().map(|c| c.base_url.clone());
            let provider = Arc::new(OllamaProvider::new(base));
            Ok((provider.clone(), provider))
        }
        "openai" => {
            let cfg = config.providers.openai.as_ref().ok_or_else(|| {
                ProviderError::NotConfigured(
                    "extractor.provider = \"openai\" but [providers.openai] is missing".to_string(),
                )
            })?;
            let provider = Arc::new(OpenAiProvider::new(
                cfg.api_key.clone(),
                Some(cfg.base_url.clone()),
            ));
            Ok((provider.clone(), provider))
        }
        other => Err(ProviderError::NotConfigured(format!(
            "unknown extractor provider: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds_ollama() {
        let config = EngramConfig::default();
        let (llm, embed) = build_providers(&config).unwrap();
        assert_eq!(llm.name(), "ollama");
        assert_eq!(embed.name(), "ollama");
    }

    #[test]
    fn openai_requires_credentials() {
        let mut config = EngramConfig::default();
        config.extractor.provider = "openai".to_string();
        assert!(matches!(
            build_providers(&config),
            Err(ProviderError::NotConfigured(_))
        ));
    }

    #[test]
    fn unknown_slot_is_rejected() {
        let mut config = EngramConfig::default();
        config.extractor.provider = "banana".to_string();
        assert!(build_providers(&config).is_err());
    }
}
