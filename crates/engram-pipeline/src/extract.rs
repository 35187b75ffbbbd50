//! LLM fact extraction.
//!
//! The extractor is the only dynamic boundary in the system: free text goes
//! in, a bare JSON array of `{key,value}` objects comes out. Everything the
//! model returns is distrusted — bracket-stripped, strictly parsed, and
//! validated against the key grammar before it becomes a candidate fact.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use engram_core::config::{EngramConfig, ExtractorConfig};
use engram_core::key::normalize_key;
use engram_core::transcript::NormalizedSession;
use engram_provider::{CompletionRequest, LlmProvider, ProviderError};

use crate::error::{PipelineError, Result};
use crate::noise::NoiseFilter;

/// A fact as the model emitted it, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFact {
    pub key: String,
    pub value: String,
}

/// A validated fact attributed to its source session.
#[derive(Debug, Clone)]
pub struct AttributedFact {
    /// Normalized dotted key.
    pub key: String,
    pub value: String,
    /// `session:<id>` provenance tag.
    pub source: String,
    /// The transcript's earliest message timestamp.
    pub message_timestamp: DateTime<Utc>,
}

pub struct FactExtractor {
    llm: Arc<dyn LlmProvider>,
    config: ExtractorConfig,
}

impl FactExtractor {
    pub fn new(llm: Arc<dyn LlmProvider>, config: ExtractorConfig) -> Self {
        Self { llm, config }
    }

    /// Run extraction over a whole session: filter noise, chunk, call the
    /// model per chunk, validate.
    ///
    /// Transport failures (timeout, connect, 5xx) surface as
    /// `ExtractorUnavailable` so the source is retried next run; malformed
    /// model output costs only the offending chunk.
    pub async fn extract_session(
        &self,
        session: &NormalizedSession,
        filter: &NoiseFilter,
        config: &EngramConfig,
        background: bool,
    ) -> Result<Vec<AttributedFact>> {
        let text = conversation_text(session, filter);
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let deadline = Duration::from_secs(if background {
            self.config.background_timeout_secs
        } else {
            self.config.inline_timeout_secs
        });
        let timestamp = session.earliest_timestamp().unwrap_or_else(Utc::now);
        let source = session.provenance();
        let system = extraction_prompt(&config.categories);

        let mut facts = Vec::new();
        for (i, chunk) in chunk_text(&text, self.config.chunk_chars).iter().enumerate() {
            let req = CompletionRequest {
                model: self.config.model.clone(),
                system: system.clone(),
                prompt: chunk.clone(),
                max_tokens: 2048,
            };

            let raw = match tokio::time::timeout(deadline, self.llm.complete(&req)).await {
                Ok(Ok(text)) => text,
                Ok(Err(e)) if e.is_transient() => {
                    return Err(PipelineError::ExtractorUnavailable(e.to_string()));
                }
                Ok(Err(e)) => {
                    warn!(chunk = i, err = %e, "extractor call failed; chunk yields no facts");
                    continue;
                }
                Err(_) => {
                    return Err(PipelineError::ExtractorUnavailable(format!(
                        "chunk {i} timed out after {}s",
                        deadline.as_secs()
                    )));
                }
            };

            let parsed = match parse_extractor_output(&raw) {
                Ok(p) => p,
                Err(e) => {
                    warn!(chunk = i, err = %e, "extractor output unparseable; chunk yields no facts");
                    continue;
                }
            };
            debug!(chunk = i, facts = parsed.len(), "chunk extracted");

            for raw_fact in parsed {
                match validate_fact(&raw_fact, filter, config) {
                    Some(key) => facts.push(AttributedFact {
                        key,
                        value: raw_fact.value,
                        source: source.clone(),
                        message_timestamp: timestamp,
                    }),
                    None => debug!(key = %raw_fact.key, "dropping invalid or noisy fact"),
                }
            }
        }

        Ok(facts)
    }
}

/// Render the filtered conversation as extraction input.
pub fn conversation_text(session: &NormalizedSession, filter: &NoiseFilter) -> String {
    session
        .messages
        .iter()
        .filter(|m| !filter.is_noise_message(&m.text))
        .map(|m| format!("{}: {}", m.role, m.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Split text into chunks of at most `cap` characters, breaking only on
/// paragraph boundaries. A single paragraph longer than the cap is split
/// hard — it cannot be sent whole.
pub fn chunk_text(text: &str, cap: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for para in text.split("\n\n") {
        if para.len() > cap {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            let mut rest = para;
            while rest.len() > cap {
                let mut cut = cap;
                while !rest.is_char_boundary(cut) {
                    cut -= 1;
                }
                chunks.push(rest[..cut].to_string());
                rest = &rest[cut..];
            }
            current = rest.to_string();
            continue;
        }
        // +2 for the paragraph separator we re-insert
        if !current.is_empty() && current.len() + para.len() + 2 > cap {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(para);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// The fixed extraction contract sent as the system prompt.
pub fn extraction_prompt(categories: &[String]) -> String {
    format!(
        "You extract durable facts from a conversation between a user and a \
         coding assistant.\n\
         Return ONLY a JSON array of objects, each {{\"key\": …, \"value\": …}}.\n\
         No prose, no markdown fences, no explanations — the first character \
         of your reply must be '[' and the last must be ']'.\n\
         Keys are lowercase dotted paths: <category>.<segment>[.<segment>…].\n\
         Valid categories: {}.\n\
         Values are short strings capturing the fact. Skip small talk, \
         questions, and anything transient. Return [] when nothing is worth \
         keeping.",
        categories.join(", ")
    )
}

/// Strict parse of the model reply: everything before the first `[` and
/// after the last `]` is stripped, the remainder must be a JSON array of
/// objects with a string `key` and a non-null `value`.
pub fn parse_extractor_output(raw: &str) -> Result<Vec<RawFact>> {
    let start = raw.find('[').ok_or_else(|| {
        PipelineError::MalformedOutput("reply contains no JSON array".to_string())
    })?;
    let end = raw.rfind(']').filter(|e| *e > start).ok_or_else(|| {
        PipelineError::MalformedOutput("reply contains no closing bracket".to_string())
    })?;

    let items: Vec<Value> = serde_json::from_str(&raw[start..=end])?;
    let mut facts = Vec::new();
    for item in items {
        let Some(obj) = item.as_object() else {
            warn!("extractor array item is not an object; dropped");
            continue;
        };
        let Some(key) = obj.get("key").and_then(|k| k.as_str()) else {
            warn!("extractor item has no string key; dropped");
            continue;
        };
        let value = match obj.get("value") {
            None | Some(Value::Null) => {
                warn!(key, "extractor item has null value; dropped");
                continue;
            }
            Some(Value::String(s)) => s.clone(),
            // structured values are stored as their JSON encoding
            Some(other) => other.to_string(),
        };
        facts.push(RawFact {
            key: key.to_string(),
            value,
        });
    }
    Ok(facts)
}

fn validate_fact(raw: &RawFact, filter: &NoiseFilter, config: &EngramConfig) -> Option<String> {
    let key = normalize_key(&raw.key, &config.categories).ok()?;
    if filter.is_noise_fact(&key, &raw.value) {
        return None;
    }
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_strips_surrounding_prose() {
        let raw = "Sure! Here are the facts:\n[{\"key\":\"user.city\",\"value\":\"Taipei\"}]\nHope that helps.";
        let facts = parse_extractor_output(raw).unwrap();
        assert_eq!(
            facts,
            vec![RawFact {
                key: "user.city".to_string(),
                value: "Taipei".to_string()
            }]
        );
    }

    #[test]
    fn parse_rejects_non_array() {
        assert!(parse_extractor_output("I found nothing.").is_err());
        assert!(parse_extractor_output("{\"key\":\"a\",\"value\":\"b\"}").is_err());
    }

    #[test]
    fn parse_drops_bad_items_keeps_good() {
        let raw = r#"[
            {"key":"user.city","value":"Taipei"},
            {"key":"user.age","value":null},
            {"value":"no key"},
            "not an object",
            {"key":"user.prefs","value":{"theme":"dark"}}
        ]"#;
        let facts = parse_extractor_output(raw).unwrap();
        assert_eq!(facts.len(), 2);
        assert_eq!(facts[1].value, r#"{"theme":"dark"}"#);
    }

    #[test]
    fn empty_array_is_zero_facts() {
        assert!(parse_extractor_output("[]").unwrap().is_empty());
    }

    #[test]
    fn chunking_respects_paragraphs_and_cap() {
        let text = format!("{}\n\n{}\n\n{}", "a".repeat(40), "b".repeat(40), "c".repeat(40));
        let chunks = chunk_text(&text, 90);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() <= 90));
        assert!(chunks[0].contains("aaaa") && chunks[0].contains("bbbb"));
        assert!(chunks[1].contains("cccc"));
    }

    #[test]
    fn oversized_paragraph_is_hard_split() {
        let text = "x".repeat(250);
        let chunks = chunk_text(&text, 100);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 100));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn prompt_lists_configured_categories() {
        let cats = vec!["user".to_string(), "project".to_string()];
        let prompt = extraction_prompt(&cats);
        assert!(prompt.contains("user, project"));
        assert!(prompt.contains("JSON array"));
    }
}
