//! Semantic deduplication.
//!
//! Before a candidate fact is committed, its embedding is compared against
//! the active set; close matches are handed to the LLM to decide whether the
//! candidate is new information, a duplicate, or an update of an existing
//! key. Every failure path falls back to `Create` — a fact is never lost
//! because dedup was unavailable.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use engram_core::config::EngramConfig;
use engram_provider::{CompletionRequest, EmbeddingProvider, LlmProvider};
use engram_store::FactStore;

use crate::align::TimedFact;

/// Per-candidate deadline for the decision call. Dedup is advisory; it never
/// gets the extractor's long budget.
const DECISION_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupDecision {
    /// Insert under the candidate's own key.
    Create,
    /// Drop the candidate entirely.
    Skip,
    /// Write the candidate's value under an existing key instead.
    Merge { target: String },
}

/// The decision plus the candidate's embedding (when one was computed), so
/// the commit stage can attach it without a second provider round-trip.
pub struct DedupOutcome {
    pub decision: DedupDecision,
    pub vector: Option<Vec<f32>>,
}

pub struct SemanticDeduper {
    store: Arc<FactStore>,
    llm: Arc<dyn LlmProvider>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl SemanticDeduper {
    pub fn new(
        store: Arc<FactStore>,
        llm: Arc<dyn LlmProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            store,
            llm,
            embedder,
        }
    }

    pub async fn decide(&self, fact: &TimedFact, config: &EngramConfig) -> DedupOutcome {
        if !config.dedup.enabled {
            return DedupOutcome {
                decision: DedupDecision::Create,
                vector: None,
            };
        }

        let text = format!("{}: {}", fact.key, fact.value);
        let vector = match self
            .embedder
            .embed(&config.embedding.model, &[text])
            .await
        {
            Ok(mut vs) if !vs.is_empty() => vs.remove(0),
            Ok(_) => {
                warn!(key = %fact.key, "embedder returned no vector; creating");
                return DedupOutcome {
                    decision: DedupDecision::Create,
                    vector: None,
                };
            }
            Err(e) => {
                warn!(key = %fact.key, err = %e, "embedding failed; creating");
                return DedupOutcome {
                    decision: DedupDecision::Create,
                    vector: None,
                };
            }
        };

        let candidates = match self.store.similar_active(
            &vector,
            config.dedup.similarity_threshold,
            config.dedup.max_candidates,
        ) {
            Ok(c) => c,
            Err(e) => {
                warn!(key = %fact.key, err = %e, "candidate lookup failed; creating");
                return DedupOutcome {
                    decision: DedupDecision::Create,
                    vector: Some(vector),
                };
            }
        };

        if candidates.is_empty() {
            return DedupOutcome {
                decision: DedupDecision::Create,
                vector: Some(vector),
            };
        }

        let candidate_keys: Vec<String> =
            candidates.iter().map(|(f, _)| f.key.clone()).collect();
        let decision = self
            .ask_llm(fact, &candidates, config)
            .await
            .unwrap_or(DedupDecision::Create);

        // A merge target the model invented is a create in disguise.
        let decision = match decision {
            DedupDecision::Merge { target } if !candidate_keys.contains(&target) => {
                warn!(key = %fact.key, target = %target, "merge target not among candidates; creating");
                DedupDecision::Create
            }
            d => d,
        };

        debug!(key = %fact.key, candidates = candidates.len(), ?decision, "dedup decision");
        DedupOutcome {
            decision,
            vector: Some(vector),
        }
    }

    async fn ask_llm(
        &self,
        fact: &TimedFact,
        candidates: &[(engram_store::Fact, f32)],
        config: &EngramConfig,
    ) -> Option<DedupDecision> {
        let matches = candidates
            .iter()
            .map(|(f, sim)| format!("- {} = {:?} (similarity {:.2})", f.key, f.value, sim))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "New fact:\n- {} = {:?}\n\nExisting similar facts:\n{}\n\nDecide.",
            fact.key, fact.value, matches
        );

        let req = CompletionRequest {
            model: config.extractor.model.clone(),
            system: DECISION_PROMPT.to_string(),
            prompt,
            max_tokens: 256,
        };

        let reply = match tokio::time::timeout(
            Duration::from_secs(DECISION_TIMEOUT_SECS),
            self.llm.complete(&req),
        )
        .await
        {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                warn!(key = %fact.key, err = %e, "dedup decision call failed; creating");
                return None;
            }
            Err(_) => {
                warn!(key = %fact.key, "dedup decision timed out; creating");
                return None;
            }
        };

        match parse_decision(&reply) {
            Some(d) => Some(d),
            None => {
                warn!(key = %fact.key, "dedup decision unparseable; creating");
                None
            }
        }
    }
}

const DECISION_PROMPT: &str = "You deduplicate facts in a memory store. Given a new fact and \
existing similar facts, reply with ONLY a JSON object:\n\
{\"action\": \"skip\" | \"merge\" | \"create\", \"target\": \"<existing key, when merging>\", \
\"reason\": \"<short>\"}\n\
skip: the new fact adds nothing over an existing one.\n\
merge: the new fact is a better/newer value for an existing key — set target.\n\
create: the new fact is genuinely distinct.";

#[derive(Deserialize)]
struct DecisionReply {
    action: String,
    #[serde(default)]
    target: Option<String>,
}

/// Parse `{action, target?, reason?}` from a model reply, tolerating
/// surrounding prose the same way the extractor does.
pub fn parse_decision(raw: &str) -> Option<DedupDecision> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    let reply: DecisionReply = serde_json::from_str(&raw[start..=end]).ok()?;
    match reply.action.as_str() {
        "skip" => Some(DedupDecision::Skip),
        "create" => Some(DedupDecision::Create),
        "merge" => reply.target.map(|target| DedupDecision::Merge { target }),
        _ => None,
    }
}
