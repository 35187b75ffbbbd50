//! The consolidation pipeline, end to end.
//!
//! Per source file:
//!
//! ```text
//! Seen → ledger check → Skipped
//!      → Normalize → (empty?) → Skipped
//!      → Filter → (all noise?) → Skipped
//!      → Chunk → Extract → Align → Dedup → Commit → Embed → Aggregate → Done
//!      transient stage error → Failed (ledger NOT updated; retried next run)
//! ```
//!
//! Each source is an independent unit of work: a failure never propagates to
//! the other sources in a batch. Malformed input advances the ledger anyway
//! so a corrupt transcript cannot loop forever.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use engram_core::config::EngramConfig;
use engram_hooks::guard::memory_preflight;
use engram_provider::{build_providers, EmbeddingProvider, LlmProvider};
use engram_store::{FactStore, NewFact, ProcessedLedger, UpsertOutcome};

use crate::aggregate::Aggregator;
use crate::align::{align, TimedFact};
use crate::dedup::{DedupDecision, SemanticDeduper};
use crate::error::{PipelineError, Result};
use crate::extract::FactExtractor;
use crate::noise::NoiseFilter;
use crate::normalize::{convert_gemini_dir, normalize_jsonl};

/// Per-batch deadline for embedding calls.
const EMBED_TIMEOUT_SECS: u64 = 120;

/// What happened to one source file.
#[derive(Debug)]
pub enum SourceOutcome {
    Skipped { reason: String },
    Done(StageStats),
    Failed { reason: String },
}

#[derive(Debug, Default, Clone)]
pub struct StageStats {
    pub extracted: usize,
    pub committed: usize,
    pub merged: usize,
    pub dedup_skipped: usize,
    pub embedded: usize,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub done: usize,
    pub skipped: usize,
    pub failed: usize,
    pub facts_committed: usize,
}

pub struct Pipeline {
    config: EngramConfig,
    store: Arc<FactStore>,
    extractor: FactExtractor,
    deduper: SemanticDeduper,
    embedder: Arc<dyn EmbeddingProvider>,
    filter: NoiseFilter,
    ledger: ProcessedLedger,
}

impl Pipeline {
    /// Open the store and build providers from config.
    pub fn new(config: EngramConfig) -> Result<Self> {
        let store = Arc::new(FactStore::open(&config.store.db_path())?);
        let (llm, embedder) = build_providers(&config)?;
        Self::with_providers(config, store, llm, embedder)
    }

    /// Dependency-injected constructor — the test seam.
    pub fn with_providers(
        config: EngramConfig,
        store: Arc<FactStore>,
        llm: Arc<dyn LlmProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let ledger = ProcessedLedger::load(&config.store.ledger_path())?;
        Ok(Self {
            extractor: FactExtractor::new(llm.clone(), config.extractor.clone()),
            deduper: SemanticDeduper::new(store.clone(), llm, embedder.clone()),
            filter: NoiseFilter::new(&config.noise),
            store,
            embedder,
            config,
            ledger,
        })
    }

    pub fn store(&self) -> &Arc<FactStore> {
        &self.store
    }

    /// Process one transcript file. `ledger_prefix` scopes the source id
    /// (e.g. `"gemini:"`); empty for native sources.
    pub async fn run_source(
        &mut self,
        path: &Path,
        ledger_prefix: &str,
        background: bool,
    ) -> SourceOutcome {
        let source_id = format!(
            "{ledger_prefix}{}",
            path.file_name().map(|s| s.to_string_lossy()).unwrap_or_default()
        );
        let mtime = file_mtime(path);

        if self.ledger.is_processed(&source_id, mtime) {
            info!(source = %source_id, stage = "ledger", "already processed; skipping");
            return SourceOutcome::Skipped {
                reason: "already processed".to_string(),
            };
        }

        if let Err(e) = memory_preflight(self.config.guards.min_free_mb) {
            return SourceOutcome::Failed {
                reason: e.to_string(),
            };
        }

        let session = match normalize_jsonl(path) {
            Ok(s) => s,
            Err(e) => {
                // Malformed input is advanced in the ledger so it can't loop.
                warn!(source = %source_id, err = %e, stage = "normalize", "malformed transcript");
                self.mark(&source_id, mtime);
                return SourceOutcome::Skipped {
                    reason: format!("malformed: {e}"),
                };
            }
        };
        info!(
            source = %source_id,
            stage = "normalize",
            messages = session.messages.len(),
            tool_events = session.tool_events.len(),
        );

        if session.is_empty() {
            self.mark(&source_id, mtime);
            return SourceOutcome::Skipped {
                reason: "empty session".to_string(),
            };
        }

        let signal: Vec<_> = session
            .messages
            .iter()
            .filter(|m| !self.filter.is_noise_message(&m.text))
            .collect();
        info!(source = %source_id, stage = "filter", kept = signal.len(), dropped = session.messages.len() - signal.len());
        if signal.is_empty() && session.tool_events.is_empty() {
            self.mark(&source_id, mtime);
            return SourceOutcome::Skipped {
                reason: "all noise".to_string(),
            };
        }

        let facts = match self
            .extractor
            .extract_session(&session, &self.filter, &self.config, background)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                // Transient: ledger untouched, retried next run.
                warn!(source = %source_id, err = %e, stage = "extract", "extractor failed");
                return SourceOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };
        info!(source = %source_id, stage = "extract", facts = facts.len());

        let timed = align(facts);
        info!(source = %source_id, stage = "align", facts = timed.len());

        let mut stats = StageStats {
            extracted: timed.len(),
            ..Default::default()
        };
        for fact in &timed {
            self.commit_fact(fact, &mut stats).await;
        }
        info!(
            source = %source_id,
            stage = "commit",
            committed = stats.committed,
            merged = stats.merged,
            dedup_skipped = stats.dedup_skipped,
        );

        let (cases, patterns) = self.learn(&session);
        info!(source = %source_id, stage = "learn", cases, patterns);

        match self.embed_missing().await {
            Ok(n) => {
                stats.embedded = n;
                info!(source = %source_id, stage = "embed", embedded = n);
            }
            Err(e) => warn!(source = %source_id, err = %e, stage = "embed", "embedding pass incomplete"),
        }

        self.mark(&source_id, mtime);

        if let Err(e) = self.aggregate() {
            warn!(source = %source_id, err = %e, stage = "aggregate", "aggregation failed");
        } else {
            info!(source = %source_id, stage = "aggregate", "derived files refreshed");
        }

        SourceOutcome::Done(stats)
    }

    /// Dedup-then-commit for one timed fact. Dedup failures degrade to
    /// `create`; a fact is only ever dropped by an explicit `skip` decision.
    async fn commit_fact(&self, fact: &TimedFact, stats: &mut StageStats) {
        let outcome = self.deduper.decide(fact, &self.config).await;

        let new_fact = NewFact {
            key: fact.key.clone(),
            value: fact.value.clone(),
            source: fact.source.clone(),
            start_time: fact.start_time,
        };

        let (written, target_desc) = match &outcome.decision {
            DedupDecision::Skip => {
                stats.dedup_skipped += 1;
                return;
            }
            DedupDecision::Create => (self.store.upsert(&new_fact), None),
            DedupDecision::Merge { target } => {
                stats.merged += 1;
                (self.store.apply_merge(target, &new_fact), Some(target.clone()))
            }
        };

        match written {
            Ok(UpsertOutcome::Skip) => {}
            Ok(UpsertOutcome::Inserted { id }) | Ok(UpsertOutcome::Superseded { id, .. }) => {
                stats.committed += 1;
                if let Some(vector) = &outcome.vector {
                    // The dedup embedding was computed for "<key>: <value>";
                    // reuse it only when the key it describes was written.
                    if target_desc.is_none() {
                        if let Err(e) = self.store.set_embedding(id, vector) {
                            warn!(key = %fact.key, err = %e, "could not attach embedding");
                        }
                    }
                }
            }
            Err(e) => warn!(key = %fact.key, err = %e, "commit failed; fact dropped"),
        }
    }

    /// Learning stage: derive error→recovery cases and usage patterns from
    /// the session's tool events and write them back as `agent.*` facts.
    /// Failures here never fail the source — learning is additive.
    fn learn(&self, session: &engram_core::transcript::NormalizedSession) -> (usize, usize) {
        let mut stored_cases = 0usize;
        for dc in engram_learn::extract_cases(&session.tool_events, &session.messages) {
            let value = match serde_json::to_string(&dc.case) {
                Ok(v) => v,
                Err(e) => {
                    warn!(key = %dc.key, err = %e, "could not encode case");
                    continue;
                }
            };
            match self.store.upsert(&NewFact {
                key: dc.key.clone(),
                value,
                source: "auto:learning".to_string(),
                start_time: dc.case.timestamp,
            }) {
                Ok(UpsertOutcome::Skip) => {}
                Ok(_) => stored_cases += 1,
                Err(e) => warn!(key = %dc.key, err = %e, "could not store case"),
            }
        }

        let mut stored_patterns = 0usize;
        let now = chrono::Utc::now();
        for dp in engram_learn::extract_patterns(&session.tool_events) {
            let value = match serde_json::to_string(&dp.pattern) {
                Ok(v) => v,
                Err(e) => {
                    warn!(key = %dp.key, err = %e, "could not encode pattern");
                    continue;
                }
            };
            match self.store.upsert(&NewFact {
                key: dp.key.clone(),
                value,
                source: "auto:learning".to_string(),
                start_time: now,
            }) {
                Ok(UpsertOutcome::Skip) => {}
                Ok(_) => stored_patterns += 1,
                Err(e) => warn!(key = %dp.key, err = %e, "could not store pattern"),
            }
        }
        (stored_cases, stored_patterns)
    }

    /// Backfill every `.jsonl` file in a directory, sorted order, capped at
    /// `max_sessions_per_run`, RAM-checked before each file.
    pub async fn backfill(&mut self, dir: &Path, background: bool) -> Result<RunSummary> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
            .collect();
        files.sort();

        self.run_batch(&files, "", background).await
    }

    /// Ingest Gemini session exports: convert into a unique temp dir, then
    /// process with `gemini:`-prefixed ledger ids. The temp dir is removed
    /// unconditionally.
    pub async fn ingest_gemini(&mut self, src_dir: &Path, background: bool) -> Result<RunSummary> {
        let temp_dir = std::env::temp_dir().join(format!(
            "engram-gemini-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        let converted = convert_gemini_dir(src_dir, &temp_dir)?;
        info!(sessions = converted.len(), "gemini conversion complete");

        let result = self.run_batch(&converted, "gemini:", background).await;
        if let Err(e) = std::fs::remove_dir_all(&temp_dir) {
            warn!(dir = %temp_dir.display(), err = %e, "could not remove temp dir");
        }
        result
    }

    async fn run_batch(
        &mut self,
        files: &[PathBuf],
        prefix: &str,
        background: bool,
    ) -> Result<RunSummary> {
        let cap = self.config.guards.max_sessions_per_run;
        if files.len() > cap {
            warn!(total = files.len(), cap, "batch larger than session cap; remainder deferred");
        }

        let mut summary = RunSummary::default();
        for path in files.iter().take(cap) {
            if let Err(e) = memory_preflight(self.config.guards.min_free_mb) {
                warn!(err = %e, "stopping batch");
                return Err(PipelineError::ResourceExhausted(e.to_string()));
            }
            match self.run_source(path, prefix, background).await {
                SourceOutcome::Done(stats) => {
                    summary.done += 1;
                    summary.facts_committed += stats.committed;
                }
                SourceOutcome::Skipped { .. } => summary.skipped += 1,
                SourceOutcome::Failed { reason } => {
                    warn!(path = %path.display(), reason, "source failed");
                    summary.failed += 1;
                }
            }
        }
        info!(
            done = summary.done,
            skipped = summary.skipped,
            failed = summary.failed,
            facts = summary.facts_committed,
            "batch complete"
        );
        Ok(summary)
    }

    /// Batch-embed active rows that still lack vectors. Returns how many
    /// embeddings were stored. Provider failures end the pass early — the
    /// backlog is picked up by the next run.
    pub async fn embed_missing(&self) -> Result<usize> {
        let batch_size = self.config.embedding.batch_size.max(1);
        let mut total = 0usize;

        loop {
            let batch = self.store.active_missing_embedding(batch_size)?;
            if batch.is_empty() {
                break;
            }
            let texts: Vec<String> = batch
                .iter()
                .map(|f| format!("{}: {}", f.key, f.value))
                .collect();

            let vectors = match tokio::time::timeout(
                Duration::from_secs(EMBED_TIMEOUT_SECS),
                self.embedder.embed(&self.config.embedding.model, &texts),
            )
            .await
            {
                Ok(Ok(v)) => v,
                Ok(Err(e)) => {
                    warn!(err = %e, "embedding batch failed; stopping pass");
                    break;
                }
                Err(_) => {
                    warn!("embedding batch timed out; stopping pass");
                    break;
                }
            };

            let mut stored_this_round = 0usize;
            for (fact, vector) in batch.iter().zip(vectors) {
                match self.store.set_embedding(fact.id, &vector) {
                    Ok(()) => stored_this_round += 1,
                    Err(e) => warn!(key = %fact.key, err = %e, "could not store embedding"),
                }
            }
            total += stored_this_round;
            if stored_this_round == 0 {
                // Nothing progressed (e.g. dimension mismatch) — avoid spinning.
                break;
            }
        }
        Ok(total)
    }

    /// Refresh the derived files that depend on the active set.
    pub fn aggregate(&self) -> Result<()> {
        let aggregator = Aggregator::new(&self.store, &self.config);
        aggregator.write_digest(&self.config.store.digest_path())?;
        aggregator.write_daily(&self.config.store.daily_dir(), chrono::Utc::now().date_naive())?;
        Ok(())
    }

    fn mark(&mut self, source_id: &str, mtime: i64) {
        if let Err(e) = self.ledger.mark(source_id, mtime) {
            warn!(source = %source_id, err = %e, "could not update ledger");
        }
    }
}

fn file_mtime(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
