use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use tracing::{info, warn};

use engram_core::config::EngramConfig;
use engram_hooks::error::GateError;
use engram_hooks::{LockGuard, SingletonLock};
use engram_pipeline::{Pipeline, PipelineError, SourceOutcome};

use crate::{PipelineCmd, EXIT_OK, EXIT_TRANSIENT};

/// Lock file shared by hooks and background workers.
pub const EXTRACT_LOCK: &str = "extract.lock";

pub async fn run(cmd: PipelineCmd, config: EngramConfig) -> Result<u8> {
    // A background worker was spawned under a lock that already carries our
    // pid; acquiring again would see ourselves as a live holder. Everything
    // else contends for the singleton normally.
    let _guard: Option<LockGuard> = match &cmd {
        PipelineCmd::Run { background: true, .. } | PipelineCmd::EmbedMissing => None,
        _ => match extract_lock(&config).acquire("pipeline-cli") {
            Ok(guard) => Some(guard),
            Err(GateError::LockHeld { pid }) => {
                info!(holder = pid, "extraction in progress; exiting");
                return Ok(EXIT_TRANSIENT);
            }
            Err(e) => return Err(e.into()),
        },
    };

    match cmd {
        PipelineCmd::Run { source, background } => {
            let code = run_single(&source, &config, background).await;
            if background {
                // Worker exit path: the lock carries our pid; remove it no
                // matter how the run went.
                extract_lock(&config).release();
            }
            code
        }
        PipelineCmd::Backfill { dir, background } => {
            let mut pipeline = Pipeline::new(config)?;
            match pipeline.backfill(&dir, background).await {
                Ok(summary) => {
                    println!(
                        "backfill: {} done, {} skipped, {} failed, {} facts",
                        summary.done, summary.skipped, summary.failed, summary.facts_committed
                    );
                    Ok(if summary.failed > 0 { EXIT_TRANSIENT } else { EXIT_OK })
                }
                Err(PipelineError::ResourceExhausted(reason)) => {
                    warn!(reason, "backfill aborted");
                    Ok(EXIT_TRANSIENT)
                }
                Err(e) => Err(e.into()),
            }
        }
        PipelineCmd::IngestHost { host, dir } => {
            if host != "gemini" {
                bail!("unsupported host: {host} (supported: gemini)");
            }
            let src = dir.unwrap_or_else(default_gemini_dir);
            if !src.is_dir() {
                bail!("session directory not found: {}", src.display());
            }
            let mut pipeline = Pipeline::new(config)?;
            let summary = pipeline.ingest_gemini(&src, true).await?;
            println!(
                "gemini ingest: {} done, {} skipped, {} failed, {} facts",
                summary.done, summary.skipped, summary.failed, summary.facts_committed
            );
            Ok(if summary.failed > 0 { EXIT_TRANSIENT } else { EXIT_OK })
        }
        PipelineCmd::EmbedMissing => {
            let pipeline = Pipeline::new(config)?;
            let embedded = pipeline.embed_missing().await?;
            println!("embedded {embedded} facts");
            Ok(EXIT_OK)
        }
    }
}

async fn run_single(source: &PathBuf, config: &EngramConfig, background: bool) -> Result<u8> {
    if !source.is_file() {
        bail!("source not found: {}", source.display());
    }
    let mut pipeline = Pipeline::new(config.clone())?;
    match pipeline.run_source(source, "", background).await {
        SourceOutcome::Done(stats) => {
            info!(
                committed = stats.committed,
                merged = stats.merged,
                embedded = stats.embedded,
                "source processed"
            );
            Ok(EXIT_OK)
        }
        SourceOutcome::Skipped { reason } => {
            info!(reason, "source skipped");
            Ok(EXIT_OK)
        }
        SourceOutcome::Failed { reason } => {
            warn!(reason, "source failed; will retry next run");
            Ok(EXIT_TRANSIENT)
        }
    }
}

pub fn extract_lock(config: &EngramConfig) -> SingletonLock {
    SingletonLock::new(
        config.store.locks_dir().join(EXTRACT_LOCK),
        Duration::from_secs(config.lock.worker_stale_ttl_secs),
    )
}

fn default_gemini_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".gemini").join("sessions")
}
