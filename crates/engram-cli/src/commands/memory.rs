use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Utc};
use tracing::warn;

use engram_core::config::EngramConfig;
use engram_core::key::normalize_key;
use engram_learn::injectable_instincts;
use engram_pipeline::aggregate::Aggregator;
use engram_provider::build_providers;
use engram_store::{FactStore, NewFact, SearchQuery, StoreError, VerdictFilters};

use crate::{Format, MemoryCmd, EXIT_OK};

const EMBED_QUERY_TIMEOUT_SECS: u64 = 30;

pub async fn run(cmd: MemoryCmd, config: EngramConfig) -> Result<u8> {
    let store = FactStore::open(&config.store.db_path())?;

    match cmd {
        MemoryCmd::Summary => {
            println!("{}", Aggregator::new(&store, &config).summary_line()?);
        }
        MemoryCmd::Search {
            prefix,
            mut keys,
            query,
            semantic,
            key,
            limit,
            format,
            source_verified,
            subject,
            max_age_days,
            type_tag,
        } => {
            if let Some(tag) = &type_tag {
                if tag != "all" && !config.type_mappings.contains_key(tag) {
                    bail!(
                        "unknown type tag {tag:?} (configured: {}, all)",
                        config.type_mappings.keys().cloned().collect::<Vec<_>>().join(", ")
                    );
                }
            }
            if let Some(k) = key {
                keys.push(k);
            }

            // A semantic query needs its vector; when the embedder is down
            // the query degrades to BM25 over the same text.
            let (text, vector) = match semantic {
                Some(q) => {
                    let vector = embed_query(&config, &q).await;
                    if vector.is_none() {
                        warn!("embedding unavailable; falling back to text search");
                    }
                    (Some(q), vector)
                }
                None => (query, None),
            };

            let hits = store.search(
                &SearchQuery {
                    prefix,
                    keys,
                    text,
                    vector,
                    limit,
                    filters: VerdictFilters {
                        source_verified,
                        subject,
                        max_age_days,
                        type_tag,
                    },
                },
                &config,
            )?;
            print_hits(&hits, format)?;
        }
        MemoryCmd::Store { key, value } => {
            let key = normalize_key(&key, &config.categories)?;
            store.upsert(&NewFact {
                key: key.clone(),
                value: value.clone(),
                source: "cli:store".to_string(),
                start_time: Utc::now(),
            })?;
            embed_stored(&store, &config, &key, &value).await;
            println!("stored {key}");
        }
        MemoryCmd::Forget { key } => match store.delete(&key) {
            Ok(()) => println!("forgot {key}"),
            Err(StoreError::NotFound { key }) => bail!("no active fact for key: {key}"),
            Err(e) => return Err(e.into()),
        },
        MemoryCmd::Context => {
            print!("{}", context_block(&store, &config)?);
        }
        MemoryCmd::Digest => {
            let path = config.store.digest_path();
            Aggregator::new(&store, &config).write_digest(&path)?;
            println!("wrote {}", path.display());
        }
        MemoryCmd::Daily { date } => {
            let date = date.unwrap_or_else(|| Utc::now().date_naive());
            Aggregator::new(&store, &config).write_daily(&config.store.daily_dir(), date)?;
            println!("wrote daily log for {date}");
        }
        MemoryCmd::Weekly { week } => {
            let (year, week) = match week {
                Some(spec) => parse_iso_week(&spec)
                    .with_context(|| format!("bad week spec {spec:?}, expected YYYY-Www"))?,
                None => {
                    let iso = Utc::now().iso_week();
                    (iso.year(), iso.week())
                }
            };
            let written = Aggregator::new(&store, &config).write_weekly(
                &config.store.topics_dir().join("weekly"),
                year,
                week,
            )?;
            println!("wrote {} files for {year}-W{week:02}", written.len());
        }
        MemoryCmd::Topics => {
            let written =
                Aggregator::new(&store, &config).write_topics(&config.store.topics_dir())?;
            println!("wrote {} topic files", written.len());
        }
        MemoryCmd::Reindex => {
            let repaired = store.recover()?;
            let indexed = store.reindex_fts()?;
            println!("repaired {repaired} rows, reindexed {indexed} active facts");
        }
    }
    Ok(EXIT_OK)
}

/// The session-start injection block: digest summary plus instincts at or
/// above the injection confidence.
fn context_block(store: &FactStore, config: &EngramConfig) -> Result<String> {
    let mut out = String::from("## Memory\n");
    out.push_str(&Aggregator::new(store, config).summary_line()?);
    out.push('\n');

    let instincts = injectable_instincts(store, config.instinct.inject_confidence)?;
    if !instincts.is_empty() {
        out.push_str("\n## Instincts\n");
        for di in instincts {
            out.push_str(&format!(
                "- [{:.1}] {}: {}\n",
                di.instinct.confidence, di.instinct.trigger, di.instinct.action
            ));
        }
    }
    Ok(out)
}

async fn embed_query(config: &EngramConfig, text: &str) -> Option<Vec<f32>> {
    let (_, embedder) = match build_providers(config) {
        Ok(p) => p,
        Err(e) => {
            warn!(err = %e, "no embedding provider");
            return None;
        }
    };
    match tokio::time::timeout(
        Duration::from_secs(EMBED_QUERY_TIMEOUT_SECS),
        embedder.embed(&config.embedding.model, &[text.to_string()]),
    )
    .await
    {
        Ok(Ok(mut vs)) if !vs.is_empty() => Some(vs.remove(0)),
        Ok(Ok(_)) => None,
        Ok(Err(e)) => {
            warn!(err = %e, "query embedding failed");
            None
        }
        Err(_) => {
            warn!("query embedding timed out");
            None
        }
    }
}

/// Best-effort immediate embed after `memory store`; the pipeline's lazy
/// pass picks the row up later if this fails.
async fn embed_stored(store: &FactStore, config: &EngramConfig, key: &str, value: &str) {
    let Some(vector) = embed_query(config, &format!("{key}: {value}")).await else {
        return;
    };
    if let Ok(Some(fact)) = store.active(key) {
        if let Err(e) = store.set_embedding(fact.id, &vector) {
            warn!(key, err = %e, "could not embed stored fact");
        }
    }
}

fn print_hits(hits: &[engram_store::SearchHit], format: Format) -> Result<()> {
    match format {
        Format::Text => {
            for h in hits {
                match h.score {
                    Some(s) => println!("{}: {} ({s:.3})", h.key, h.value),
                    None => println!("{}: {}", h.key, h.value),
                }
            }
        }
        Format::Json => println!("{}", serde_json::to_string_pretty(hits)?),
        Format::Hook => {
            if !hits.is_empty() {
                println!("## Relevant memory");
                for h in hits {
                    println!("- {}: {}", h.key, h.value);
                }
            }
        }
    }
    Ok(())
}

fn parse_iso_week(spec: &str) -> Option<(i32, u32)> {
    let (year, week) = spec.split_once("-W")?;
    Some((year.parse().ok()?, week.parse().ok()?))
}
