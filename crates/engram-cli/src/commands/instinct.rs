use std::collections::BTreeMap;

use anyhow::{bail, Result};

use engram_core::config::EngramConfig;
use engram_core::key;
use engram_learn::{injectable_instincts, store_instincts, synthesize_instincts, Instinct};
use engram_store::{FactStore, StoreError};

use crate::{InstinctCmd, EXIT_OK};

pub fn run(cmd: InstinctCmd, config: EngramConfig) -> Result<u8> {
    let store = FactStore::open(&config.store.db_path())?;

    match cmd {
        InstinctCmd::List { domain } => {
            // confidence 0 = list everything stored
            let mut instincts = injectable_instincts(&store, 0.0)?;
            if let Some(domain) = domain {
                instincts.retain(|di| di.instinct.domain == domain);
            }
            if instincts.is_empty() {
                println!("no instincts stored");
            }
            for di in instincts {
                println!(
                    "{}  [{:.1}, n={}]  {} → {}",
                    di.key,
                    di.instinct.confidence,
                    di.instinct.evidence_count,
                    di.instinct.trigger,
                    di.instinct.action
                );
            }
        }
        InstinctCmd::Show { key } => {
            let Some(fact) = store.active(&key)? else {
                bail!("no active instinct: {key}");
            };
            let instinct: Instinct = serde_json::from_str(&fact.value)?;
            println!("key:        {key}");
            println!("domain:     {}", instinct.domain);
            println!("trigger:    {}", instinct.trigger);
            println!("action:     {}", instinct.action);
            println!("confidence: {:.2}", instinct.confidence);
            println!("evidence:   {}", instinct.evidence_count);
            println!("since:      {}", fact.start_time.to_rfc3339());
        }
        InstinctCmd::Extract {
            min_confidence,
            store: persist,
            from_observations,
        } => {
            if from_observations {
                let (cases, patterns) = mine_observations(&store, &config)?;
                println!("mined {cases} cases, {patterns} patterns from observations");
            }
            let floor = min_confidence.unwrap_or(config.instinct.min_confidence);
            let instincts = synthesize_instincts(&store, floor)?;
            for di in &instincts {
                println!(
                    "{}  [{:.1}]  {}",
                    di.key, di.instinct.confidence, di.instinct.action
                );
            }
            if persist {
                let written = store_instincts(&store, &instincts)?;
                println!("{} instincts derived, {} written", instincts.len(), written);
            } else {
                println!("{} instincts derived (dry run, use --store to persist)", instincts.len());
            }
        }
        InstinctCmd::Delete { key } => match store.delete(&key) {
            Ok(()) => println!("deleted {key}"),
            Err(StoreError::NotFound { key }) => bail!("no active instinct: {key}"),
            Err(e) => return Err(e.into()),
        },
        InstinctCmd::Stats => print_stats(&store)?,
    }
    Ok(EXIT_OK)
}

/// Turn the observation log into stored cases and patterns so the synthesis
/// pass can see tool activity that never went through the pipeline.
fn mine_observations(store: &FactStore, config: &EngramConfig) -> Result<(usize, usize)> {
    use chrono::Utc;
    use engram_hooks::observe::ObservationLog;
    use engram_store::{NewFact, UpsertOutcome};

    let events = ObservationLog::new(config.store.observations_path()).read_events()?;
    let mut stored_cases = 0usize;
    for dc in engram_learn::extract_cases(&events, &[]) {
        let outcome = store.upsert(&NewFact {
            key: dc.key.clone(),
            value: serde_json::to_string(&dc.case)?,
            source: "auto:learning".to_string(),
            start_time: dc.case.timestamp,
        })?;
        if !matches!(outcome, UpsertOutcome::Skip) {
            stored_cases += 1;
        }
    }

    let mut stored_patterns = 0usize;
    let now = Utc::now();
    for dp in engram_learn::extract_patterns(&events) {
        let outcome = store.upsert(&NewFact {
            key: dp.key.clone(),
            value: serde_json::to_string(&dp.pattern)?,
            source: "auto:learning".to_string(),
            start_time: now,
        })?;
        if !matches!(outcome, UpsertOutcome::Skip) {
            stored_patterns += 1;
        }
    }
    Ok((stored_cases, stored_patterns))
}

fn print_stats(store: &FactStore) -> Result<()> {
    let cases = store.active_prefix("agent.case.")?;
    let patterns = store.active_prefix("agent.pattern.")?;
    let instincts = injectable_instincts(store, 0.0)?;

    println!("cases:     {}", cases.len());
    let mut by_type: BTreeMap<&str, usize> = BTreeMap::new();
    for c in &cases {
        *by_type
            .entry(key::segment(&c.key, 2).unwrap_or("unknown"))
            .or_default() += 1;
    }
    let mut ranked: Vec<_> = by_type.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    for (error_type, count) in ranked {
        println!("  {error_type}: {count}");
    }

    println!("patterns:  {}", patterns.len());
    println!("instincts: {}", instincts.len());
    if !instincts.is_empty() {
        let avg: f64 = instincts.iter().map(|di| di.instinct.confidence).sum::<f64>()
            / instincts.len() as f64;
        println!("  avg confidence: {avg:.2}");
    }
    Ok(())
}
