//! Instinct synthesis: aggregate stored cases and patterns into
//! high-confidence behavioral rules, written back into the store so prior
//! generations are superseded in place.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{debug, warn};

use engram_core::key;
use engram_store::{FactStore, NewFact};

use crate::error::Result;
use crate::types::{Case, Instinct, Pattern};

/// Cases per error type before an instinct forms.
const CASE_GROUP_MIN: usize = 2;
/// Frequent-tool uses before a preference instinct forms.
const TOOL_PREFER_MIN: usize = 10;
/// Workflow / sequence occurrences before a workflow instinct forms.
const WORKFLOW_MIN: usize = 2;

/// An instinct plus the store key it should live under.
#[derive(Debug, Clone)]
pub struct DetectedInstinct {
    pub key: String,
    pub instinct: Instinct,
}

/// Confidence step function over evidence group size.
pub fn confidence_for_group(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 0.5,
        3 | 4 => 0.6,
        5 | 6 => 0.7,
        7..=9 => 0.8,
        _ => 0.9,
    }
}

/// Load active cases and patterns from the store and derive instincts,
/// deduplicated by key and filtered by `min_confidence`.
pub fn synthesize_instincts(
    store: &FactStore,
    min_confidence: f64,
) -> Result<Vec<DetectedInstinct>> {
    let mut by_key: BTreeMap<String, Instinct> = BTreeMap::new();

    // Cases, grouped by error type (third key segment).
    let mut groups: BTreeMap<String, Vec<Case>> = BTreeMap::new();
    for fact in store.active_prefix("agent.case.")? {
        let Some(error_type) = key::segment(&fact.key, 2) else {
            continue;
        };
        match serde_json::from_str::<Case>(&fact.value) {
            Ok(case) => groups.entry(error_type.to_string()).or_default().push(case),
            Err(e) => warn!(key = %fact.key, err = %e, "unreadable case; skipping"),
        }
    }

    for (error_type, mut cases) in groups {
        if cases.len() < CASE_GROUP_MIN {
            continue;
        }
        cases.sort_by_key(|c| c.timestamp);
        let n = cases.len();

        // Tools used in at least half the cases (rounded up).
        let majority = n.div_ceil(2);
        let mut tool_counts: BTreeMap<&str, usize> = BTreeMap::new();
        for case in &cases {
            for tool in &case.solution.tools {
                *tool_counts.entry(tool.as_str()).or_default() += 1;
            }
        }
        let common_tools: Vec<&str> = tool_counts
            .iter()
            .filter(|(_, c)| **c >= majority)
            .map(|(t, _)| *t)
            .collect();

        let latest = cases.last().expect("group is non-empty");
        let action = if latest.solution.description.is_empty() {
            format!("use {}", join_or(&common_tools, "the usual tools"))
        } else {
            format!(
                "use {}; previously: {}",
                join_or(&common_tools, "the usual tools"),
                latest.solution.description
            )
        };

        by_key.insert(
            format!("agent.instinct.error.{error_type}"),
            Instinct {
                trigger: format!("{error_type} error encountered"),
                action,
                confidence: confidence_for_group(n),
                domain: "error".to_string(),
                evidence_count: n,
            },
        );
    }

    // Patterns.
    let mut workflow_best: Option<(Vec<String>, usize)> = None;
    let mut workflow_total = 0usize;
    for fact in store.active_prefix("agent.pattern.")? {
        let pattern = match serde_json::from_str::<Pattern>(&fact.value) {
            Ok(p) => p,
            Err(e) => {
                warn!(key = %fact.key, err = %e, "unreadable pattern; skipping");
                continue;
            }
        };
        match pattern {
            Pattern::Frequent { tool, count, .. } if count >= TOOL_PREFER_MIN => {
                by_key.insert(
                    format!("agent.instinct.tool.prefer_{}", tool.to_lowercase()),
                    Instinct {
                        trigger: "selecting a tool for routine work".to_string(),
                        action: format!("prefer {tool}"),
                        confidence: ((count as f64) / 20.0).clamp(0.5, 0.9),
                        domain: "tool".to_string(),
                        evidence_count: count,
                    },
                );
            }
            Pattern::Sequence { sequence, count, .. } if count >= WORKFLOW_MIN => {
                let joined = sequence.join(" → ");
                let Some(id) = fact.key.rsplit('_').next() else {
                    continue;
                };
                by_key.insert(
                    format!("agent.instinct.workflow.seq_{id}"),
                    Instinct {
                        trigger: format!("after running {}", sequence[0]),
                        action: format!("continue the usual chain: {joined}"),
                        confidence: 0.6,
                        domain: "workflow".to_string(),
                        evidence_count: count,
                    },
                );
            }
            Pattern::Workflow { tools, count, .. } if count >= WORKFLOW_MIN => {
                workflow_total += count;
                let better = workflow_best
                    .as_ref()
                    .is_none_or(|(_, best)| count > *best);
                if better {
                    workflow_best = Some((tools, count));
                }
            }
            _ => {}
        }
    }

    if let Some((tools, _)) = workflow_best {
        by_key.insert(
            "agent.instinct.workflow.common_sequence".to_string(),
            Instinct {
                trigger: "starting a multi-step task".to_string(),
                action: format!("the usual successful flow is {}", tools.join(" → ")),
                confidence: 0.6,
                domain: "workflow".to_string(),
                evidence_count: workflow_total,
            },
        );
    }

    let out: Vec<DetectedInstinct> = by_key
        .into_iter()
        .filter(|(_, i)| i.confidence >= min_confidence)
        .map(|(key, instinct)| DetectedInstinct { key, instinct })
        .collect();
    debug!(count = out.len(), "instincts synthesized");
    Ok(out)
}

/// Persist instincts via upsert — unchanged values are skipped, changed ones
/// supersede the previous generation. Returns how many rows were written.
pub fn store_instincts(store: &FactStore, instincts: &[DetectedInstinct]) -> Result<usize> {
    let now = Utc::now();
    let mut written = 0usize;
    for di in instincts {
        let outcome = store.upsert(&NewFact {
            key: di.key.clone(),
            value: serde_json::to_string(&di.instinct)?,
            source: "auto:instinct-extraction".to_string(),
            start_time: now,
        })?;
        if !matches!(outcome, engram_store::UpsertOutcome::Skip) {
            written += 1;
        }
    }
    Ok(written)
}

/// The instincts worth injecting at session start.
pub fn injectable_instincts(
    store: &FactStore,
    min_confidence: f64,
) -> Result<Vec<DetectedInstinct>> {
    let mut out = Vec::new();
    for fact in store.active_prefix("agent.instinct.")? {
        match serde_json::from_str::<Instinct>(&fact.value) {
            Ok(instinct) if instinct.confidence >= min_confidence => out.push(DetectedInstinct {
                key: fact.key,
                instinct,
            }),
            Ok(_) => {}
            Err(e) => warn!(key = %fact.key, err = %e, "unreadable instinct; skipping"),
        }
    }
    Ok(out)
}

fn join_or<'a>(items: &[&'a str], fallback: &'a str) -> String {
    if items.is_empty() {
        fallback.to_string()
    } else {
        items.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Solution;
    use chrono::TimeZone;

    fn seed_case(store: &FactStore, error_type: &str, id: &str, tools: &[&str], secs: i64) {
        let case = Case {
            problem: format!("{error_type} problem"),
            solution: Solution {
                tools: tools.iter().map(|t| t.to_string()).collect(),
                actions: vec!["retried with fix".to_string()],
                description: "adjusted the command".to_string(),
            },
            outcome: "resolved".to_string(),
            session: "s1".to_string(),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
        };
        store
            .upsert(&NewFact {
                key: format!("agent.case.{error_type}.{id}"),
                value: serde_json::to_string(&case).unwrap(),
                source: "test".to_string(),
                start_time: Utc.timestamp_opt(secs, 0).unwrap(),
            })
            .unwrap();
    }

    #[test]
    fn confidence_steps() {
        assert_eq!(confidence_for_group(2), 0.5);
        assert_eq!(confidence_for_group(3), 0.6);
        assert_eq!(confidence_for_group(4), 0.6);
        assert_eq!(confidence_for_group(5), 0.7);
        assert_eq!(confidence_for_group(7), 0.8);
        assert_eq!(confidence_for_group(10), 0.9);
        assert_eq!(confidence_for_group(25), 0.9);
    }

    #[test]
    fn three_cases_one_error_instinct() {
        let store = FactStore::open_in_memory().unwrap();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            seed_case(&store, "test_failure", id, &["Bash"], 100 + i as i64);
        }

        let instincts = synthesize_instincts(&store, 0.5).unwrap();
        assert_eq!(instincts.len(), 1);
        let di = &instincts[0];
        assert_eq!(di.key, "agent.instinct.error.test_failure");
        assert_eq!(di.instinct.confidence, 0.6);
        assert_eq!(di.instinct.evidence_count, 3);
        assert!(di.instinct.action.contains("Bash"));
    }

    #[test]
    fn single_case_is_not_enough() {
        let store = FactStore::open_in_memory().unwrap();
        seed_case(&store, "network", "only", &["Bash"], 100);
        assert!(synthesize_instincts(&store, 0.5).unwrap().is_empty());
    }

    #[test]
    fn min_confidence_filters_small_groups() {
        let store = FactStore::open_in_memory().unwrap();
        seed_case(&store, "syntax", "a", &["Edit"], 100);
        seed_case(&store, "syntax", "b", &["Edit"], 200);
        // n=2 → 0.5; a 0.6 floor drops it
        assert!(synthesize_instincts(&store, 0.6).unwrap().is_empty());
        assert_eq!(synthesize_instincts(&store, 0.5).unwrap().len(), 1);
    }

    #[test]
    fn frequent_pattern_becomes_tool_preference() {
        let store = FactStore::open_in_memory().unwrap();
        let pattern = Pattern::Frequent {
            tool: "Bash".to_string(),
            count: 12,
            confidence: 0.6,
        };
        store
            .upsert(&NewFact {
                key: "agent.pattern.frequent_bash".to_string(),
                value: serde_json::to_string(&pattern).unwrap(),
                source: "test".to_string(),
                start_time: Utc.timestamp_opt(100, 0).unwrap(),
            })
            .unwrap();

        let instincts = synthesize_instincts(&store, 0.5).unwrap();
        assert_eq!(instincts.len(), 1);
        assert_eq!(instincts[0].key, "agent.instinct.tool.prefer_bash");
        assert_eq!(instincts[0].instinct.evidence_count, 12);
    }

    #[test]
    fn extraction_is_idempotent_via_supersession() {
        let store = FactStore::open_in_memory().unwrap();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            seed_case(&store, "test_failure", id, &["Bash"], 100 + i as i64);
        }

        let first = synthesize_instincts(&store, 0.5).unwrap();
        assert_eq!(store_instincts(&store, &first).unwrap(), 1);

        // identical second run: value unchanged → upsert skips
        let second = synthesize_instincts(&store, 0.5).unwrap();
        assert_eq!(store_instincts(&store, &second).unwrap(), 0);
        assert_eq!(
            store
                .history("agent.instinct.error.test_failure")
                .unwrap()
                .len(),
            1
        );

        // new evidence changes the value → one supersession, no duplicate key
        seed_case(&store, "test_failure", "d", &["Bash"], 400);
        seed_case(&store, "test_failure", "e", &["Bash"], 500);
        let third = synthesize_instincts(&store, 0.5).unwrap();
        assert_eq!(store_instincts(&store, &third).unwrap(), 1);
        let history = store
            .history("agent.instinct.error.test_failure")
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(
            history.iter().filter(|f| f.is_active()).count(),
            1
        );
    }

    #[test]
    fn injectable_filters_by_confidence() {
        let store = FactStore::open_in_memory().unwrap();
        for (key, conf) in [
            ("agent.instinct.error.syntax", 0.5),
            ("agent.instinct.error.test_failure", 0.8),
        ] {
            let instinct = Instinct {
                trigger: "t".to_string(),
                action: "a".to_string(),
                confidence: conf,
                domain: "error".to_string(),
                evidence_count: 3,
            };
            store
                .upsert(&NewFact {
                    key: key.to_string(),
                    value: serde_json::to_string(&instinct).unwrap(),
                    source: "test".to_string(),
                    start_time: Utc.timestamp_opt(100, 0).unwrap(),
                })
                .unwrap();
        }

        let inject = injectable_instincts(&store, 0.6).unwrap();
        assert_eq!(inject.len(), 1);
        assert_eq!(inject[0].key, "agent.instinct.error.test_failure");
    }
}
