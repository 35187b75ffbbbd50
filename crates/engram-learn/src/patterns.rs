//! Tool-usage pattern mining over observed tool events.

use std::collections::BTreeMap;

use engram_core::transcript::ToolEvent;

use crate::types::{content_id, Pattern};

/// Minimum uses before a tool counts as frequent.
const FREQUENT_THRESHOLD: usize = 5;
/// Minimum occurrences before a 2/3-step sequence is a pattern.
const SEQUENCE_THRESHOLD: usize = 3;
/// Minimum length of an unbroken success streak.
const WORKFLOW_STREAK: usize = 5;

/// A mined pattern plus its store key.
#[derive(Debug, Clone)]
pub struct DetectedPattern {
    pub key: String,
    pub pattern: Pattern,
}

pub fn extract_patterns(events: &[ToolEvent]) -> Vec<DetectedPattern> {
    let mut out = Vec::new();
    out.extend(frequent_tools(events));
    out.extend(sequences(events));
    out.extend(workflows(events));
    out
}

fn frequent_tools(events: &[ToolEvent]) -> Vec<DetectedPattern> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for ev in events {
        *counts.entry(ev.tool_name.as_str()).or_default() += 1;
    }
    counts
        .into_iter()
        .filter(|(_, n)| *n >= FREQUENT_THRESHOLD)
        .map(|(tool, count)| DetectedPattern {
            key: format!("agent.pattern.frequent_{}", tool.to_lowercase()),
            pattern: Pattern::Frequent {
                tool: tool.to_string(),
                count,
                confidence: scaled_confidence(count, 20),
            },
        })
        .collect()
}

/// Count 2-step and 3-step tool n-grams within each session.
fn sequences(events: &[ToolEvent]) -> Vec<DetectedPattern> {
    let mut counts: BTreeMap<Vec<String>, usize> = BTreeMap::new();
    for session in per_session(events).values() {
        let names: Vec<&str> = session.iter().map(|e| e.tool_name.as_str()).collect();
        for width in [2usize, 3] {
            for window in names.windows(width) {
                let seq: Vec<String> = window.iter().map(|s| s.to_string()).collect();
                *counts.entry(seq).or_default() += 1;
            }
        }
    }

    counts
        .into_iter()
        .filter(|(_, n)| *n >= SEQUENCE_THRESHOLD)
        .map(|(seq, count)| {
            let joined = seq.join("→");
            DetectedPattern {
                key: format!("agent.pattern.sequence_{}", content_id(&[&joined])),
                pattern: Pattern::Sequence {
                    sequence: seq,
                    count,
                    confidence: scaled_confidence(count, 10),
                },
            }
        })
        .collect()
}

/// Contiguous all-success streaks of ≥5 tool calls become workflows, keyed
/// by their distinct tool signature.
fn workflows(events: &[ToolEvent]) -> Vec<DetectedPattern> {
    let mut streaks: BTreeMap<Vec<String>, (usize, usize)> = BTreeMap::new(); // sig → (occurrences, max_len)

    for session in per_session(events).values() {
        let mut run: Vec<&str> = Vec::new();
        let mut flush = |run: &mut Vec<&str>, streaks: &mut BTreeMap<Vec<String>, (usize, usize)>| {
            if run.len() >= WORKFLOW_STREAK {
                let mut sig: Vec<String> = Vec::new();
                for name in run.iter() {
                    if !sig.contains(&name.to_string()) {
                        sig.push(name.to_string());
                    }
                }
                let entry = streaks.entry(sig).or_insert((0, 0));
                entry.0 += 1;
                entry.1 = entry.1.max(run.len());
            }
            run.clear();
        };

        for ev in session {
            if ev.is_error {
                flush(&mut run, &mut streaks);
            } else {
                run.push(ev.tool_name.as_str());
            }
        }
        flush(&mut run, &mut streaks);
    }

    streaks
        .into_iter()
        .map(|(tools, (occurrences, _))| {
            let joined = tools.join("→");
            DetectedPattern {
                key: format!("agent.pattern.workflow_{}", content_id(&[&joined])),
                pattern: Pattern::Workflow {
                    tools,
                    count: occurrences,
                    confidence: scaled_confidence(occurrences * 3, 10),
                },
            }
        })
        .collect()
}

fn per_session(events: &[ToolEvent]) -> BTreeMap<&str, Vec<&ToolEvent>> {
    let mut sessions: BTreeMap<&str, Vec<&ToolEvent>> = BTreeMap::new();
    for ev in events {
        sessions.entry(ev.session_id.as_str()).or_default().push(ev);
    }
    for evs in sessions.values_mut() {
        evs.sort_by_key(|e| e.timestamp);
    }
    sessions
}

fn scaled_confidence(count: usize, denominator: usize) -> f64 {
    ((count as f64) / (denominator as f64)).min(0.9)
}
