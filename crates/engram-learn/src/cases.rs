//! Error→recovery case detection.
//!
//! A case is an error tool-result followed within a short window by a
//! successful result in the same session. The tools used in between are the
//! solution; the assistant's next explanation (when the transcript carries
//! messages) becomes its description.

use std::collections::BTreeMap;

use engram_core::transcript::{NormalizedMessage, Role, ToolEvent};

use crate::types::{content_id, Case, ErrorCategory, Solution};

/// How many subsequent tool results may separate the error from its recovery.
const RECOVERY_WINDOW: usize = 4;
/// Action descriptors kept per solution.
const MAX_ACTIONS: usize = 3;
const ACTION_TRUNCATE: usize = 120;
const PROBLEM_TRUNCATE: usize = 200;

/// A detected case plus the store key it should live under.
#[derive(Debug, Clone)]
pub struct DetectedCase {
    pub key: String,
    pub case: Case,
    pub category: ErrorCategory,
}

/// Scan tool events (grouped per session, chronological) for error→recovery
/// pairs. `messages` may be empty — observation-log callers have no
/// transcript text.
pub fn extract_cases(events: &[ToolEvent], messages: &[NormalizedMessage]) -> Vec<DetectedCase> {
    let mut sessions: BTreeMap<&str, Vec<&ToolEvent>> = BTreeMap::new();
    for ev in events {
        sessions.entry(ev.session_id.as_str()).or_default().push(ev);
    }

    let mut cases = Vec::new();
    for (session_id, mut evs) in sessions {
        evs.sort_by_key(|e| e.timestamp);

        let mut i = 0;
        while i < evs.len() {
            if !evs[i].is_error {
                i += 1;
                continue;
            }
            let error = evs[i];

            // look ahead for the first success inside the window
            let window_end = (i + 1 + RECOVERY_WINDOW).min(evs.len());
            let Some(rel) = evs[i + 1..window_end].iter().position(|e| !e.is_error) else {
                i += 1;
                continue;
            };
            let success_idx = i + 1 + rel;
            let recovery = &evs[i + 1..=success_idx];

            let problem = extract_problem(&error.output);
            let category = ErrorCategory::classify(&error.output);
            let solution = build_solution(recovery, messages, evs[success_idx].timestamp);

            cases.push(DetectedCase {
                key: format!(
                    "agent.case.{}.{}",
                    category,
                    content_id(&[session_id, &problem, &error.timestamp.to_rfc3339()])
                ),
                case: Case {
                    problem,
                    solution,
                    outcome: "resolved".to_string(),
                    session: session_id.to_string(),
                    timestamp: error.timestamp,
                },
                category,
            });

            // continue past the recovery — one case per error
            i = success_idx + 1;
        }
    }
    cases
}

/// Keyword-salience problem extraction: prefer the first line that names the
/// failure, fall back to the first non-empty line.
fn extract_problem(output: &str) -> String {
    const SALIENT: &[&str] = &[
        "error", "failed", "failure", "denied", "not found", "exception", "panic", "fatal",
    ];
    let lower_match = |line: &str| {
        let l = line.to_lowercase();
        SALIENT.iter().any(|m| l.contains(m))
    };

    let line = output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .find(|l| lower_match(l))
        .or_else(|| output.lines().map(str::trim).find(|l| !l.is_empty()))
        .unwrap_or("unknown error");

    truncate(line, PROBLEM_TRUNCATE)
}

fn build_solution(
    recovery: &[&ToolEvent],
    messages: &[NormalizedMessage],
    resolved_at: chrono::DateTime<chrono::Utc>,
) -> Solution {
    let mut tools: Vec<String> = Vec::new();
    for ev in recovery {
        if !tools.contains(&ev.tool_name) {
            tools.push(ev.tool_name.clone());
        }
    }

    let actions: Vec<String> = recovery
        .iter()
        .filter(|e| !e.action.is_empty())
        .take(MAX_ACTIONS)
        .map(|e| truncate(&e.action, ACTION_TRUNCATE))
        .collect();

    // The assistant turn right after the recovery is its own explanation of
    // what fixed the problem.
    let description = messages
        .iter()
        .filter(|m| m.role == Role::Assistant && m.timestamp >= resolved_at)
        .map(|m| truncate(&m.text, ACTION_TRUNCATE))
        .next()
        .unwrap_or_default();

    Solution {
        tools,
        actions,
        description,
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}…")
    } else {
        s.to_string()
    }
}
