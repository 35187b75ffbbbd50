//! Temporal alignment: raw extracted facts → timed facts with
//! `[start_time, end_time)` intervals.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::extract::AttributedFact;

/// A fact with its validity interval derived. `end_time = None` means the
/// value is still current as far as this batch knows.
#[derive(Debug, Clone)]
pub struct TimedFact {
    pub key: String,
    pub value: String,
    pub source: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Derive intervals for a batch of attributed facts.
///
/// Per key: sort by message timestamp (stable, so same-instant entries keep
/// insertion order), collapse consecutive identical values onto the earliest
/// occurrence, then chain each entry's `end_time` to its successor's start.
/// Output is grouped by key in key order, chronological within each key —
/// exactly the order the store wants commits in.
pub fn align(facts: Vec<AttributedFact>) -> Vec<TimedFact> {
    let mut groups: BTreeMap<String, Vec<AttributedFact>> = BTreeMap::new();
    for fact in facts {
        groups.entry(fact.key.clone()).or_default().push(fact);
    }

    let mut out = Vec::new();
    for (key, mut group) in groups {
        group.sort_by_key(|f| f.message_timestamp);

        // Collapse runs of the same canonical value, keeping the earliest.
        let mut deduped: Vec<AttributedFact> = Vec::with_capacity(group.len());
        for fact in group {
            match deduped.last() {
                Some(prev) if canonical(&prev.value) == canonical(&fact.value) => {}
                _ => deduped.push(fact),
            }
        }

        let next_starts: Vec<Option<DateTime<Utc>>> = deduped
            .iter()
            .skip(1)
            .map(|f| Some(f.message_timestamp))
            .chain(std::iter::once(None))
            .collect();

        for (fact, end_time) in deduped.into_iter().zip(next_starts) {
            out.push(TimedFact {
                key: key.clone(),
                value: fact.value,
                source: fact.source,
                start_time: fact.message_timestamp,
                end_time,
            });
        }
    }
    out
}

fn canonical(value: &str) -> &str {
    value.trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fact(key: &str, value: &str, secs: i64) -> AttributedFact {
        AttributedFact {
            key: key.to_string(),
            value: value.to_string(),
            source: "session:test".to_string(),
            message_timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[test]
    fn chains_intervals_per_key() {
        let timed = align(vec![
            fact("user.city", "Taipei", 100),
            fact("user.city", "Hsinchu", 200),
        ]);
        assert_eq!(timed.len(), 2);
        assert_eq!(timed[0].value, "Taipei");
        assert_eq!(timed[0].end_time.unwrap().timestamp(), 200);
        assert_eq!(timed[1].value, "Hsinchu");
        assert!(timed[1].end_time.is_none());
    }

    #[test]
    fn sorts_before_chaining() {
        let timed = align(vec![
            fact("user.city", "Hsinchu", 200),
            fact("user.city", "Taipei", 100),
        ]);
        assert_eq!(timed[0].value, "Taipei");
        assert_eq!(timed[1].value, "Hsinchu");
    }

    #[test]
    fn collapses_consecutive_identical_values() {
        let timed = align(vec![
            fact("user.editor", "vscode", 100),
            fact("user.editor", " vscode ", 150),
            fact("user.editor", "vim", 200),
            fact("user.editor", "vscode", 300),
        ]);
        // vscode (earliest kept), vim, vscode again — the later reappearance
        // is a genuine change, not a duplicate.
        assert_eq!(timed.len(), 3);
        assert_eq!(timed[0].start_time.timestamp(), 100);
        assert_eq!(timed[0].end_time.unwrap().timestamp(), 200);
        assert_eq!(timed[2].value, "vscode");
    }

    #[test]
    fn identical_timestamp_same_value_is_total_dedup() {
        let timed = align(vec![
            fact("user.city", "Taipei", 100),
            fact("user.city", "Taipei", 100),
        ]);
        assert_eq!(timed.len(), 1);
    }

    #[test]
    fn identical_timestamp_different_values_keep_insertion_order() {
        let timed = align(vec![
            fact("user.city", "Taipei", 100),
            fact("user.city", "Hsinchu", 100),
        ]);
        // Zero-length interval for all but the last — accepted edge case.
        assert_eq!(timed.len(), 2);
        assert_eq!(timed[0].value, "Taipei");
        assert_eq!(timed[0].end_time.unwrap(), timed[1].start_time);
        assert_eq!(timed[1].value, "Hsinchu");
    }

    #[test]
    fn keys_are_independent() {
        let timed = align(vec![
            fact("user.city", "Taipei", 100),
            fact("user.name", "Ada", 50),
        ]);
        assert_eq!(timed.len(), 2);
        assert!(timed.iter().all(|f| f.end_time.is_none()));
    }
}
