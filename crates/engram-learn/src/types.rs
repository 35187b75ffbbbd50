//! Typed records for the learning layer.
//!
//! Cases, patterns, and instincts live in the fact store as JSON-encoded
//! values under `agent.*` keys. They are parsed into these records once, at
//! the boundary — nothing downstream pokes at raw JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A learned error→recovery record (`agent.case.<error_type>.<id>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub problem: String,
    pub solution: Solution,
    pub outcome: String,
    pub session: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Solution {
    /// Deduplicated tool names used between the error and the recovery.
    pub tools: Vec<String>,
    /// Up to three truncated action descriptors.
    pub actions: Vec<String>,
    /// The assistant's own explanation, when one was given.
    pub description: String,
}

/// A usage pattern (`agent.pattern.*`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Pattern {
    Frequent {
        tool: String,
        count: usize,
        confidence: f64,
    },
    Sequence {
        sequence: Vec<String>,
        count: usize,
        confidence: f64,
    },
    Workflow {
        tools: Vec<String>,
        count: usize,
        confidence: f64,
    },
}

impl Pattern {
    pub fn count(&self) -> usize {
        match self {
            Pattern::Frequent { count, .. }
            | Pattern::Sequence { count, .. }
            | Pattern::Workflow { count, .. } => *count,
        }
    }
}

/// A high-confidence behavioral rule (`agent.instinct.<domain>.<id>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instinct {
    pub trigger: String,
    pub action: String,
    pub confidence: f64,
    pub domain: String,
    pub evidence_count: usize,
}

/// Error classes a case can fall into — the third key segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Permission,
    NotFound,
    Syntax,
    TestFailure,
    Network,
    Conflict,
    Import,
    Generic,
}

impl ErrorCategory {
    /// Classify an error payload by keyword salience. Ordering matters:
    /// the more specific classes are probed before the ones whose markers
    /// they contain ("module not found" is an import problem, not a
    /// not-found problem).
    pub fn classify(text: &str) -> Self {
        let t = text.to_lowercase();
        if contains_any(&t, &["test failed", "tests failed", "assertion", "test result: failed"]) {
            Self::TestFailure
        } else if contains_any(
            &t,
            &["module not found", "cannot find module", "unresolved import", "importerror", "no module named"],
        ) {
            Self::Import
        } else if contains_any(&t, &["permission denied", "eacces", "not permitted", "unauthorized", "forbidden"]) {
            Self::Permission
        } else if contains_any(&t, &["not found", "no such file", "enoent", "404", "does not exist"]) {
            Self::NotFound
        } else if contains_any(&t, &["syntax error", "parse error", "unexpected token", "expected `"]) {
            Self::Syntax
        } else if contains_any(&t, &["connection", "timed out", "timeout", "refused", "dns", "unreachable"]) {
            Self::Network
        } else if contains_any(&t, &["conflict", "already exists", "locked", "would be overwritten"]) {
            Self::Conflict
        } else {
            Self::Generic
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Permission => "permission",
            Self::NotFound => "not_found",
            Self::Syntax => "syntax",
            Self::TestFailure => "test_failure",
            Self::Network => "network",
            Self::Conflict => "conflict",
            Self::Import => "import",
            Self::Generic => "generic",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn contains_any(text: &str, markers: &[&str]) -> bool {
    markers.iter().any(|m| text.contains(m))
}

/// Short stable id from arbitrary content (12 hex chars of SHA-256).
pub fn content_id(parts: &[&str]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(&hasher.finalize()[..6])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_priorities() {
        assert_eq!(
            ErrorCategory::classify("Exit code 1: 3 tests failed"),
            ErrorCategory::TestFailure
        );
        assert_eq!(
            ErrorCategory::classify("error: module not found: utils"),
            ErrorCategory::Import
        );
        assert_eq!(
            ErrorCategory::classify("bash: /etc/shadow: Permission denied"),
            ErrorCategory::Permission
        );
        assert_eq!(
            ErrorCategory::classify("cat: foo.txt: No such file or directory"),
            ErrorCategory::NotFound
        );
        assert_eq!(
            ErrorCategory::classify("SyntaxError: unexpected token ';'"),
            ErrorCategory::Syntax
        );
        assert_eq!(
            ErrorCategory::classify("connect ECONNREFUSED 127.0.0.1:5432"),
            ErrorCategory::Network
        );
        assert_eq!(
            ErrorCategory::classify("CONFLICT (content): merge conflict in src/lib.rs"),
            ErrorCategory::Conflict
        );
        assert_eq!(ErrorCategory::classify("something odd"), ErrorCategory::Generic);
    }

    #[test]
    fn pattern_serde_tagging() {
        let p = Pattern::Frequent {
            tool: "Bash".to_string(),
            count: 7,
            confidence: 0.35,
        };
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains(r#""type":"frequent""#));
        let back: Pattern = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn content_id_is_stable_and_short() {
        let a = content_id(&["s1", "problem text"]);
        let b = content_id(&["s1", "problem text"]);
        let c = content_id(&["s1", "other"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 12);
    }
}
