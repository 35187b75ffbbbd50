//! Normalized conversation schema.
//!
//! Every host adapter (Claude-style JSONL, Gemini exports) decodes into this
//! shape. The consolidation pipeline reads `messages`; the learning extractor
//! reads `tool_events`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// A single text turn, in conversation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// One tool invocation observed during a session.
///
/// `action` is a short descriptor of the input (e.g. the command line for a
/// shell tool); `output` is the result payload, truncated by the adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEvent {
    pub session_id: String,
    pub tool_name: String,
    pub action: String,
    pub output: String,
    pub is_error: bool,
    pub timestamp: DateTime<Utc>,
}

/// A fully decoded session: ordered messages plus any tool events the host
/// transcript carried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedSession {
    /// Stable identifier, e.g. the transcript file stem.
    pub source_id: String,
    pub messages: Vec<NormalizedMessage>,
    pub tool_events: Vec<ToolEvent>,
}

impl NormalizedSession {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.tool_events.is_empty()
    }

    /// Earliest message timestamp — the pipeline stamps extracted facts
    /// with this when a chunk has no finer-grained time.
    pub fn earliest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.messages.iter().map(|m| m.timestamp).min()
    }

    /// `session:<first-segment>` provenance tag for facts from this source.
    pub fn provenance(&self) -> String {
        let first = self
            .source_id
            .split(['-', '.'])
            .next()
            .unwrap_or(&self.source_id);
        format!("session:{first}")
    }
}
