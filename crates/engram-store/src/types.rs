use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A `(key, start_time)` row — the atomic unit of memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: i64,
    pub key: String,
    pub value: String,
    /// Provenance tag, e.g. `session:<id>`, `auto:instinct-extraction`,
    /// `cli:store`.
    pub source: String,
    pub start_time: DateTime<Utc>,
    /// `None` ⇒ this is the active row for its key.
    pub end_time: Option<DateTime<Utc>>,
    pub embedding: Option<Vec<f32>>,
}

impl Fact {
    pub fn is_active(&self) -> bool {
        self.end_time.is_none()
    }
}

/// Input to `FactStore::upsert` — a fact before it has identity in the store.
#[derive(Debug, Clone)]
pub struct NewFact {
    pub key: String,
    pub value: String,
    pub source: String,
    pub start_time: DateTime<Utc>,
}

/// What an upsert did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First value ever seen for this key.
    Inserted { id: i64 },
    /// Active row closed at the new start_time, new row inserted.
    Superseded { id: i64, previous_id: i64 },
    /// Active row already carries this exact value — nothing written.
    Skip,
}

/// Predicates applied to search results after scoring.
#[derive(Debug, Clone, Default)]
pub struct VerdictFilters {
    /// Exclude `inferred.*` keys.
    pub source_verified: bool,
    /// Require `key.contains(subject)`.
    pub subject: Option<String>,
    /// Require `now − start_time ≤ n` days.
    pub max_age_days: Option<i64>,
    /// Type tag resolved through the configured `type_mappings`.
    pub type_tag: Option<String>,
}

/// A retrieval request. The populated field decides the strategy:
/// keys > prefix > semantic (hybrid) > text (BM25 only) > recency.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub prefix: Option<String>,
    pub keys: Vec<String>,
    pub text: Option<String>,
    /// Embedded query vector; when present the query runs hybrid fusion
    /// using `text` for the BM25 leg.
    pub vector: Option<Vec<f32>>,
    pub limit: usize,
    pub filters: VerdictFilters,
}

impl SearchQuery {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }
}

/// One scored search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub key: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    pub start_time: DateTime<Utc>,
}
