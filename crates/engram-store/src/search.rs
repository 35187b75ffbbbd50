//! Hybrid retrieval: BM25 + cosine fusion with verdict filters.
//!
//! The vector leg is a brute cosine scan over active embedded rows; the text
//! leg is an FTS5 MATCH with every token quoted so user input can never smuggle
//! in FTS operators. Scores are fused with configured weights, plus a bonus
//! when both legs agree on a row.

use chrono::Utc;
use tracing::{debug, warn};

use engram_core::config::EngramConfig;

use crate::embedding::cosine;
use crate::error::Result;
use crate::store::{row_to_fact, FactStore};
use crate::types::{Fact, SearchHit, SearchQuery, VerdictFilters};

const DEFAULT_LIMIT: usize = 10;

impl FactStore {
    /// Run a search. The populated query field picks the strategy:
    /// explicit keys > key prefix > hybrid (vector present) > BM25 text >
    /// most-recent actives.
    pub fn search(&self, q: &SearchQuery, config: &EngramConfig) -> Result<Vec<SearchHit>> {
        let limit = if q.limit == 0 { DEFAULT_LIMIT } else { q.limit };

        if !q.keys.is_empty() {
            let mut hits = Vec::new();
            for key in &q.keys {
                if let Some(f) = self.active(key)? {
                    hits.push(f);
                }
            }
            return Ok(finish(hits, &q.filters, config, limit));
        }

        if let Some(prefix) = &q.prefix {
            return Ok(finish(self.active_prefix(prefix)?, &q.filters, config, limit));
        }

        if let Some(vector) = &q.vector {
            return self.hybrid(vector, q.text.as_deref(), &q.filters, config, limit);
        }

        if let Some(text) = &q.text {
            let scored = self.bm25(text, limit * 2)?;
            let mut hits: Vec<SearchHit> = scored
                .into_iter()
                .filter(|(f, _)| passes(f, &q.filters, config))
                .map(|(f, s)| to_hit(f, Some(s)))
                .collect();
            hits.truncate(limit);
            return Ok(hits);
        }

        // No query at all: newest active facts.
        Ok(finish(self.recent_active(limit * 2)?, &q.filters, config, limit))
    }

    /// Active rows whose embedding has cosine similarity ≥ `threshold` with
    /// `vector`, best first, at most `max`. The deduper's candidate query.
    pub fn similar_active(
        &self,
        vector: &[f32],
        threshold: f32,
        max: usize,
    ) -> Result<Vec<(Fact, f32)>> {
        let mut scored: Vec<(Fact, f32)> = self
            .active_with_embedding()?
            .into_iter()
            .filter_map(|f| {
                let sim = cosine(f.embedding.as_deref()?, vector);
                (sim >= threshold).then_some((f, sim))
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(max);
        Ok(scored)
    }

    fn hybrid(
        &self,
        vector: &[f32],
        text: Option<&str>,
        filters: &VerdictFilters,
        config: &EngramConfig,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let s = &config.search;

        let vector_hits = self.similar_active(vector, s.vector_threshold, limit * 2)?;
        let bm25_hits = match text {
            Some(t) if !t.trim().is_empty() => self.bm25(t, limit * 2)?,
            _ => Vec::new(),
        };
        debug!(
            vector_hits = vector_hits.len(),
            bm25_hits = bm25_hits.len(),
            "hybrid search legs"
        );

        // Merge by row id. Combined = vw·vs + bw·bs, plus a bonus scaled by
        // the vector score when both legs returned the row.
        let mut merged: Vec<(Fact, f32, Option<f32>)> = vector_hits
            .into_iter()
            .map(|(f, vs)| (f, vs, None))
            .collect();
        for (f, bs) in bm25_hits {
            if let Some(entry) = merged.iter_mut().find(|(m, _, _)| m.id == f.id) {
                entry.2 = Some(bs);
            } else {
                merged.push((f, 0.0, Some(bs)));
            }
        }

        let mut hits: Vec<SearchHit> = merged
            .into_iter()
            .filter(|(f, _, _)| passes(f, filters, config))
            .map(|(f, vs, bs)| {
                let mut score = s.vector_weight * vs + s.bm25_weight * bs.unwrap_or(0.0);
                if bs.is_some() && vs >= s.vector_threshold {
                    score += s.bm25_bonus * vs;
                }
                (f, score)
            })
            .map(|(f, score)| to_hit(f, Some(score)))
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .unwrap_or(0.0)
                .total_cmp(&a.score.unwrap_or(0.0))
                .then(b.start_time.cmp(&a.start_time))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    /// FTS MATCH over active rows, scores min-max normalized to [0, 1]
    /// within the result set (best = 1).
    fn bm25(&self, query: &str, limit: usize) -> Result<Vec<(Fact, f32)>> {
        let match_expr = quote_tokens(query);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT f.id, f.key, f.value, f.source, f.start_time, f.end_time, f.embedding,
                    bm25(facts_fts) AS rank
             FROM facts_fts
             JOIN facts f ON f.id = facts_fts.rowid
             WHERE facts_fts MATCH ?1 AND f.end_time IS NULL
             ORDER BY rank
             LIMIT ?2",
        )?;
        let rows: Vec<(Fact, f64)> = stmt
            .query_map(rusqlite::params![match_expr, limit], |row| {
                Ok((row_to_fact(row)?, row.get::<_, f64>(7)?))
            })?
            .filter_map(|r| r.ok())
            .collect();

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        // bm25() returns more-negative-is-better ranks.
        let best = rows.iter().map(|(_, r)| *r).fold(f64::INFINITY, f64::min);
        let worst = rows.iter().map(|(_, r)| *r).fold(f64::NEG_INFINITY, f64::max);
        let span = worst - best;
        Ok(rows
            .into_iter()
            .map(|(f, r)| {
                let norm = if span <= f64::EPSILON {
                    1.0
                } else {
                    (worst - r) / span
                };
                (f, norm as f32)
            })
            .collect())
    }
}

/// Quote each whitespace token so FTS operator characters (`-`, `*`, `:`,
/// `OR`, …) are matched literally, then OR-join for recall.
fn quote_tokens(query: &str) -> String {
    query
        .split_whitespace()
        .map(|t| format!("\"{}\"", t.replace('"', "")))
        .filter(|t| t.len() > 2)
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn passes(fact: &Fact, filters: &VerdictFilters, config: &EngramConfig) -> bool {
    if filters.source_verified && fact.key.starts_with("inferred.") {
        return false;
    }
    if let Some(subject) = &filters.subject {
        if !fact.key.contains(subject.as_str()) {
            return false;
        }
    }
    if let Some(days) = filters.max_age_days {
        let age = Utc::now().signed_duration_since(fact.start_time).num_days();
        if age > days {
            return false;
        }
    }
    if let Some(tag) = &filters.type_tag {
        if tag != "all" {
            match config.type_mappings.get(tag) {
                Some(prefixes) => {
                    if !prefixes.iter().any(|p| fact.key.starts_with(p.as_str())) {
                        return false;
                    }
                }
                None => {
                    warn!(tag = %tag, "unknown type tag; matching nothing");
                    return false;
                }
            }
        }
    }
    true
}

fn finish(
    facts: Vec<Fact>,
    filters: &VerdictFilters,
    config: &EngramConfig,
    limit: usize,
) -> Vec<SearchHit> {
    facts
        .into_iter()
        .filter(|f| passes(f, filters, config))
        .take(limit)
        .map(|f| to_hit(f, None))
        .collect()
}

fn to_hit(f: Fact, score: Option<f32>) -> SearchHit {
    SearchHit {
        key: f.key,
        value: f.value,
        score,
        start_time: f.start_time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NewFact, UpsertOutcome};
    use chrono::TimeZone;

    fn store_with(rows: &[(&str, &str)]) -> FactStore {
        let store = FactStore::open_in_memory().unwrap();
        for (i, (k, v)) in rows.iter().enumerate() {
            store
                .upsert(&NewFact {
                    key: k.to_string(),
                    value: v.to_string(),
                    source: "test".to_string(),
                    start_time: Utc.timestamp_opt(1000 + i as i64, 0).unwrap(),
                })
                .unwrap();
        }
        store
    }

    fn embed(store: &FactStore, key: &str, v: &[f32]) {
        let f = store.active(key).unwrap().unwrap();
        store.set_embedding(f.id, v).unwrap();
    }

    #[test]
    fn quote_tokens_neutralizes_operators() {
        assert_eq!(quote_tokens("code editor"), "\"code\" OR \"editor\"");
        assert_eq!(quote_tokens("GOG_KEYRING_PASSWORD"), "\"GOG_KEYRING_PASSWORD\"");
        // quotes inside tokens are stripped, not doubled
        assert_eq!(quote_tokens("a\"bc"), "\"abc\"");
        assert_eq!(quote_tokens(""), "");
    }

    #[test]
    fn exact_text_match_ranks_first() {
        let store = store_with(&[
            ("user.editor.primary", "vscode"),
            ("secret.gog", "GOG_KEYRING_PASSWORD redacted"),
        ]);
        let config = EngramConfig::default();
        let q = SearchQuery {
            text: Some("GOG_KEYRING_PASSWORD".to_string()),
            limit: 5,
            ..Default::default()
        };
        let hits = store.search(&q, &config).unwrap();
        assert_eq!(hits[0].key, "secret.gog");
        assert!((hits[0].score.unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn hybrid_prefers_vector_hit_without_text_overlap() {
        let store = store_with(&[
            ("user.editor.primary", "vscode"),
            ("user.city", "Taipei"),
        ]);
        embed(&store, "user.editor.primary", &[1.0, 0.0, 0.0]);
        embed(&store, "user.city", &[0.0, 1.0, 0.0]);

        let config = EngramConfig::default();
        let q = SearchQuery {
            text: Some("code editor".to_string()),
            vector: Some(vec![0.95, 0.05, 0.0]),
            limit: 5,
            ..Default::default()
        };
        let hits = store.search(&q, &config).unwrap();
        assert_eq!(hits[0].key, "user.editor.primary");
        // user.city is below the 0.3 vector threshold and has no BM25 hit
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn both_leg_bonus_beats_single_leg() {
        let store = store_with(&[
            ("tool.editor", "the editor is vscode"),
            ("tool.shell", "zsh"),
        ]);
        embed(&store, "tool.editor", &[1.0, 0.0]);
        embed(&store, "tool.shell", &[0.9, 0.1]);

        let config = EngramConfig::default();
        let q = SearchQuery {
            text: Some("editor".to_string()),
            vector: Some(vec![1.0, 0.0]),
            limit: 5,
            ..Default::default()
        };
        let hits = store.search(&q, &config).unwrap();
        assert_eq!(hits[0].key, "tool.editor");
        assert!(hits[0].score.unwrap() > hits[1].score.unwrap());
    }

    #[test]
    fn no_query_returns_most_recent() {
        let store = store_with(&[("user.a", "1"), ("user.b", "2"), ("user.c", "3")]);
        let config = EngramConfig::default();
        let hits = store
            .search(&SearchQuery::with_limit(2), &config)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].key, "user.c");
    }

    #[test]
    fn verdict_filters_apply() {
        let store = store_with(&[
            ("inferred.mood", "happy"),
            ("user.name", "Ada"),
            ("agent.instinct.error.x", "{}"),
        ]);
        let config = EngramConfig::default();

        let q = SearchQuery {
            filters: VerdictFilters {
                source_verified: true,
                ..Default::default()
            },
            limit: 10,
            ..Default::default()
        };
        let hits = store.search(&q, &config).unwrap();
        assert!(hits.iter().all(|h| !h.key.starts_with("inferred.")));

        let q = SearchQuery {
            filters: VerdictFilters {
                type_tag: Some("agent".to_string()),
                ..Default::default()
            },
            limit: 10,
            ..Default::default()
        };
        let hits = store.search(&q, &config).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "agent.instinct.error.x");

        let q = SearchQuery {
            filters: VerdictFilters {
                subject: Some("name".to_string()),
                ..Default::default()
            },
            limit: 10,
            ..Default::default()
        };
        let hits = store.search(&q, &config).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "user.name");
    }

    #[test]
    fn keys_strategy_fetches_exact_actives() {
        let store = store_with(&[("user.name", "Ada"), ("user.city", "Taipei")]);
        let config = EngramConfig::default();
        let q = SearchQuery {
            keys: vec!["user.city".to_string(), "user.missing".to_string()],
            limit: 10,
            ..Default::default()
        };
        let hits = store.search(&q, &config).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "user.city");
    }
}
