use std::path::Path;
use std::sync::Mutex;

use chrono::{Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::db::{init_db, ts_from_db, ts_to_db};
use crate::embedding;
use crate::error::{Result, StoreError};
use crate::types::{Fact, NewFact, UpsertOutcome};

/// Durable, temporally-versioned fact store.
///
/// Thread-safe: wraps the SQLite connection in a Mutex — one writer per
/// handle; cross-process writers serialize at the database. Every mutation
/// that touches a row and its index entries runs in a single transaction, so
/// a crash can never leave the FTS or vector side out of step with history
/// beyond what `recover` repairs.
pub struct FactStore {
    pub(crate) conn: Mutex<Connection>,
}

impl FactStore {
    /// Open (creating if needed) the store at `path` and run crash recovery.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        init_db(&conn)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        let repaired = store.recover()?;
        if repaired > 0 {
            info!(repaired, "fact store recovered from unclean shutdown");
        }
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a fact, superseding the key's active value if it differs.
    ///
    /// Atomic over all three mutations: close of the predecessor, insert of
    /// the new row, and the FTS sync. Returns `Skip` when the active value is
    /// already identical.
    pub fn upsert(&self, fact: &NewFact) -> Result<UpsertOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let active: Option<(i64, String, String)> = tx
            .query_row(
                "SELECT id, value, start_time FROM facts
                 WHERE key = ?1 AND end_time IS NULL",
                [&fact.key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let outcome = match active {
            Some((_, ref value, _)) if *value == fact.value => {
                debug!(key = %fact.key, "upsert skipped: active value unchanged");
                UpsertOutcome::Skip
            }
            Some((prev_id, prev_value, prev_start)) => {
                // Per-key start_times must stay strictly increasing; an
                // out-of-order source gets nudged just past the active row.
                let prev_start_dt = ts_from_db(&prev_start).ok_or_else(|| {
                    StoreError::Corrupt(format!("bad start_time on row {prev_id}"))
                })?;
                let start = if fact.start_time > prev_start_dt {
                    fact.start_time
                } else {
                    prev_start_dt + Duration::microseconds(1)
                };
                let start_s = ts_to_db(start);

                tx.execute(
                    "UPDATE facts SET end_time = ?1, embedding = NULL WHERE id = ?2",
                    rusqlite::params![start_s, prev_id],
                )?;
                tx.execute(
                    "INSERT INTO facts_fts(facts_fts, rowid, key, value)
                     VALUES('delete', ?1, ?2, ?3)",
                    rusqlite::params![prev_id, fact.key, prev_value],
                )?;

                tx.execute(
                    "INSERT INTO facts (key, value, source, start_time) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![fact.key, fact.value, fact.source, start_s],
                )?;
                let id = tx.last_insert_rowid();
                tx.execute(
                    "INSERT INTO facts_fts(rowid, key, value) VALUES(?1, ?2, ?3)",
                    rusqlite::params![id, fact.key, fact.value],
                )?;
                UpsertOutcome::Superseded {
                    id,
                    previous_id: prev_id,
                }
            }
            None => {
                let start_s = ts_to_db(fact.start_time);
                tx.execute(
                    "INSERT INTO facts (key, value, source, start_time) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![fact.key, fact.value, fact.source, start_s],
                )?;
                let id = tx.last_insert_rowid();
                tx.execute(
                    "INSERT INTO facts_fts(rowid, key, value) VALUES(?1, ?2, ?3)",
                    rusqlite::params![id, fact.key, fact.value],
                )?;
                UpsertOutcome::Inserted { id }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// Same as `upsert`, but the fact lands under `target_key` — the write
    /// path for a deduper `merge` decision.
    pub fn apply_merge(&self, target_key: &str, fact: &NewFact) -> Result<UpsertOutcome> {
        let merged = NewFact {
            key: target_key.to_string(),
            value: fact.value.clone(),
            source: fact.source.clone(),
            start_time: fact.start_time,
        };
        self.upsert(&merged)
    }

    /// The active row for a key, if any.
    pub fn active(&self, key: &str) -> Result<Option<Fact>> {
        let conn = self.conn.lock().unwrap();
        let fact = conn
            .query_row(
                &format!("{SELECT_FACT} WHERE key = ?1 AND end_time IS NULL"),
                [key],
                row_to_fact,
            )
            .optional()?;
        Ok(fact)
    }

    /// All active rows whose key starts with `prefix`, key order.
    pub fn active_prefix(&self, prefix: &str) -> Result<Vec<Fact>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{SELECT_FACT} WHERE key LIKE ?1 || '%' AND end_time IS NULL ORDER BY key"
        ))?;
        let rows = stmt.query_map([prefix], row_to_fact)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// The entire active set, key order. Aggregation reads this.
    pub fn active_all(&self) -> Result<Vec<Fact>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare(&format!("{SELECT_FACT} WHERE end_time IS NULL ORDER BY key"))?;
        let rows = stmt.query_map([], row_to_fact)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Full history for a key, oldest first.
    pub fn history(&self, key: &str) -> Result<Vec<Fact>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{SELECT_FACT} WHERE key = ?1 ORDER BY start_time"
        ))?;
        let rows = stmt.query_map([key], row_to_fact)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Most recently started active rows — the no-query search result.
    pub fn recent_active(&self, limit: usize) -> Result<Vec<Fact>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{SELECT_FACT} WHERE end_time IS NULL ORDER BY start_time DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map([limit], row_to_fact)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn count_active(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM facts WHERE end_time IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Active rows that still lack an embedding (the lazy-embed backlog).
    pub fn active_missing_embedding(&self, limit: usize) -> Result<Vec<Fact>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{SELECT_FACT} WHERE end_time IS NULL AND embedding IS NULL
             ORDER BY start_time LIMIT ?1"
        ))?;
        let rows = stmt.query_map([limit], row_to_fact)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Active rows that have an embedding — the vector scan population.
    pub fn active_with_embedding(&self) -> Result<Vec<Fact>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{SELECT_FACT} WHERE end_time IS NULL AND embedding IS NOT NULL"
        ))?;
        let rows = stmt.query_map([], row_to_fact)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Attach an embedding to a row. Only permitted while the row is active;
    /// the first write fixes the store's dimension and later writes must match.
    pub fn set_embedding(&self, id: i64, vector: &[f32]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        self.check_dimension(&conn, vector.len())?;

        let end_time: Option<String> = conn
            .query_row("SELECT end_time FROM facts WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?
            .ok_or_else(|| StoreError::Corrupt(format!("no row with id {id}")))?;
        if end_time.is_some() {
            return Err(StoreError::InactiveRow { id });
        }

        conn.execute(
            "UPDATE facts SET embedding = ?1 WHERE id = ?2",
            rusqlite::params![embedding::encode(vector), id],
        )?;
        Ok(())
    }

    /// The dimension recorded in `meta`, if any embedding has been stored yet.
    pub fn embedding_dimension(&self) -> Result<Option<usize>> {
        let conn = self.conn.lock().unwrap();
        read_dimension(&conn)
    }

    /// Close the active row for `key` now ("delete" = end the interval;
    /// history is never removed).
    pub fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let active: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, value FROM facts WHERE key = ?1 AND end_time IS NULL",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((id, value)) = active else {
            return Err(StoreError::NotFound {
                key: key.to_string(),
            });
        };

        tx.execute(
            "UPDATE facts SET end_time = ?1, embedding = NULL WHERE id = ?2",
            rusqlite::params![ts_to_db(Utc::now()), id],
        )?;
        tx.execute(
            "INSERT INTO facts_fts(facts_fts, rowid, key, value)
             VALUES('delete', ?1, ?2, ?3)",
            rusqlite::params![id, key, value],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Crash recovery: for every key with more than one open row, keep the
    /// latest `start_time` active and close the rest at the winner's start.
    /// When anything was repaired the FTS index is rebuilt from the active
    /// set so both indexes match history again.
    ///
    /// Returns the number of rows closed.
    pub fn recover(&self) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut closed = 0usize;

        {
            let mut stmt = tx.prepare(
                "SELECT key, MAX(start_time) FROM facts
                 WHERE end_time IS NULL GROUP BY key HAVING COUNT(*) > 1",
            )?;
            let broken: Vec<(String, String)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect();

            for (key, winner_start) in broken {
                warn!(key = %key, "repairing multiple active rows");
                closed += tx.execute(
                    "UPDATE facts SET end_time = ?1, embedding = NULL
                     WHERE key = ?2 AND end_time IS NULL AND start_time < ?1",
                    rusqlite::params![winner_start, key],
                )?;
            }
        }

        if closed > 0 {
            rebuild_fts(&tx)?;
        }
        tx.commit()?;
        Ok(closed)
    }

    /// Rebuild the FTS index offline from the active set.
    pub fn reindex_fts(&self) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let n = rebuild_fts(&tx)?;
        tx.commit()?;
        Ok(n)
    }

    fn check_dimension(&self, conn: &Connection, got: usize) -> Result<()> {
        match read_dimension(conn)? {
            Some(expected) if expected != got => {
                Err(StoreError::DimensionMismatch { expected, got })
            }
            Some(_) => Ok(()),
            None => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('embedding_dimension', ?1)",
                    [got.to_string()],
                )?;
                debug!(dimension = got, "embedding dimension recorded");
                Ok(())
            }
        }
    }
}

fn read_dimension(conn: &Connection) -> Result<Option<usize>> {
    let v: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'embedding_dimension'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match v {
        None => Ok(None),
        Some(s) => s
            .parse::<usize>()
            .map(Some)
            .map_err(|_| StoreError::Corrupt(format!("bad embedding_dimension: {s}"))),
    }
}

fn rebuild_fts(conn: &Connection) -> rusqlite::Result<usize> {
    conn.execute("INSERT INTO facts_fts(facts_fts) VALUES('delete-all')", [])?;
    conn.execute(
        "INSERT INTO facts_fts(rowid, key, value)
         SELECT id, key, value FROM facts WHERE end_time IS NULL",
        [],
    )
}

const SELECT_FACT: &str =
    "SELECT id, key, value, source, start_time, end_time, embedding FROM facts";

pub(crate) fn row_to_fact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Fact> {
    let start: String = row.get(4)?;
    let end: Option<String> = row.get(5)?;
    let blob: Option<Vec<u8>> = row.get(6)?;
    Ok(Fact {
        id: row.get(0)?,
        key: row.get(1)?,
        value: row.get(2)?,
        source: row.get(3)?,
        start_time: ts_from_db(&start).unwrap_or_default(),
        end_time: end.as_deref().and_then(ts_from_db),
        embedding: blob.as_deref().and_then(crate::embedding::decode),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fact(key: &str, value: &str, secs: i64) -> NewFact {
        NewFact {
            key: key.to_string(),
            value: value.to_string(),
            source: "test".to_string(),
            start_time: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[test]
    fn insert_then_supersede_builds_history() {
        let store = FactStore::open_in_memory().unwrap();
        let a = store.upsert(&fact("user.city", "Taipei", 1000)).unwrap();
        assert!(matches!(a, UpsertOutcome::Inserted { .. }));

        let b = store.upsert(&fact("user.city", "Hsinchu", 2000)).unwrap();
        assert!(matches!(b, UpsertOutcome::Superseded { .. }));

        let history = store.history("user.city").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].value, "Taipei");
        assert_eq!(
            history[0].end_time.unwrap(),
            history[1].start_time,
            "predecessor must close exactly at the successor's start"
        );
        assert!(history[1].is_active());

        let active = store.active("user.city").unwrap().unwrap();
        assert_eq!(active.value, "Hsinchu");
    }

    #[test]
    fn identical_value_is_skipped() {
        let store = FactStore::open_in_memory().unwrap();
        store.upsert(&fact("user.name", "Ada", 1000)).unwrap();
        let out = store.upsert(&fact("user.name", "Ada", 5000)).unwrap();
        assert_eq!(out, UpsertOutcome::Skip);
        assert_eq!(store.history("user.name").unwrap().len(), 1);
    }

    #[test]
    fn out_of_order_start_is_nudged_forward() {
        let store = FactStore::open_in_memory().unwrap();
        store.upsert(&fact("user.city", "Taipei", 2000)).unwrap();
        store.upsert(&fact("user.city", "Hsinchu", 1000)).unwrap();

        let history = store.history("user.city").unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].start_time < history[1].start_time);
        assert_eq!(history[0].end_time.unwrap(), history[1].start_time);
    }

    #[test]
    fn at_most_one_active_row_per_key() {
        let store = FactStore::open_in_memory().unwrap();
        for (i, v) in ["a", "b", "c", "d"].iter().enumerate() {
            store
                .upsert(&fact("config.path", v, 1000 + i as i64))
                .unwrap();
        }
        let actives: Vec<_> = store
            .history("config.path")
            .unwrap()
            .into_iter()
            .filter(|f| f.is_active())
            .collect();
        assert_eq!(actives.len(), 1);
        assert_eq!(actives[0].value, "d");
    }

    #[test]
    fn delete_closes_but_keeps_history() {
        let store = FactStore::open_in_memory().unwrap();
        store.upsert(&fact("user.name", "Ada", 1000)).unwrap();
        store.delete("user.name").unwrap();

        assert!(store.active("user.name").unwrap().is_none());
        assert_eq!(store.history("user.name").unwrap().len(), 1);
        assert!(matches!(
            store.delete("user.name"),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn embedding_dimension_is_fixed_by_first_write() {
        let store = FactStore::open_in_memory().unwrap();
        let UpsertOutcome::Inserted { id } =
            store.upsert(&fact("user.name", "Ada", 1000)).unwrap()
        else {
            panic!("expected insert");
        };
        store.set_embedding(id, &[0.1, 0.2, 0.3]).unwrap();
        assert_eq!(store.embedding_dimension().unwrap(), Some(3));

        let UpsertOutcome::Inserted { id: id2 } =
            store.upsert(&fact("user.mail", "a@b.c", 1000)).unwrap()
        else {
            panic!("expected insert");
        };
        assert!(matches!(
            store.set_embedding(id2, &[0.1, 0.2]),
            Err(StoreError::DimensionMismatch {
                expected: 3,
                got: 2
            })
        ));
    }

    #[test]
    fn set_embedding_rejects_superseded_rows() {
        let store = FactStore::open_in_memory().unwrap();
        let UpsertOutcome::Inserted { id } =
            store.upsert(&fact("user.city", "Taipei", 1000)).unwrap()
        else {
            panic!("expected insert");
        };
        store.upsert(&fact("user.city", "Hsinchu", 2000)).unwrap();
        assert!(matches!(
            store.set_embedding(id, &[0.1]),
            Err(StoreError::InactiveRow { .. })
        ));
    }

    #[test]
    fn supersession_drops_old_embedding() {
        let store = FactStore::open_in_memory().unwrap();
        let UpsertOutcome::Inserted { id } =
            store.upsert(&fact("user.city", "Taipei", 1000)).unwrap()
        else {
            panic!("expected insert");
        };
        store.set_embedding(id, &[1.0, 0.0]).unwrap();
        store.upsert(&fact("user.city", "Hsinchu", 2000)).unwrap();

        let history = store.history("user.city").unwrap();
        assert!(history[0].embedding.is_none());
        let embedded = store.active_with_embedding().unwrap();
        assert!(embedded.is_empty(), "new row has no embedding yet");
    }

    #[test]
    fn recover_repairs_double_active_keys() {
        let store = FactStore::open_in_memory().unwrap();
        store.upsert(&fact("config.db_path", "/tmp/a", 1000)).unwrap();
        // Simulate a crash that left a second open row behind.
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO facts (key, value, source, start_time)
                 VALUES ('config.db_path', '/tmp/b', 'test', ?1)",
                [crate::db::ts_to_db(Utc.timestamp_opt(2000, 0).unwrap())],
            )
            .unwrap();
        }

        let closed = store.recover().unwrap();
        assert_eq!(closed, 1);

        let active = store.active("config.db_path").unwrap().unwrap();
        assert_eq!(active.value, "/tmp/b");
        let history = store.history("config.db_path").unwrap();
        assert_eq!(history[0].end_time.unwrap(), history[1].start_time);
    }

    #[test]
    fn active_prefix_and_recent() {
        let store = FactStore::open_in_memory().unwrap();
        store.upsert(&fact("user.name", "Ada", 1000)).unwrap();
        store.upsert(&fact("user.city", "Taipei", 2000)).unwrap();
        store.upsert(&fact("project.lang", "rust", 3000)).unwrap();

        let users = store.active_prefix("user.").unwrap();
        assert_eq!(users.len(), 2);

        let recent = store.recent_active(2).unwrap();
        assert_eq!(recent[0].key, "project.lang");
        assert_eq!(store.count_active().unwrap(), 3);
    }
}
