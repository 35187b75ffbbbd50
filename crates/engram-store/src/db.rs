use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Result};

/// Initialise the fact store tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_facts_table(conn)?;
    create_fts_index(conn)?;
    create_meta_table(conn)?;
    Ok(())
}

/// The fact history. One row per (key, start_time); `end_time IS NULL` marks
/// the active row. Embeddings are little-endian f32 blobs, lazily populated.
fn create_facts_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS facts (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            key         TEXT NOT NULL,
            value       TEXT NOT NULL,
            source      TEXT NOT NULL DEFAULT '',
            start_time  TEXT NOT NULL,
            end_time    TEXT,
            embedding   BLOB,
            UNIQUE(key, start_time)
        );
        CREATE INDEX IF NOT EXISTS idx_facts_key
            ON facts(key, start_time DESC);
        CREATE INDEX IF NOT EXISTS idx_facts_active
            ON facts(key) WHERE end_time IS NULL;",
    )
}

/// FTS5 virtual table over the ACTIVE fact set only.
/// content='' makes it an external-content table — we sync manually on write,
/// so superseded rows drop out of the index the moment they are closed.
fn create_fts_index(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS facts_fts
            USING fts5(key, value, content='facts', content_rowid='id');",
    )
}

/// Single-row settings (currently just the embedding dimension, written once
/// on first embed and enforced thereafter).
fn create_meta_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta (
            key    TEXT PRIMARY KEY,
            value  TEXT NOT NULL
        );",
    )
}

/// Canonical on-disk timestamp format: RFC 3339 UTC with fixed microsecond
/// width, so lexicographic order equals temporal order.
pub fn ts_to_db(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn ts_from_db(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
