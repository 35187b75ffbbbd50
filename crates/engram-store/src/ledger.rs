//! Processed-source ledger.
//!
//! Append-only idempotency record: one `<source-id>|<mtime>` line per
//! processed transcript. Adapter-specific prefixes (e.g. `gemini:`) keep ids
//! from colliding across hosts. The ledger is never queried for content —
//! only membership.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::Result;

pub struct ProcessedLedger {
    path: PathBuf,
    seen: HashMap<String, i64>,
}

impl ProcessedLedger {
    /// Load the ledger from disk, creating parent directories. Malformed
    /// lines are skipped with a warning — an interrupted append must not
    /// wedge every future run.
    pub fn load(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut seen = HashMap::new();
        if path.exists() {
            for line in std::fs::read_to_string(path)?.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match line.rsplit_once('|') {
                    Some((id, mtime)) => match mtime.parse::<i64>() {
                        Ok(t) => {
                            // Last entry wins: a reprocessed source appends a
                            // fresh line with its new mtime.
                            seen.insert(id.to_string(), t);
                        }
                        Err(_) => warn!(line, "ledger line has bad mtime; skipping"),
                    },
                    None => warn!(line, "malformed ledger line; skipping"),
                }
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            seen,
        })
    }

    /// True when `source_id` was already processed at exactly this mtime.
    /// A changed mtime means the source must be reprocessed.
    pub fn is_processed(&self, source_id: &str, mtime: i64) -> bool {
        self.seen.get(source_id) == Some(&mtime)
    }

    /// Record a processed source. Appends to disk immediately.
    pub fn mark(&mut self, source_id: &str, mtime: i64) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{source_id}|{mtime}")?;
        self.seen.insert(source_id.to_string(), mtime);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
