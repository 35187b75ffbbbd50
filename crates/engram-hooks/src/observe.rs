//! Append-only tool-use observation log.
//!
//! Every observed tool call becomes one normalized `ToolEvent` line in a
//! JSONL file that rolls to `<name>.1` once it exceeds 10 MiB. The learning
//! extractor reads this log back as its tool-event source.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::warn;

use engram_core::config::OBSERVATION_ROLL_BYTES;
use engram_core::transcript::ToolEvent;

use crate::error::Result;
use crate::events::ToolUseEvent;

pub struct ObservationLog {
    path: PathBuf,
}

impl ObservationLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Normalize and append one observation.
    pub fn append(&self, event: &ToolUseEvent) -> Result<()> {
        self.roll_if_needed()?;

        let output = value_text(&event.tool_output, 2_000);
        let record = ToolEvent {
            session_id: event.session_id.clone().unwrap_or_else(|| "unknown".to_string()),
            tool_name: event.tool_name.clone(),
            action: value_text(&event.tool_input, 500),
            is_error: looks_like_error(&output),
            output,
            timestamp: Utc::now(),
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(&record)?)?;
        Ok(())
    }

    /// Read all events currently in the log (rolled generations excluded).
    pub fn read_events(&self) -> Result<Vec<ToolEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        Ok(raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match serde_json::from_str(l) {
                Ok(ev) => Some(ev),
                Err(e) => {
                    warn!(err = %e, "skipping unreadable observation line");
                    None
                }
            })
            .collect())
    }

    fn roll_if_needed(&self) -> Result<()> {
        let Ok(meta) = std::fs::metadata(&self.path) else {
            return Ok(());
        };
        if meta.len() >= OBSERVATION_ROLL_BYTES {
            let rolled = self.path.with_extension("jsonl.1");
            std::fs::rename(&self.path, rolled)?;
        }
        Ok(())
    }
}

/// Flatten a hook payload value to text, truncated to `cap` characters.
fn value_text(value: &serde_json::Value, cap: usize) -> String {
    let text = match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    };
    if text.chars().count() > cap {
        let truncated: String = text.chars().take(cap).collect();
        format!("{truncated}…")
    } else {
        text
    }
}

/// Cheap error sniff over a tool result payload.
pub fn looks_like_error(output: &str) -> bool {
    let lower = output.to_lowercase();
    ["error", "exit code 1", "exit code 2", "failed", "traceback", "panicked", "denied"]
        .iter()
        .any(|m| lower.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(tool: &str, output: &str) -> ToolUseEvent {
        serde_json::from_value(json!({
            "tool_name": tool,
            "tool_input": {"command": "cargo test"},
            "tool_output": output,
            "session_id": "s1",
        }))
        .unwrap()
    }

    #[test]
    fn append_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let log = ObservationLog::new(dir.path().join("observations.jsonl"));
        log.append(&event("Bash", "Exit code 1: test failed")).unwrap();
        log.append(&event("Read", "fn main() {}")).unwrap();

        let events = log.read_events().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].is_error);
        assert!(!events[1].is_error);
        assert_eq!(events[0].session_id, "s1");
    }

    #[test]
    fn long_output_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let log = ObservationLog::new(dir.path().join("obs.jsonl"));
        log.append(&event("Bash", &"y".repeat(10_000))).unwrap();
        let events = log.read_events().unwrap();
        assert!(events[0].output.chars().count() <= 2_001);
    }

    #[test]
    fn error_sniffing() {
        assert!(looks_like_error("Error: file not found"));
        assert!(looks_like_error("process exit code 1"));
        assert!(looks_like_error("thread 'main' panicked at src/main.rs"));
        assert!(!looks_like_error("all 12 tests passed"));
    }
}
