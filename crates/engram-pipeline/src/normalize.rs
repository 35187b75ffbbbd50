//! Host transcript decoding.
//!
//! Two adapters:
//! - `normalize_jsonl` reads the normalized line schema most hosts emit
//!   (one `{"type":"message",…}` object per line, plus optional
//!   `{"type":"tool_use",…}` lines carrying tool activity);
//! - `convert_gemini_dir` rewrites Gemini CLI session exports into that
//!   schema so the rest of the pipeline never sees a second format.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use engram_core::transcript::{NormalizedMessage, NormalizedSession, Role, ToolEvent};

use crate::error::{PipelineError, Result};

/// One line of the normalized transcript schema.
#[derive(Deserialize)]
struct Line {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<LineMessage>,
    #[serde(default)]
    timestamp: Option<String>,
    // tool_use lines
    #[serde(default)]
    tool_name: Option<String>,
    #[serde(default)]
    tool_input: Option<Value>,
    #[serde(default)]
    tool_output: Option<Value>,
    #[serde(default)]
    is_error: Option<bool>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct LineMessage {
    role: String,
    content: Value,
}

/// Decode a normalized JSONL transcript.
///
/// Individual undecodable lines are skipped with a warning; a file where no
/// line decodes at all is `MalformedTranscript`.
pub fn normalize_jsonl(path: &Path) -> Result<NormalizedSession> {
    let source_id = file_stem(path);
    let raw = std::fs::read_to_string(path).map_err(|e| PipelineError::MalformedTranscript {
        source_id: source_id.clone(),
        reason: e.to_string(),
    })?;

    let mut messages = Vec::new();
    let mut tool_events = Vec::new();
    let mut total_lines = 0usize;
    let mut bad_lines = 0usize;

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        total_lines += 1;

        let parsed: Line = match serde_json::from_str(line) {
            Ok(l) => l,
            Err(e) => {
                bad_lines += 1;
                warn!(source = %source_id, err = %e, "skipping undecodable transcript line");
                continue;
            }
        };

        match parsed.kind.as_str() {
            "message" => {
                let Some(msg) = parsed.message else {
                    bad_lines += 1;
                    continue;
                };
                let Some(role) = parse_role(&msg.role) else {
                    // system / tool roles are dropped, not an error
                    continue;
                };
                let text = content_text(&msg.content);
                if text.is_empty() {
                    continue;
                }
                let Some(timestamp) = parsed.timestamp.as_deref().and_then(parse_ts) else {
                    bad_lines += 1;
                    warn!(source = %source_id, "message line has no usable timestamp");
                    continue;
                };
                messages.push(NormalizedMessage {
                    role,
                    text,
                    timestamp,
                });
            }
            "tool_use" => {
                let Some(tool_name) = parsed.tool_name else {
                    continue;
                };
                let timestamp = parsed
                    .timestamp
                    .as_deref()
                    .and_then(parse_ts)
                    .unwrap_or_else(Utc::now);
                tool_events.push(ToolEvent {
                    session_id: parsed.session_id.unwrap_or_else(|| source_id.clone()),
                    tool_name,
                    action: parsed
                        .tool_input
                        .map(|v| content_text(&v))
                        .unwrap_or_default(),
                    output: parsed
                        .tool_output
                        .map(|v| content_text(&v))
                        .unwrap_or_default(),
                    is_error: parsed.is_error.unwrap_or(false),
                    timestamp,
                });
            }
            // summaries, checkpoints, etc. — not memory material
            other => debug!(kind = other, "ignoring transcript line type"),
        }
    }

    if total_lines > 0 && bad_lines == total_lines {
        return Err(PipelineError::MalformedTranscript {
            source_id: source_id,
            reason: "no line decoded".to_string(),
        });
    }

    Ok(NormalizedSession {
        source_id,
        messages,
        tool_events,
    })
}

/// Gemini CLI session export: a single JSON document per session.
#[derive(Deserialize)]
struct GeminiSession {
    #[serde(rename = "sessionId", default)]
    session_id: Option<String>,
    #[serde(rename = "startTime", default)]
    start_time: Option<String>,
    messages: Vec<GeminiMessage>,
}

#[derive(Deserialize)]
struct GeminiMessage {
    role: String,
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    parts: Option<Vec<Value>>,
    #[serde(default)]
    timestamp: Option<String>,
}

/// Convert every `.json` session in `src_dir` into normalized JSONL files
/// under `dest_dir`. Returns the written paths in sorted order. Undecodable
/// sessions are skipped with a warning so one corrupt export cannot block
/// the rest.
pub fn convert_gemini_dir(src_dir: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dest_dir)?;
    let mut sources: Vec<PathBuf> = std::fs::read_dir(src_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    sources.sort();

    let mut written = Vec::new();
    for src in sources {
        match convert_gemini_file(&src, dest_dir) {
            Ok(path) => written.push(path),
            Err(e) => warn!(src = %src.display(), err = %e, "skipping gemini session"),
        }
    }
    Ok(written)
}

fn convert_gemini_file(src: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let raw = std::fs::read_to_string(src)?;
    let session: GeminiSession =
        serde_json::from_str(&raw).map_err(|e| PipelineError::MalformedTranscript {
            source_id: file_stem(src),
            reason: e.to_string(),
        })?;

    let fallback_ts = session
        .start_time
        .as_deref()
        .and_then(parse_ts)
        .unwrap_or_else(Utc::now);

    let stem = session.session_id.unwrap_or_else(|| file_stem(src));
    let dest = dest_dir.join(format!("{stem}.jsonl"));

    let mut out = String::new();
    for msg in session.messages {
        let role = match msg.role.as_str() {
            "user" => "user",
            // Gemini calls the assistant side "model"
            "model" | "assistant" => "assistant",
            _ => continue,
        };
        let text = match (&msg.content, &msg.parts) {
            (Some(content), _) => content_text(content),
            (None, Some(parts)) => parts
                .iter()
                .map(content_text)
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join("\n"),
            (None, None) => String::new(),
        };
        if text.is_empty() {
            continue;
        }
        let ts = msg.timestamp.as_deref().and_then(parse_ts).unwrap_or(fallback_ts);
        let line = serde_json::json!({
            "type": "message",
            "message": { "role": role, "content": text },
            "timestamp": ts.to_rfc3339(),
        });
        out.push_str(&line.to_string());
        out.push('\n');
    }

    std::fs::write(&dest, out)?;
    Ok(dest)
}

/// Extract plain text from a content value: strings pass through, arrays of
/// part objects keep their `text` fields, everything else (images, tool
/// blocks) is dropped.
fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.trim().to_string(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| match p {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Object(o) => o
                    .get("text")
                    .and_then(|t| t.as_str())
                    .map(|s| s.trim().to_string()),
                _ => None,
            })
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(o) => o
            .get("text")
            .and_then(|t| t.as_str())
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
        _ => String::new(),
    }
}

fn parse_role(role: &str) -> Option<Role> {
    match role {
        "user" => Some(Role::User),
        "assistant" => Some(Role::Assistant),
        _ => None,
    }
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session-1.jsonl");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn decodes_messages_in_order() {
        let (_dir, path) = write_temp(concat!(
            r#"{"type":"message","message":{"role":"user","content":"我住台北"},"timestamp":"2026-01-01T10:00:00Z"}"#,
            "\n",
            r#"{"type":"message","message":{"role":"assistant","content":"noted"},"timestamp":"2026-01-01T10:00:05Z"}"#,
            "\n",
        ));
        let session = normalize_jsonl(&path).unwrap();
        assert_eq!(session.source_id, "session-1");
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].role, Role::User);
        assert_eq!(session.messages[0].text, "我住台北");
    }

    #[test]
    fn drops_non_text_parts_and_unknown_roles() {
        let (_dir, path) = write_temp(concat!(
            r#"{"type":"message","message":{"role":"user","content":[{"type":"image","data":"…"},{"type":"text","text":"visible"}]},"timestamp":"2026-01-01T10:00:00Z"}"#,
            "\n",
            r#"{"type":"message","message":{"role":"system","content":"hidden"},"timestamp":"2026-01-01T10:00:01Z"}"#,
            "\n",
            r#"{"type":"summary","summary":"…"}"#,
            "\n",
        ));
        let session = normalize_jsonl(&path).unwrap();
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].text, "visible");
    }

    #[test]
    fn collects_tool_events() {
        let (_dir, path) = write_temp(concat!(
            r#"{"type":"tool_use","tool_name":"Bash","tool_input":"cargo test","tool_output":"Exit code 1: test failed","is_error":true,"timestamp":"2026-01-01T10:00:00Z"}"#,
            "\n",
        ));
        let session = normalize_jsonl(&path).unwrap();
        assert_eq!(session.tool_events.len(), 1);
        let ev = &session.tool_events[0];
        assert_eq!(ev.tool_name, "Bash");
        assert!(ev.is_error);
        assert_eq!(ev.session_id, "session-1");
    }

    #[test]
    fn fully_undecodable_file_is_malformed() {
        let (_dir, path) = write_temp("not json\nalso not json\n");
        assert!(matches!(
            normalize_jsonl(&path),
            Err(PipelineError::MalformedTranscript { .. })
        ));
    }

    #[test]
    fn empty_file_is_empty_session_not_error() {
        let (_dir, path) = write_temp("");
        let session = normalize_jsonl(&path).unwrap();
        assert!(session.is_empty());
    }

    #[test]
    fn gemini_conversion_produces_normalized_lines() {
        let src_dir = tempfile::tempdir().unwrap();
        let dest_dir = tempfile::tempdir().unwrap();
        std::fs::write(
            src_dir.path().join("conv.json"),
            r#"{
                "sessionId": "g-42",
                "startTime": "2026-02-01T08:00:00Z",
                "messages": [
                    {"role": "user", "content": "搬到新竹了"},
                    {"role": "model", "parts": [{"text": "got it"}]}
                ]
            }"#,
        )
        .unwrap();

        let written = convert_gemini_dir(src_dir.path(), dest_dir.path()).unwrap();
        assert_eq!(written.len(), 1);
        assert!(written[0].ends_with("g-42.jsonl"));

        let session = normalize_jsonl(&written[0]).unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].text, "搬到新竹了");
        assert_eq!(session.messages[1].role, Role::Assistant);
        // both messages inherit the session start time
        assert_eq!(
            session.earliest_timestamp().unwrap().to_rfc3339(),
            "2026-02-01T08:00:00+00:00"
        );
    }
}
