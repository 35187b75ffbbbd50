//! Hook event payloads — the shapes hosts write to our stdin.

use serde::Deserialize;
use serde_json::Value;

use engram_core::config::TOKEN_TRIGGER_THRESHOLD;

/// After-model hook payload. Only the prompt token count matters; the rest
/// of the response is opaque.
#[derive(Debug, Deserialize)]
pub struct TokenMonitorEvent {
    #[serde(default)]
    pub llm_response: Option<LlmResponse>,
}

#[derive(Debug, Deserialize)]
pub struct LlmResponse {
    #[serde(rename = "usageMetadata", default)]
    pub usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    pub prompt_token_count: Option<u64>,
}

impl TokenMonitorEvent {
    pub fn prompt_tokens(&self) -> Option<u64> {
        self.llm_response
            .as_ref()?
            .usage_metadata
            .as_ref()?
            .prompt_token_count
    }

    /// True once the context has grown past 65% of the 128k window.
    pub fn should_trigger(&self) -> bool {
        self.prompt_tokens()
            .is_some_and(|n| n >= TOKEN_TRIGGER_THRESHOLD)
    }
}

/// Session-end / pre-compress hook payload. When `session_path` is absent the
/// caller falls back to the host's most recently modified session file.
#[derive(Debug, Deserialize)]
pub struct SessionEndEvent {
    #[serde(default)]
    pub session_path: Option<String>,
}

/// Observe-tool-use hook payload.
#[derive(Debug, Deserialize)]
pub struct ToolUseEvent {
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    #[serde(default)]
    pub tool_output: Value,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_monitor_trigger_threshold() {
        let ev: TokenMonitorEvent = serde_json::from_str(
            r#"{"llm_response":{"usageMetadata":{"promptTokenCount":90000}}}"#,
        )
        .unwrap();
        assert_eq!(ev.prompt_tokens(), Some(90_000));
        assert!(ev.should_trigger());

        let ev: TokenMonitorEvent = serde_json::from_str(
            r#"{"llm_response":{"usageMetadata":{"promptTokenCount":50000}}}"#,
        )
        .unwrap();
        assert!(!ev.should_trigger());
    }

    #[test]
    fn missing_fields_never_trigger() {
        let ev: TokenMonitorEvent = serde_json::from_str("{}").unwrap();
        assert_eq!(ev.prompt_tokens(), None);
        assert!(!ev.should_trigger());

        let ev: TokenMonitorEvent =
            serde_json::from_str(r#"{"llm_response":{}}"#).unwrap();
        assert!(!ev.should_trigger());
    }

    #[test]
    fn tool_use_event_decodes() {
        let ev: ToolUseEvent = serde_json::from_str(
            r#"{"tool_name":"Bash","tool_input":{"command":"cargo test"},"tool_output":"Exit code 1","session_id":"s1"}"#,
        )
        .unwrap();
        assert_eq!(ev.tool_name, "Bash");
        assert_eq!(ev.session_id.as_deref(), Some("s1"));
    }
}
