//! JSONL output parser for the OpenAI Codex CLI.

use serde_json::Value;
use tracing::{debug, warn};

use crate::cli::stream::{ResultEvent, StreamEvent, Usage};

/// Tool item type -> canonical tool name shown to the user.
const CODEX_ITEM_TOOL_MAP: &[(&str, &str)] = &[
    ("command_execution", "Bash"),
    ("file_change", "Edit"),
    ("web_search", "WebSearch"),
    ("todo_list", "TodoWrite"),
];

fn tool_name_for(item_type: &str) -> Option<&'static str> {
    CODEX_ITEM_TOOL_MAP
        .iter()
        .find(|(ty, _)| *ty == item_type)
        .map(|(_, name)| *name)
}

fn str_field(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

/// Parse a single Codex JSONL line into normalized stream events.
pub fn parse_codex_stream_event(line: &str) -> Vec<StreamEvent> {
    let stripped = line.trim();
    if stripped.is_empty() {
        return Vec::new();
    }

    let data: Value = match serde_json::from_str(stripped) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(_) | Err(_) => {
            warn!(
                line = %stripped.chars().take(100).collect::<String>(),
                "Codex line unparseable"
            );
            return Vec::new();
        }
    };

    dispatch_codex_event(&data)
}

fn dispatch_codex_event(data: &Value) -> Vec<StreamEvent> {
    let event_type = data.get("type").and_then(Value::as_str).unwrap_or("");

    match event_type {
        "thread.started" => {
            debug!(event_type, "Codex event parsed");
            vec![StreamEvent::SystemInit {
                session_id: str_field(data, "thread_id"),
            }]
        }
        "turn.completed" => {
            debug!(event_type, "Codex event parsed");
            vec![StreamEvent::Result(ResultEvent {
                usage: data.get("usage").map(Usage::from_value).unwrap_or_default(),
                ..Default::default()
            })]
        }
        "turn.failed" => {
            debug!(event_type, "Codex event parsed");
            let msg = data
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("");
            vec![StreamEvent::Result(ResultEvent::error(msg))]
        }
        "item.started" | "item.updated" | "item.completed" => parse_codex_item(data, event_type),
        _ => Vec::new(),
    }
}

/// Convert a Codex item event into normalized stream events.
///
/// `agent_message` text is only emitted from `item.completed` to avoid
/// triple-duplication across started/updated/completed. Tool indicators
/// are emitted from `item.started` so they appear immediately.
fn parse_codex_item(data: &Value, event_type: &str) -> Vec<StreamEvent> {
    let Some(item) = data.get("item").filter(|i| i.is_object()) else {
        return Vec::new();
    };
    let item_type = item.get("type").and_then(Value::as_str).unwrap_or("");

    match item_type {
        "agent_message" => {
            if event_type != "item.completed" {
                return Vec::new();
            }
            let text = str_field(item, "text").unwrap_or_default();
            if text.is_empty() {
                Vec::new()
            } else {
                vec![StreamEvent::AssistantTextDelta { text }]
            }
        }
        "reasoning" => vec![StreamEvent::Thinking {
            text: str_field(item, "text").unwrap_or_default(),
        }],
        _ => parse_tool_item(item, item_type, event_type),
    }
}

/// Extract a tool indicator from a Codex item (`item.started` only).
fn parse_tool_item(item: &Value, item_type: &str, event_type: &str) -> Vec<StreamEvent> {
    if event_type != "item.started" {
        return Vec::new();
    }
    if item_type == "mcp_tool_call" {
        let name = str_field(item, "name")
            .or_else(|| str_field(item, "tool_name"))
            .unwrap_or_else(|| "MCP".into());
        return vec![StreamEvent::ToolUse {
            tool_name: name,
            tool_id: None,
            parameters: None,
        }];
    }
    match tool_name_for(item_type) {
        Some(name) => vec![StreamEvent::ToolUse {
            tool_name: name.into(),
            tool_id: None,
            parameters: None,
        }],
        None => Vec::new(),
    }
}

// ── Whole-output parser (non-streaming + cron/webhook tasks) ─────────

/// Parse complete Codex JSONL output into `(result_text, thread_id, usage)`.
///
/// A tool item resets the accumulated text so only the reply written after
/// the last tool call survives, matching the streaming thinking filter.
pub fn parse_codex_jsonl(raw: &str) -> (String, Option<String>, Option<Usage>) {
    let mut result_parts: Vec<String> = Vec::new();
    let mut thread_id: Option<String> = None;
    let mut usage: Option<Usage> = None;

    for raw_line in raw.trim().lines() {
        let stripped = raw_line.trim();
        if stripped.is_empty() {
            continue;
        }
        let data: Value = match serde_json::from_str(stripped) {
            Ok(Value::Object(map)) => Value::Object(map),
            Ok(_) | Err(_) => {
                debug!(
                    line = %stripped.chars().take(200).collect::<String>(),
                    "Codex: skipping unparseable JSONL line"
                );
                continue;
            }
        };

        if thread_id.is_none() {
            thread_id = extract_thread_id(&data);
        }
        if let Some(extracted) = extract_usage(&data) {
            usage = Some(extracted);
        }
        if is_tool_item(&data) {
            result_parts.clear();
        }
        extract_text(&data, &mut result_parts);
    }

    (result_parts.join("\n").trim().to_string(), thread_id, usage)
}

fn extract_thread_id(data: &Value) -> Option<String> {
    let tid = str_field(data, "thread_id")?;
    Some(tid.trim().to_string())
}

fn extract_usage(data: &Value) -> Option<Usage> {
    data.get("usage")
        .filter(|u| u.is_object())
        .map(Usage::from_value)
}

fn is_tool_item(data: &Value) -> bool {
    let Some(item) = data.get("item").filter(|i| i.is_object()) else {
        return false;
    };
    let item_type = item.get("type").and_then(Value::as_str).unwrap_or("");
    tool_name_for(item_type).is_some() || item_type == "mcp_tool_call"
}

fn extract_text(data: &Value, parts: &mut Vec<String>) {
    let event_type = data.get("type").and_then(Value::as_str).unwrap_or("");

    if matches!(event_type, "item.started" | "item.updated" | "item.completed") {
        // Only item.completed counts for agent messages.
        if event_type == "item.completed" {
            if let Some(item) = data.get("item") {
                if item.get("type").and_then(Value::as_str) == Some("agent_message") {
                    if let Some(text) = str_field(item, "text").filter(|t| !t.is_empty()) {
                        parts.push(text);
                    }
                }
            }
        }
        return;
    }

    if event_type == "message" && data.get("role").and_then(Value::as_str) == Some("assistant") {
        if let Some(blocks) = data.get("content").and_then(Value::as_array) {
            for block in blocks {
                if block.get("type").and_then(Value::as_str) == Some("text") {
                    if let Some(text) = str_field(block, "text").filter(|t| !t.is_empty()) {
                        parts.push(text);
                    }
                }
            }
        }
        return;
    }

    // Fallback: items with no explicit event type.
    if let Some(item) = data.get("item").filter(|i| i.is_object()) {
        if let Some(text) = str_field(item, "text") {
            let item_type = item
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_lowercase();
            if item_type.is_empty() || item_type == "agent_message" {
                parts.push(text);
            }
        }
    }
}

// ── Thinking filter ──────────────────────────────────────────────────

/// Suppress intermediate agent text that precedes tool calls.
///
/// Buffers [`StreamEvent::AssistantTextDelta`] events. When a `ToolUse`
/// arrives the buffered text is discarded (it was the model "thinking
/// aloud" before a tool call). When any other non-thinking event arrives
/// the buffer is flushed first so final response text is preserved.
#[derive(Debug, Default)]
pub struct CodexThinkingFilter {
    buffered: Vec<StreamEvent>,
}

impl CodexThinkingFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one event, returning zero or more events to emit.
    pub fn process(&mut self, event: StreamEvent) -> Vec<StreamEvent> {
        match event {
            StreamEvent::AssistantTextDelta { .. } => {
                self.buffered.push(event);
                Vec::new()
            }
            StreamEvent::ToolUse { .. } => {
                self.buffered.clear();
                vec![event]
            }
            StreamEvent::Thinking { .. } => vec![event],
            other => {
                let mut out = std::mem::take(&mut self.buffered);
                out.push(other);
                out
            }
        }
    }

    /// Flush remaining buffered events (call at stream end).
    pub fn flush(&mut self) -> Vec<StreamEvent> {
        std::mem::take(&mut self.buffered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(t: &str) -> StreamEvent {
        StreamEvent::AssistantTextDelta { text: t.into() }
    }

    fn tool(name: &str) -> StreamEvent {
        StreamEvent::ToolUse {
            tool_name: name.into(),
            tool_id: None,
            parameters: None,
        }
    }

    #[test]
    fn test_agent_message_only_on_completed() {
        for phase in ["item.started", "item.updated"] {
            let line = format!(
                r#"{{"type":"{phase}","item":{{"type":"agent_message","text":"partial"}}}}"#
            );
            assert!(parse_codex_stream_event(&line).is_empty(), "phase {phase}");
        }
        let line = r#"{"type":"item.completed","item":{"type":"agent_message","text":"final"}}"#;
        assert_eq!(parse_codex_stream_event(line), vec![text("final")]);
    }

    #[test]
    fn test_tool_indicator_on_started_only() {
        let started = r#"{"type":"item.started","item":{"type":"command_execution","command":"ls"}}"#;
        assert_eq!(parse_codex_stream_event(started), vec![tool("Bash")]);

        let completed =
            r#"{"type":"item.completed","item":{"type":"command_execution","command":"ls"}}"#;
        assert!(parse_codex_stream_event(completed).is_empty());
    }

    #[test]
    fn test_mcp_tool_call_uses_item_name() {
        let line = r#"{"type":"item.started","item":{"type":"mcp_tool_call","name":"search_docs"}}"#;
        assert_eq!(parse_codex_stream_event(line), vec![tool("search_docs")]);
    }

    #[test]
    fn test_thread_started_and_turn_completed() {
        let events = parse_codex_stream_event(r#"{"type":"thread.started","thread_id":"th-1"}"#);
        assert_eq!(
            events,
            vec![StreamEvent::SystemInit {
                session_id: Some("th-1".into())
            }]
        );

        let events = parse_codex_stream_event(
            r#"{"type":"turn.completed","usage":{"input_tokens":10,"output_tokens":5}}"#,
        );
        let StreamEvent::Result(result) = &events[0] else {
            panic!("expected result");
        };
        assert!(!result.is_error);
        assert_eq!(result.usage.output_tokens, 5);
    }

    #[test]
    fn test_turn_failed_is_error_result() {
        let events = parse_codex_stream_event(
            r#"{"type":"turn.failed","error":{"message":"quota exceeded"}}"#,
        );
        let StreamEvent::Result(result) = &events[0] else {
            panic!("expected result");
        };
        assert!(result.is_error);
        assert_eq!(result.result, "quota exceeded");
    }

    #[test]
    fn test_parse_codex_jsonl_tool_reset() {
        let raw = concat!(
            r#"{"type":"thread.started","thread_id":"th-9"}"#,
            "\n",
            r#"{"type":"item.completed","item":{"type":"agent_message","text":"I'll check."}}"#,
            "\n",
            r#"{"type":"item.started","item":{"type":"command_execution"}}"#,
            "\n",
            r#"{"type":"item.completed","item":{"type":"agent_message","text":"All done."}}"#,
            "\n",
            r#"{"type":"turn.completed","usage":{"input_tokens":7,"output_tokens":3}}"#,
        );
        let (result, thread_id, usage) = parse_codex_jsonl(raw);
        assert_eq!(result, "All done.");
        assert_eq!(thread_id.as_deref(), Some("th-9"));
        assert_eq!(usage.unwrap().input_tokens, 7);
    }

    #[test]
    fn test_thinking_filter_drops_pre_tool_text() {
        let mut filter = CodexThinkingFilter::new();
        let result = StreamEvent::Result(ResultEvent::default());

        let mut out = Vec::new();
        for event in [text("a"), text("b"), tool("Bash"), text("c"), result.clone()] {
            out.extend(filter.process(event));
        }
        out.extend(filter.flush());

        assert_eq!(out, vec![tool("Bash"), text("c"), result]);
    }

    #[test]
    fn test_thinking_filter_passes_thinking_through() {
        let mut filter = CodexThinkingFilter::new();
        let out = filter.process(StreamEvent::Thinking { text: "t".into() });
        assert_eq!(out.len(), 1);
        // Buffered text stays buffered across thinking events.
        filter.process(text("kept"));
        let out = filter.process(StreamEvent::Thinking { text: "t2".into() });
        assert_eq!(out.len(), 1);
        assert_eq!(filter.flush(), vec![text("kept")]);
    }
}
