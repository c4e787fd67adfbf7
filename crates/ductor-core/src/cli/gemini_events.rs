//! NDJSON parser for the Google Gemini CLI.
//!
//! Gemini uses a flat event format; this module translates it into the
//! normalized [`StreamEvent`] model.

use serde_json::Value;
use tracing::debug;

use crate::cli::stream::{ResultEvent, StreamEvent, Usage};

fn str_field(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

/// Parse a single NDJSON line from the Gemini CLI into normalized events.
pub fn parse_gemini_stream_line(line: &str) -> Vec<StreamEvent> {
    let stripped = line.trim();
    if stripped.is_empty() {
        return Vec::new();
    }

    let data: Value = match serde_json::from_str(stripped) {
        Ok(value) => value,
        Err(_) => {
            debug!(
                line = %stripped.chars().take(200).collect::<String>(),
                "Gemini: unparseable stream line"
            );
            return Vec::new();
        }
    };

    match data.get("type").and_then(Value::as_str).unwrap_or("") {
        "init" => vec![StreamEvent::SystemInit {
            session_id: str_field(&data, "session_id"),
        }],
        "message" => parse_gemini_message(&data),
        "tool_use" => vec![StreamEvent::ToolUse {
            tool_name: str_field(&data, "tool_name").unwrap_or_default(),
            tool_id: str_field(&data, "tool_id"),
            parameters: data.get("parameters").cloned(),
        }],
        "tool_result" => vec![StreamEvent::ToolResult {
            tool_id: str_field(&data, "tool_id"),
            status: str_field(&data, "status").unwrap_or_default(),
            output: str_field(&data, "output").unwrap_or_default(),
        }],
        "result" => vec![StreamEvent::Result(parse_gemini_result(&data))],
        "error" => vec![StreamEvent::Result(ResultEvent::error(
            str_field(&data, "message").unwrap_or_else(|| "Unknown Gemini error".into()),
        ))],
        _ => Vec::new(),
    }
}

/// Parse Gemini's flat message structure.
///
/// `content` is either a plain string (one delta) or a list of
/// `{type: text | tool_use}` blocks.
fn parse_gemini_message(data: &Value) -> Vec<StreamEvent> {
    if data.get("role").and_then(Value::as_str) != Some("assistant") {
        return Vec::new();
    }

    match data.get("content") {
        Some(Value::String(text)) if !text.is_empty() => {
            vec![StreamEvent::AssistantTextDelta { text: text.clone() }]
        }
        Some(Value::Array(blocks)) => {
            let mut events = Vec::new();
            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => events.push(StreamEvent::AssistantTextDelta {
                        text: str_field(block, "text").unwrap_or_default(),
                    }),
                    Some("tool_use") => events.push(StreamEvent::ToolUse {
                        tool_name: str_field(block, "name").unwrap_or_default(),
                        tool_id: str_field(block, "id"),
                        parameters: block.get("input").cloned(),
                    }),
                    _ => {}
                }
            }
            events
        }
        _ => Vec::new(),
    }
}

/// Extract metrics and final output from Gemini's result event.
fn parse_gemini_result(data: &Value) -> ResultEvent {
    let stats = data.get("stats").cloned().unwrap_or(Value::Null);
    let usage = Usage::from_value(&stats);

    let is_error = data.get("status").and_then(Value::as_str) == Some("error");
    let mut result = str_field(data, "response")
        .or_else(|| str_field(data, "content"))
        .or_else(|| str_field(data, "output"));

    if result.is_none() && is_error {
        result = match data.get("error") {
            Some(Value::Object(err)) => err
                .get("message")
                .and_then(Value::as_str)
                .map(|s| s.to_string()),
            Some(other) => Some(other.to_string()),
            None => None,
        };
    }

    ResultEvent {
        session_id: str_field(data, "session_id"),
        result: result.unwrap_or_default(),
        is_error,
        returncode: None,
        duration_ms: stats.get("duration_ms").and_then(Value::as_f64),
        duration_api_ms: None,
        total_cost_usd: None,
        usage,
        num_turns: None,
    }
}
