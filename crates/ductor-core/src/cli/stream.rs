//! Normalized stream event model and the Claude NDJSON parser.
//!
//! Every provider's raw output is translated into [`StreamEvent`]s so the
//! service layer can dispatch callbacks without knowing which CLI produced
//! the line. Malformed lines are skipped with debug logging, never fatal.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Token usage attached to a terminal result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
}

impl Usage {
    /// Lenient extraction from a provider-shaped JSON object.
    pub fn from_value(value: &Value) -> Self {
        let get = |key: &str| value.get(key).and_then(Value::as_u64).unwrap_or(0);
        Self {
            input_tokens: get("input_tokens"),
            output_tokens: get("output_tokens"),
            cached_tokens: get("cached_tokens").max(get("cached")),
        }
    }
}

/// Terminal event of every stream, carrying the final text and metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultEvent {
    pub session_id: Option<String>,
    pub result: String,
    pub is_error: bool,
    pub returncode: Option<i32>,
    pub duration_ms: Option<f64>,
    pub duration_api_ms: Option<f64>,
    pub total_cost_usd: Option<f64>,
    pub usage: Usage,
    pub num_turns: Option<u32>,
}

impl ResultEvent {
    /// A bare error result with the given text.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            result: text.into(),
            is_error: true,
            ..Default::default()
        }
    }
}

/// One normalized event from a provider CLI stream.
///
/// `Result` is always terminal; everything else is interior to a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// First event of a stream -- carries the provider-assigned session id.
    SystemInit { session_id: Option<String> },
    /// Text from an assistant turn.
    AssistantTextDelta { text: String },
    /// Extended thinking/reasoning block.
    Thinking { text: String },
    /// Tool invocation detected during streaming.
    ToolUse {
        tool_name: String,
        tool_id: Option<String>,
        parameters: Option<Value>,
    },
    /// Tool completion echoed back by the provider.
    ToolResult {
        tool_id: Option<String>,
        status: String,
        output: String,
    },
    /// System status update (e.g. `compacting`).
    SystemStatus { status: Option<String> },
    /// Marks a context compaction boundary.
    CompactBoundary { trigger: String, pre_tokens: u64 },
    /// Final event with usage, cost, and session id.
    Result(ResultEvent),
}

fn str_field(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

/// Parse a single Claude NDJSON line into normalized stream events.
pub fn parse_claude_stream_line(line: &str) -> Vec<StreamEvent> {
    let stripped = line.trim();
    if stripped.is_empty() {
        return Vec::new();
    }

    let data: Value = match serde_json::from_str(stripped) {
        Ok(value) => value,
        Err(_) => {
            debug!(
                line = %stripped.chars().take(200).collect::<String>(),
                "Unparseable stream line"
            );
            return Vec::new();
        }
    };

    match data.get("type").and_then(Value::as_str).unwrap_or("") {
        "result" => vec![StreamEvent::Result(parse_claude_result(&data))],
        "assistant" => parse_assistant_content(&data),
        "system" => parse_system_event(&data),
        _ => Vec::new(),
    }
}

/// Extract a [`ResultEvent`] from a Claude `result` frame (streaming or
/// the single JSON document of `--output-format json`).
pub fn parse_claude_result(data: &Value) -> ResultEvent {
    ResultEvent {
        session_id: str_field(data, "session_id"),
        result: str_field(data, "result").unwrap_or_default(),
        is_error: data
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        returncode: None,
        duration_ms: data.get("duration_ms").and_then(Value::as_f64),
        duration_api_ms: data.get("duration_api_ms").and_then(Value::as_f64),
        total_cost_usd: data.get("total_cost_usd").and_then(Value::as_f64),
        usage: data.get("usage").map(Usage::from_value).unwrap_or_default(),
        num_turns: data
            .get("num_turns")
            .and_then(Value::as_u64)
            .map(|n| n as u32),
    }
}

/// Route system events by subtype.
fn parse_system_event(data: &Value) -> Vec<StreamEvent> {
    match data.get("subtype").and_then(Value::as_str).unwrap_or("") {
        "init" => vec![StreamEvent::SystemInit {
            session_id: str_field(data, "session_id"),
        }],
        "status" => vec![StreamEvent::SystemStatus {
            status: str_field(data, "status"),
        }],
        "compact_boundary" => {
            let meta = data.get("compact_metadata").cloned().unwrap_or(Value::Null);
            vec![StreamEvent::CompactBoundary {
                trigger: str_field(&meta, "trigger").unwrap_or_default(),
                pre_tokens: meta
                    .get("pre_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
            }]
        }
        _ => Vec::new(),
    }
}

/// Extract all content blocks from an assistant message.
fn parse_assistant_content(data: &Value) -> Vec<StreamEvent> {
    let content = data
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array);
    let Some(blocks) = content else {
        return Vec::new();
    };

    let mut events = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str).unwrap_or("") {
            "text" => {
                let text = str_field(block, "text").unwrap_or_default();
                if !text.is_empty() {
                    events.push(StreamEvent::AssistantTextDelta { text });
                }
            }
            "tool_use" => {
                let name = str_field(block, "name").unwrap_or_default();
                if !name.is_empty() {
                    events.push(StreamEvent::ToolUse {
                        tool_name: name,
                        tool_id: str_field(block, "id"),
                        parameters: block.get("input").cloned(),
                    });
                }
            }
            "thinking" => events.push(StreamEvent::Thinking {
                text: str_field(block, "thinking")
                    .or_else(|| str_field(block, "text"))
                    .unwrap_or_default(),
            }),
            _ => {}
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_system_init() {
        let events = parse_claude_stream_line(
            r#"{"type":"system","subtype":"init","session_id":"abc-123"}"#,
        );
        assert_eq!(
            events,
            vec![StreamEvent::SystemInit {
                session_id: Some("abc-123".into())
            }]
        );
    }

    #[test]
    fn test_parse_assistant_blocks() {
        let line = r#"{"type":"assistant","message":{"content":[
            {"type":"text","text":"Hello"},
            {"type":"tool_use","name":"Bash","id":"t1","input":{"command":"ls"}},
            {"type":"thinking","thinking":"hmm"}
        ]}}"#;
        let events = parse_claude_stream_line(line);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], StreamEvent::AssistantTextDelta { text } if text == "Hello"));
        assert!(matches!(&events[1], StreamEvent::ToolUse { tool_name, .. } if tool_name == "Bash"));
        assert!(matches!(&events[2], StreamEvent::Thinking { text } if text == "hmm"));
    }

    #[test]
    fn test_parse_result_frame() {
        let line = r#"{"type":"result","session_id":"s1","result":"done","is_error":false,
            "duration_ms":1200.5,"total_cost_usd":0.01,
            "usage":{"input_tokens":400,"output_tokens":100},"num_turns":2}"#;
        let events = parse_claude_stream_line(line);
        let StreamEvent::Result(result) = &events[0] else {
            panic!("expected result event");
        };
        assert_eq!(result.session_id.as_deref(), Some("s1"));
        assert_eq!(result.result, "done");
        assert_eq!(result.usage.input_tokens, 400);
        assert_eq!(result.num_turns, Some(2));
    }

    #[test]
    fn test_parse_compact_boundary() {
        let line = r#"{"type":"system","subtype":"compact_boundary",
            "compact_metadata":{"trigger":"auto","pre_tokens":9000}}"#;
        let events = parse_claude_stream_line(line);
        assert_eq!(
            events,
            vec![StreamEvent::CompactBoundary {
                trigger: "auto".into(),
                pre_tokens: 9000
            }]
        );
    }

    #[test]
    fn test_malformed_and_unknown_lines_skipped() {
        assert!(parse_claude_stream_line("not json at all").is_empty());
        assert!(parse_claude_stream_line("").is_empty());
        assert!(parse_claude_stream_line(r#"{"type":"user"}"#).is_empty());
    }

    #[test]
    fn test_empty_text_block_skipped() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":""}]}}"#;
        assert!(parse_claude_stream_line(line).is_empty());
    }
}
