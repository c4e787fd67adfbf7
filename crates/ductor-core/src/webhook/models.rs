//! Webhook data models and template rendering.

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A registered webhook endpoint definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookEntry {
    pub id: String,
    pub title: String,
    pub description: String,
    /// `wake` resumes the main session; `cron_task` spawns a one-shot CLI.
    pub mode: String,
    pub prompt_template: String,
    pub enabled: bool,
    /// Required when mode is `cron_task`.
    pub task_folder: Option<String>,
    pub auth_mode: String,
    /// Per-hook bearer token; empty falls back to the global token.
    pub token: String,
    pub hmac_secret: String,
    /// Header carrying the signature (e.g. `X-Hub-Signature-256`).
    pub hmac_header: String,
    pub hmac_algorithm: String,
    pub hmac_encoding: String,
    /// Prefix stripped from the header value (e.g. `sha256=`).
    pub hmac_sig_prefix: String,
    /// Regex extracting the signature (group 1); overrides the prefix.
    pub hmac_sig_regex: String,
    /// Regex on the header value; group 1 is prepended to the body with
    /// `.` before signing (Stripe/Slack style).
    pub hmac_payload_prefix_regex: String,
    pub created_at: String,
    pub trigger_count: u64,
    pub last_triggered_at: Option<String>,
    pub last_error: Option<String>,

    // Per-webhook execution overrides
    pub provider: Option<String>,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub cli_parameters: Vec<String>,

    // Quiet hours (None = global config defaults)
    pub quiet_start: Option<u32>,
    pub quiet_end: Option<u32>,
}

impl Default for WebhookEntry {
    fn default() -> Self {
        Self {
            id: String::new(),
            title: String::new(),
            description: String::new(),
            mode: "wake".into(),
            prompt_template: String::new(),
            enabled: true,
            task_folder: None,
            auth_mode: "bearer".into(),
            token: String::new(),
            hmac_secret: String::new(),
            hmac_header: String::new(),
            hmac_algorithm: "sha256".into(),
            hmac_encoding: "hex".into(),
            hmac_sig_prefix: "sha256=".into(),
            hmac_sig_regex: String::new(),
            hmac_payload_prefix_regex: String::new(),
            created_at: Utc::now().to_rfc3339(),
            trigger_count: 0,
            last_triggered_at: None,
            last_error: None,
            provider: None,
            model: None,
            reasoning_effort: None,
            cli_parameters: Vec::new(),
            quiet_start: None,
            quiet_end: None,
        }
    }
}

/// Immutable result of a webhook dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResult {
    pub hook_id: String,
    pub hook_title: String,
    pub mode: String,
    pub result_text: String,
    /// `success` or `error:...`.
    pub status: String,
}

impl WebhookResult {
    pub fn error(hook_id: &str, hook_title: &str, mode: &str, status: &str) -> Self {
        Self {
            hook_id: hook_id.to_string(),
            hook_title: hook_title.to_string(),
            mode: mode.to_string(),
            result_text: String::new(),
            status: status.to_string(),
        }
    }
}

/// Replace `{{field}}` placeholders with values from `payload`.
///
/// Missing keys (and JSON nulls) render as `{{?field}}` so they are
/// visible but non-fatal; numbers and booleans coerce to their string
/// forms.
pub fn render_template(template: &str, payload: &Map<String, Value>) -> String {
    let re = Regex::new(r"\{\{(\w+)\}\}").expect("template regex compiles");
    re.replace_all(template, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        match payload.get(key) {
            None | Some(Value::Null) => format!("{{{{?{key}}}}}"),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(json: Value) -> Map<String, Value> {
        json.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_render_basic() {
        let rendered = render_template(
            "{{a}}-{{b}}",
            &payload(serde_json::json!({"a": "x", "b": "y"})),
        );
        assert_eq!(rendered, "x-y");
    }

    #[test]
    fn test_render_missing_key_visible() {
        let rendered = render_template("Do {{thing}}", &payload(serde_json::json!({})));
        assert_eq!(rendered, "Do {{?thing}}");
    }

    #[test]
    fn test_render_numbers_coerce() {
        let rendered = render_template(
            "build #{{n}} ok={{flag}}",
            &payload(serde_json::json!({"n": 17, "flag": true})),
        );
        assert_eq!(rendered, "build #17 ok=true");
    }

    #[test]
    fn test_render_null_renders_as_missing() {
        let rendered = render_template("v={{x}}", &payload(serde_json::json!({"x": null})));
        assert_eq!(rendered, "v={{?x}}");
    }

    #[test]
    fn test_entry_roundtrip() {
        let mut entry = WebhookEntry {
            id: "h1".into(),
            title: "Hook".into(),
            mode: "cron_task".into(),
            task_folder: Some("daily".into()),
            prompt_template: "Do {{msg}}".into(),
            ..Default::default()
        };
        entry.trigger_count = 4;
        let json = serde_json::to_string(&entry).unwrap();
        let back: WebhookEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(entry, back);
    }
}
