//! Persistent cache of discovered Codex models.
//!
//! The Codex CLI exposes its model catalog over the `codex app-server`
//! JSON-RPC interface. Discovery results are cached in `codex_models.json`
//! with a 24 h freshness window so validation does not spawn a subprocess
//! per call.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const CACHE_MAX_AGE_HOURS: i64 = 24;
const DISCOVERY_DEADLINE: Duration = Duration::from_secs(10);

/// A model discovered from the Codex app-server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodexModelInfo {
    pub id: String,
    pub display_name: String,
    pub description: String,
    pub supported_efforts: Vec<String>,
    pub default_effort: String,
    pub is_default: bool,
}

/// Immutable cache of Codex models with refresh logic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodexModelCache {
    pub last_updated: String,
    pub models: Vec<CodexModelInfo>,
}

impl CodexModelCache {
    /// Look up a model by id.
    pub fn get_model(&self, model_id: &str) -> Option<&CodexModelInfo> {
        self.models.iter().find(|m| m.id == model_id)
    }

    /// Check whether a model exists in the cache.
    pub fn validate_model(&self, model_id: &str) -> bool {
        self.get_model(model_id).is_some()
    }

    /// Check whether `effort` is supported by `model_id`.
    pub fn validate_reasoning_effort(&self, model_id: &str, effort: &str) -> bool {
        self.get_model(model_id)
            .is_some_and(|m| m.supported_efforts.iter().any(|e| e == effort))
    }

    fn is_stale(&self) -> bool {
        match DateTime::parse_from_rfc3339(&self.last_updated) {
            Ok(updated) => {
                Utc::now().signed_duration_since(updated.with_timezone(&Utc))
                    >= chrono::Duration::hours(CACHE_MAX_AGE_HOURS)
            }
            Err(_) => true,
        }
    }

    /// Load from disk, refreshing when stale (>24 h), empty, or missing.
    pub async fn load_or_refresh(cache_path: &Path, force_refresh: bool) -> Self {
        if !force_refresh {
            if let Ok(raw) = std::fs::read_to_string(cache_path) {
                match serde_json::from_str::<CodexModelCache>(&raw) {
                    Ok(cache) if !cache.is_stale() && !cache.models.is_empty() => {
                        debug!("Codex cache is fresh, using cached models");
                        return cache;
                    }
                    Ok(_) => info!("Codex cache stale or empty, refreshing"),
                    Err(err) => warn!(%err, "Failed to parse Codex cache, will refresh"),
                }
            }
        } else {
            info!("Codex cache refresh forced");
        }
        Self::refresh_and_save(cache_path).await
    }

    async fn refresh_and_save(cache_path: &Path) -> Self {
        let models = discover_codex_models(DISCOVERY_DEADLINE).await;
        info!(count = models.len(), "Discovered Codex models");

        let cache = Self {
            last_updated: Utc::now().to_rfc3339(),
            models,
        };

        if let Err(err) = cache.save(cache_path) {
            warn!(%err, "Failed to save Codex cache to disk");
        }
        cache
    }

    fn save(&self, cache_path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = cache_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = cache_path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, cache_path)?;
        debug!(path = %cache_path.display(), "Saved Codex cache");
        Ok(())
    }
}

/// Query `codex app-server` for available models via JSON-RPC on stdin.
///
/// Returns an empty list on timeout, missing CLI, or parse error. Never
/// errors; all failures are logged and swallowed.
pub async fn discover_codex_models(deadline: Duration) -> Vec<CodexModelInfo> {
    let Ok(codex_path) = which::which("codex") else {
        debug!("codex CLI not found, skipping model discovery");
        return Vec::new();
    };

    let input = format!(
        "{}\n{}\n",
        serde_json::json!({
            "jsonrpc": "2.0", "method": "initialize", "id": 1,
            "params": {"clientInfo": {"name": "ductor", "version": "1.0"}}
        }),
        serde_json::json!({"jsonrpc": "2.0", "method": "model/list", "id": 2, "params": {}}),
    );

    let child = tokio::process::Command::new(codex_path)
        .arg("app-server")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn();
    let mut child = match child {
        Ok(child) => child,
        Err(err) => {
            warn!(%err, "Failed to spawn codex app-server");
            return Vec::new();
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(input.as_bytes()).await;
        let _ = stdin.shutdown().await;
    }

    let output = match tokio::time::timeout(deadline, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            warn!(%err, "codex app-server failed");
            return Vec::new();
        }
        Err(_) => {
            warn!(deadline_secs = deadline.as_secs(), "Codex discovery timeout");
            return Vec::new();
        }
    };

    parse_discovery_response(&String::from_utf8_lossy(&output.stdout))
}

/// Parse JSON-RPC stdout lines for the `model/list` response (id 2).
fn parse_discovery_response(raw: &str) -> Vec<CodexModelInfo> {
    for line in raw.trim().lines() {
        let Ok(msg) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if msg.get("id").and_then(Value::as_i64) != Some(2) {
            continue;
        }
        let data = msg
            .get("result")
            .and_then(|r| r.get("data"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        return data
            .iter()
            .filter(|entry| entry.is_object())
            .map(parse_model_entry)
            .collect();
    }
    warn!("No model/list response found in codex app-server output");
    Vec::new()
}

fn parse_model_entry(entry: &Value) -> CodexModelInfo {
    let str_of = |key: &str| {
        entry
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let efforts: Vec<String> = entry
        .get("supportedReasoningEfforts")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|e| e.get("reasoningEffort").and_then(Value::as_str))
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();

    CodexModelInfo {
        id: str_of("id"),
        display_name: str_of("displayName"),
        description: str_of("description"),
        supported_efforts: if efforts.is_empty() {
            vec!["medium".into()]
        } else {
            efforts
        },
        default_effort: {
            let effort = str_of("defaultReasoningEffort");
            if effort.is_empty() {
                "medium".into()
            } else {
                effort
            }
        },
        is_default: entry
            .get("isDefault")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cache() -> CodexModelCache {
        CodexModelCache {
            last_updated: Utc::now().to_rfc3339(),
            models: vec![
                CodexModelInfo {
                    id: "gpt-5.2-codex".into(),
                    display_name: "GPT-5.2 Codex".into(),
                    description: "Flagship coding model".into(),
                    supported_efforts: vec!["low".into(), "medium".into(), "high".into()],
                    default_effort: "medium".into(),
                    is_default: true,
                },
                CodexModelInfo {
                    id: "gpt-5.1-codex-mini".into(),
                    display_name: "GPT-5.1 Codex Mini".into(),
                    description: "Small coding model".into(),
                    supported_efforts: vec!["medium".into()],
                    default_effort: "medium".into(),
                    is_default: false,
                },
            ],
        }
    }

    #[test]
    fn test_validate_model_and_effort() {
        let cache = sample_cache();
        assert!(cache.validate_model("gpt-5.2-codex"));
        assert!(!cache.validate_model("gpt-4"));
        assert!(cache.validate_reasoning_effort("gpt-5.2-codex", "high"));
        assert!(!cache.validate_reasoning_effort("gpt-5.1-codex-mini", "high"));
        assert!(!cache.validate_reasoning_effort("gpt-4", "medium"));
    }

    #[test]
    fn test_staleness() {
        let mut cache = sample_cache();
        assert!(!cache.is_stale());
        cache.last_updated = (Utc::now() - chrono::Duration::hours(25)).to_rfc3339();
        assert!(cache.is_stale());
        cache.last_updated = "garbage".into();
        assert!(cache.is_stale());
    }

    #[test]
    fn test_roundtrip() {
        let cache = sample_cache();
        let json = serde_json::to_string(&cache).unwrap();
        let back: CodexModelCache = serde_json::from_str(&json).unwrap();
        assert_eq!(cache, back);
    }

    #[test]
    fn test_parse_discovery_response() {
        let raw = concat!(
            r#"{"jsonrpc":"2.0","id":1,"result":{}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"result":{"data":[{"id":"gpt-5.2-codex","displayName":"GPT-5.2 Codex","description":"d","supportedReasoningEfforts":[{"reasoningEffort":"low"},{"reasoningEffort":"high"}],"defaultReasoningEffort":"high","isDefault":true}]}}"#,
        );
        let models = parse_discovery_response(raw);
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "gpt-5.2-codex");
        assert_eq!(models[0].supported_efforts, vec!["low", "high"]);
        assert!(models[0].is_default);
    }

    #[test]
    fn test_parse_discovery_response_no_answer() {
        assert!(parse_discovery_response(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#).is_empty());
        assert!(parse_discovery_response("garbage").is_empty());
    }

    #[test]
    fn test_parse_model_entry_defaults() {
        let entry = serde_json::json!({"id": "m1"});
        let model = parse_model_entry(&entry);
        assert_eq!(model.supported_efforts, vec!["medium"]);
        assert_eq!(model.default_effort, "medium");
        assert!(!model.is_default);
    }

    #[tokio::test]
    async fn test_load_or_refresh_uses_fresh_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codex_models.json");
        let cache = sample_cache();
        std::fs::write(&path, serde_json::to_string(&cache).unwrap()).unwrap();

        let loaded = CodexModelCache::load_or_refresh(&path, false).await;
        assert_eq!(loaded, cache);
    }
}
