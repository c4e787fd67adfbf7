//! Application configuration and model registry.
//!
//! Loads typed configuration from `<ductor_home>/config.json`. Unknown keys
//! are preserved on disk; missing keys are deep-merged from defaults so new
//! releases can add settings without clobbering user edits.

pub mod paths;

use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::errors::DuctorError;

/// Settings for streaming response output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub enabled: bool,
    pub min_chars: usize,
    pub max_chars: usize,
    pub idle_ms: u64,
    pub edit_interval_seconds: f64,
    pub max_edit_failures: u32,
    pub append_mode: bool,
    pub sentence_break: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_chars: 200,
            max_chars: 4000,
            idle_ms: 800,
            edit_interval_seconds: 2.0,
            max_edit_failures: 3,
            append_mode: false,
            sentence_break: true,
        }
    }
}

/// Settings for Docker-based CLI sandboxing.
///
/// The sandbox itself is an external collaborator; the kernel only needs the
/// container name to wrap spawned commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub enabled: bool,
    pub image_name: String,
    pub container_name: String,
    pub auto_build: bool,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image_name: "ductor-sandbox".into(),
            container_name: "ductor-sandbox".into(),
            auto_build: true,
        }
    }
}

const DEFAULT_HEARTBEAT_PROMPT: &str = "You are running as a background heartbeat check. Review the current workspace context:\n\
- Read memory_system/MAINMEMORY.md for user interests and personality\n\
- Check cron_tasks/ for active projects\n\
- Think about what might be useful, interesting, or fun for the user\n\
\n\
If you have a creative idea, suggestion, interesting fact, or something the user might enjoy:\n\
Reply with your message directly.\n\
\n\
If nothing needs attention right now:\n\
Reply exactly: HEARTBEAT_OK";

/// Settings for the periodic heartbeat system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub cooldown_minutes: u64,
    pub quiet_start: u32,
    pub quiet_end: u32,
    pub prompt: String,
    pub ack_token: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 30,
            cooldown_minutes: 5,
            quiet_start: 21,
            quiet_end: 8,
            prompt: DEFAULT_HEARTBEAT_PROMPT.into(),
            ack_token: "HEARTBEAT_OK".into(),
        }
    }
}

/// Settings for automatic file cleanup of workspace directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,
    pub telegram_files_days: u64,
    pub output_to_user_days: u64,
    pub check_hour: u32,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            telegram_files_days: 30,
            output_to_user_days: 30,
            check_hour: 3,
        }
    }
}

/// Extra CLI parameters passed through to each provider's argv.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliParametersConfig {
    pub claude: Vec<String>,
    pub codex: Vec<String>,
    pub gemini: Vec<String>,
}

/// Settings for the webhook HTTP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub token: String,
    pub max_body_bytes: usize,
    pub rate_limit_per_minute: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".into(),
            port: 8742,
            token: String::new(),
            max_body_bytes: 262_144,
            rate_limit_per_minute: 30,
        }
    }
}

/// Top-level configuration loaded from `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub log_level: String,
    pub provider: String,
    pub model: String,
    pub ductor_home: String,
    pub idle_timeout_minutes: u64,
    pub session_age_warning_hours: u64,
    pub daily_reset_hour: u32,
    pub daily_reset_enabled: bool,
    pub max_budget_usd: Option<f64>,
    pub max_turns: Option<u32>,
    pub max_session_messages: Option<u64>,
    pub permission_mode: String,
    pub cli_timeout: f64,
    pub reasoning_effort: String,
    pub streaming: StreamingConfig,
    pub docker: DockerConfig,
    pub heartbeat: HeartbeatConfig,
    pub cleanup: CleanupConfig,
    pub webhooks: WebhookConfig,
    pub cli_parameters: CliParametersConfig,
    pub user_timezone: String,
    pub telegram_token: String,
    pub allowed_user_ids: Vec<i64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".into(),
            provider: "claude".into(),
            model: "opus".into(),
            ductor_home: "~/.ductor".into(),
            idle_timeout_minutes: 1440,
            session_age_warning_hours: 12,
            daily_reset_hour: 4,
            daily_reset_enabled: false,
            max_budget_usd: None,
            max_turns: None,
            max_session_messages: None,
            permission_mode: "bypassPermissions".into(),
            cli_timeout: 600.0,
            reasoning_effort: "medium".into(),
            streaming: StreamingConfig::default(),
            docker: DockerConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            cleanup: CleanupConfig::default(),
            webhooks: WebhookConfig::default(),
            cli_parameters: CliParametersConfig::default(),
            user_timezone: String::new(),
            telegram_token: String::new(),
            allowed_user_ids: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from `path`, deep-merging defaults for missing keys.
    ///
    /// When the merge adds keys, the merged document is written back so the
    /// file on disk always reflects the full schema. A missing or corrupt
    /// file yields the defaults (never an error).
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => return Self::default(),
        };
        let user: Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(err) => {
                warn!(path = %path.display(), %err, "Corrupt config file, using defaults");
                return Self::default();
            }
        };
        let defaults =
            serde_json::to_value(Self::default()).expect("default config serializes");
        let (merged, changed) = deep_merge_config(user, &defaults);
        if changed {
            if let Ok(content) = serde_json::to_string_pretty(&merged) {
                if let Err(err) = std::fs::write(path, content + "\n") {
                    warn!(%err, "Failed to persist merged config");
                }
            }
        }
        match serde_json::from_value(merged) {
            Ok(config) => config,
            Err(err) => {
                warn!(%err, "Config failed to deserialize after merge, using defaults");
                Self::default()
            }
        }
    }

    /// Extra CLI parameters for the given provider.
    pub fn cli_parameters_for(&self, provider: &str) -> Vec<String> {
        match provider {
            "codex" => self.cli_parameters.codex.clone(),
            "gemini" => self.cli_parameters.gemini.clone(),
            _ => self.cli_parameters.claude.clone(),
        }
    }
}

/// Recursively merge `defaults` into `user`, preserving user values.
///
/// Returns `(merged, changed)` where `changed` is true when new keys were
/// added. Unknown user keys are preserved untouched.
pub fn deep_merge_config(user: Value, defaults: &Value) -> (Value, bool) {
    let (Value::Object(mut user_map), Value::Object(default_map)) = (user, defaults) else {
        return (defaults.clone(), true);
    };
    let mut changed = false;
    let mut new_keys = 0usize;
    for (key, default_val) in default_map {
        match user_map.get(key).cloned() {
            None => {
                user_map.insert(key.clone(), default_val.clone());
                changed = true;
                new_keys += 1;
            }
            Some(existing) if existing.is_object() && default_val.is_object() => {
                let (merged, sub_changed) = deep_merge_config(existing, default_val);
                user_map.insert(key.clone(), merged);
                changed = changed || sub_changed;
            }
            Some(_) => {}
        }
    }
    if new_keys > 0 {
        info!(new_keys, "Config deep-merge added keys");
    }
    (Value::Object(user_map), changed)
}

/// Update specific top-level keys in `config.json` without touching others.
pub fn update_config_file(path: &Path, updates: &[(&str, Value)]) -> anyhow::Result<()> {
    let mut data: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
    let Some(map) = data.as_object_mut() else {
        anyhow::bail!("config.json root is not an object");
    };
    for (key, value) in updates {
        map.insert((*key).to_string(), value.clone());
    }
    std::fs::write(path, serde_json::to_string_pretty(&data)? + "\n")?;
    info!(
        keys = %updates.iter().map(|(k, _)| *k).collect::<Vec<_>>().join(","),
        "Persisted config update"
    );
    Ok(())
}

/// Resolve the user timezone: config value -> `TZ` env -> `/etc/localtime` -> UTC.
pub fn resolve_user_timezone(configured: &str) -> Tz {
    let trimmed = configured.trim();
    if !trimmed.is_empty() {
        if let Ok(tz) = Tz::from_str(trimmed) {
            return tz;
        }
        warn!(timezone = trimmed, "Invalid user_timezone, falling back to host/UTC");
    }

    if let Ok(tz_env) = std::env::var("TZ") {
        if let Ok(tz) = Tz::from_str(tz_env.trim()) {
            return tz;
        }
    }

    // Linux convention: /etc/localtime -> /usr/share/zoneinfo/<Area>/<City>.
    if let Ok(target) = std::fs::read_link("/etc/localtime") {
        let target = target.to_string_lossy().into_owned();
        if let Some(idx) = target.find("/zoneinfo/") {
            let candidate = &target[idx + "/zoneinfo/".len()..];
            if let Ok(tz) = Tz::from_str(candidate) {
                return tz;
            }
        }
    }

    chrono_tz::UTC
}

// ── Model registry ──────────────────────────────────────────────────

/// Claude model aliases accepted without a catalog lookup.
pub const CLAUDE_MODELS: &[&str] = &["haiku", "sonnet", "opus"];

/// Cross-provider equivalents used when a model's native provider is missing.
const MODEL_EQUIVALENCE: &[(&str, &str)] = &[
    ("opus", "gpt-5.2-codex"),
    ("sonnet", "gpt-5.1-codex-mini"),
    ("haiku", "gpt-5.1-codex-mini"),
    ("gpt-5.2-codex", "opus"),
    ("gpt-5.1-codex-max", "opus"),
    ("gpt-5.1-codex-mini", "sonnet"),
    ("gpt-5.2", "opus"),
    ("gpt-5.3-codex", "opus"),
];

/// Provider resolution for model names.
///
/// Claude models (haiku, sonnet, opus) are fixed; Gemini models are
/// recognised by prefix; everything else is assumed to be a Codex model
/// (the Codex catalog is discovered at runtime).
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelRegistry;

impl ModelRegistry {
    /// Return the native provider for a model name.
    pub fn provider_for(&self, model: &str) -> String {
        if CLAUDE_MODELS.contains(&model) {
            "claude".into()
        } else if model.starts_with("gemini") {
            "gemini".into()
        } else {
            "codex".into()
        }
    }

    /// Resolve `model` to `(model, provider)` against the available set.
    ///
    /// Prefers the native provider; falls back to a known equivalent; as a
    /// last resort picks any available provider (with `opus` when that
    /// provider is claude). Fails only when no provider is available.
    pub fn resolve_for_provider(
        &self,
        model: &str,
        available: &BTreeSet<String>,
    ) -> Result<(String, String), DuctorError> {
        let native = self.provider_for(model);
        if available.contains(&native) {
            return Ok((model.to_string(), native));
        }

        if let Some((_, equivalent)) =
            MODEL_EQUIVALENCE.iter().find(|(from, _)| *from == model)
        {
            let eq_provider = self.provider_for(equivalent);
            if available.contains(&eq_provider) {
                info!(
                    from = model,
                    from_provider = %native,
                    to = equivalent,
                    to_provider = %eq_provider,
                    "Model fallback"
                );
                return Ok(((*equivalent).to_string(), eq_provider));
            }
        }

        if let Some(fallback_provider) = available.iter().next() {
            let fallback_model = if fallback_provider == "claude" {
                "opus".to_string()
            } else {
                model.to_string()
            };
            warn!(
                model,
                fallback_model = %fallback_model,
                fallback_provider = %fallback_provider,
                "No equivalent model, falling back to available provider"
            );
            return Ok((fallback_model, fallback_provider.clone()));
        }

        Err(DuctorError::Config(format!(
            "No available provider for model '{model}'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn providers(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.model, "opus");
        assert_eq!(config.provider, "claude");
        assert_eq!(config.heartbeat.ack_token, "HEARTBEAT_OK");
        assert!((config.cli_timeout - 600.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_deep_merge_adds_missing_keys() {
        let user = serde_json::json!({"model": "sonnet", "heartbeat": {"enabled": true}});
        let defaults = serde_json::to_value(AgentConfig::default()).unwrap();
        let (merged, changed) = deep_merge_config(user, &defaults);
        assert!(changed);
        assert_eq!(merged["model"], "sonnet");
        assert_eq!(merged["heartbeat"]["enabled"], true);
        // Default nested keys filled in alongside the user's value.
        assert_eq!(merged["heartbeat"]["interval_minutes"], 30);
        assert_eq!(merged["provider"], "claude");
    }

    #[test]
    fn test_deep_merge_preserves_unknown_keys() {
        let user = serde_json::json!({"custom_extension": 42});
        let defaults = serde_json::to_value(AgentConfig::default()).unwrap();
        let (merged, _) = deep_merge_config(user, &defaults);
        assert_eq!(merged["custom_extension"], 42);
    }

    #[test]
    fn test_provider_for() {
        let models = ModelRegistry;
        assert_eq!(models.provider_for("opus"), "claude");
        assert_eq!(models.provider_for("gemini-2.5-pro"), "gemini");
        assert_eq!(models.provider_for("gpt-5.2-codex"), "codex");
    }

    #[test]
    fn test_resolve_native_provider() {
        let models = ModelRegistry;
        let (model, provider) = models
            .resolve_for_provider("opus", &providers(&["claude", "codex"]))
            .unwrap();
        assert_eq!((model.as_str(), provider.as_str()), ("opus", "claude"));
    }

    #[test]
    fn test_resolve_equivalent_fallback() {
        let models = ModelRegistry;
        let (model, provider) = models
            .resolve_for_provider("opus", &providers(&["codex"]))
            .unwrap();
        assert_eq!((model.as_str(), provider.as_str()), ("gpt-5.2-codex", "codex"));
    }

    #[test]
    fn test_resolve_any_available_fallback() {
        let models = ModelRegistry;
        let (model, provider) = models
            .resolve_for_provider("gemini-2.5-pro", &providers(&["claude"]))
            .unwrap();
        assert_eq!((model.as_str(), provider.as_str()), ("opus", "claude"));
    }

    #[test]
    fn test_resolve_no_providers_fails() {
        let models = ModelRegistry;
        assert!(models.resolve_for_provider("opus", &BTreeSet::new()).is_err());
    }

    #[test]
    fn test_resolve_user_timezone_invalid_falls_back() {
        // Invalid names never panic; the fallback chain ends at UTC.
        let _ = resolve_user_timezone("Not/AZone");
    }
}
