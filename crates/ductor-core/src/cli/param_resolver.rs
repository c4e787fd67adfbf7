//! Central authority for CLI parameter and model resolution.
//!
//! Cron jobs and webhooks carry optional per-task overrides; this module
//! merges them with the global config, validates the result, and returns an
//! immutable execution config for one CLI spawn.

use crate::cli::codex_cache::CodexModelCache;
use crate::config::{AgentConfig, CLAUDE_MODELS};
use crate::errors::DuctorError;

/// Per-task configuration overrides from a CronJob or WebhookEntry.
#[derive(Debug, Clone, Default)]
pub struct TaskOverrides {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub cli_parameters: Vec<String>,
}

/// Resolved configuration for a single CLI execution.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskExecutionConfig {
    pub provider: String,
    pub model: String,
    pub reasoning_effort: String,
    pub cli_parameters: Vec<String>,
    pub permission_mode: String,
    pub working_dir: String,
}

/// Merge global config with task overrides, validate, return execution config.
///
/// Claude models are validated against the fixed alias set, Codex models
/// against the discovered cache, Gemini by convention. The reasoning effort
/// only survives when the Codex model declares support for it.
pub fn resolve_cli_config(
    base_config: &AgentConfig,
    codex_cache: Option<&CodexModelCache>,
    task_overrides: Option<&TaskOverrides>,
) -> Result<TaskExecutionConfig, DuctorError> {
    let default_overrides = TaskOverrides::default();
    let overrides = task_overrides.unwrap_or(&default_overrides);

    let provider = overrides
        .provider
        .clone()
        .unwrap_or_else(|| base_config.provider.clone());
    let model = overrides
        .model
        .clone()
        .unwrap_or_else(|| base_config.model.clone());

    match provider.as_str() {
        "claude" => {
            if !CLAUDE_MODELS.contains(&model.as_str()) {
                return Err(DuctorError::Validation(format!(
                    "Invalid Claude model: {model}. Must be one of {CLAUDE_MODELS:?}"
                )));
            }
        }
        "gemini" => {
            // Gemini models are validated by prefix inside the adapter.
        }
        _ => {
            let Some(cache) = codex_cache else {
                return Err(DuctorError::Validation(
                    "Codex cache is required for Codex model validation".into(),
                ));
            };
            if !cache.validate_model(&model) {
                return Err(DuctorError::Validation(format!(
                    "Invalid Codex model: {model}"
                )));
            }
        }
    }

    let mut reasoning_effort = String::new();
    if provider == "codex" {
        let requested = overrides
            .reasoning_effort
            .clone()
            .unwrap_or_else(|| base_config.reasoning_effort.clone());
        if let Some(cache) = codex_cache {
            if !requested.is_empty() && cache.validate_reasoning_effort(&model, &requested) {
                reasoning_effort = requested;
            }
            // Unsupported efforts fall back to empty (provider default).
        }
    }

    Ok(TaskExecutionConfig {
        provider,
        model,
        reasoning_effort,
        cli_parameters: overrides.cli_parameters.clone(),
        permission_mode: base_config.permission_mode.clone(),
        working_dir: base_config.ductor_home.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::codex_cache::{CodexModelCache, CodexModelInfo};

    fn cache() -> CodexModelCache {
        CodexModelCache {
            last_updated: chrono::Utc::now().to_rfc3339(),
            models: vec![CodexModelInfo {
                id: "gpt-5.2-codex".into(),
                display_name: "GPT-5.2 Codex".into(),
                description: String::new(),
                supported_efforts: vec!["medium".into(), "high".into()],
                default_effort: "medium".into(),
                is_default: true,
            }],
        }
    }

    #[test]
    fn test_defaults_from_global_config() {
        let config = AgentConfig::default();
        let resolved = resolve_cli_config(&config, None, None).unwrap();
        assert_eq!(resolved.provider, "claude");
        assert_eq!(resolved.model, "opus");
        assert_eq!(resolved.reasoning_effort, "");
        assert_eq!(resolved.permission_mode, "bypassPermissions");
    }

    #[test]
    fn test_invalid_claude_model_rejected() {
        let config = AgentConfig::default();
        let overrides = TaskOverrides {
            model: Some("gpt-5.2-codex".into()),
            ..Default::default()
        };
        let err = resolve_cli_config(&config, None, Some(&overrides)).unwrap_err();
        assert!(matches!(err, DuctorError::Validation(_)));
    }

    #[test]
    fn test_codex_requires_cache() {
        let config = AgentConfig {
            provider: "codex".into(),
            model: "gpt-5.2-codex".into(),
            ..Default::default()
        };
        assert!(resolve_cli_config(&config, None, None).is_err());
        assert!(resolve_cli_config(&config, Some(&cache()), None).is_ok());
    }

    #[test]
    fn test_codex_unknown_model_rejected() {
        let config = AgentConfig {
            provider: "codex".into(),
            model: "gpt-unknown".into(),
            ..Default::default()
        };
        assert!(resolve_cli_config(&config, Some(&cache()), None).is_err());
    }

    #[test]
    fn test_reasoning_effort_validated_against_cache() {
        let config = AgentConfig {
            provider: "codex".into(),
            model: "gpt-5.2-codex".into(),
            reasoning_effort: "high".into(),
            ..Default::default()
        };
        let resolved = resolve_cli_config(&config, Some(&cache()), None).unwrap();
        assert_eq!(resolved.reasoning_effort, "high");

        // Unsupported effort falls back to empty string.
        let overrides = TaskOverrides {
            reasoning_effort: Some("xhigh".into()),
            ..Default::default()
        };
        let resolved = resolve_cli_config(&config, Some(&cache()), Some(&overrides)).unwrap();
        assert_eq!(resolved.reasoning_effort, "");
    }

    #[test]
    fn test_overrides_win() {
        let config = AgentConfig::default();
        let overrides = TaskOverrides {
            provider: Some("claude".into()),
            model: Some("sonnet".into()),
            cli_parameters: vec!["--max-turns".into(), "5".into()],
            ..Default::default()
        };
        let resolved = resolve_cli_config(&config, None, Some(&overrides)).unwrap();
        assert_eq!(resolved.model, "sonnet");
        assert_eq!(resolved.cli_parameters, vec!["--max-turns", "5"]);
    }
}
