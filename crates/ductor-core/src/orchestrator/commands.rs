//! Chat command handlers dispatched by the command registry.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::config::{update_config_file, CLAUDE_MODELS};
use crate::orchestrator::{Orchestrator, OrchestratorResult};

/// `/new` -- start a fresh session for the current provider target.
pub async fn cmd_reset(orch: &Orchestrator, chat_id: i64, _text: &str) -> Result<OrchestratorResult> {
    let config = orch.config_snapshot();
    let (model, provider) = orch.resolve_runtime_target(&config.model)?;
    orch.sessions().reset_session(chat_id, &provider, &model).await;
    Ok(OrchestratorResult::text(format!(
        "New session started. Model: {model}"
    )))
}

/// `/stop` -- kill every running CLI process for this chat.
pub async fn cmd_stop(orch: &Orchestrator, chat_id: i64, _text: &str) -> Result<OrchestratorResult> {
    let killed = orch.abort(chat_id).await;
    let reply = if killed > 0 {
        format!("Stopped {killed} running process(es).")
    } else {
        "Nothing to stop.".to_string()
    };
    Ok(OrchestratorResult::text(reply))
}

/// `/status` -- current session, model, and usage overview.
pub async fn cmd_status(orch: &Orchestrator, chat_id: i64, _text: &str) -> Result<OrchestratorResult> {
    let config = orch.config_snapshot();
    let providers = orch.available_providers();
    let mut lines = vec![
        format!("Model: {} ({})", config.model, config.provider),
        format!(
            "Providers: {}",
            if providers.is_empty() {
                "none authenticated".to_string()
            } else {
                providers.iter().cloned().collect::<Vec<_>>().join(", ")
            }
        ),
    ];

    match orch.sessions().get_active(chat_id).await {
        Some(session) => {
            let active = session.active();
            let age = DateTime::parse_from_rfc3339(&session.created_at)
                .map(|created| {
                    let hours = (Utc::now() - created.with_timezone(&Utc)).num_hours();
                    format!("{hours}h")
                })
                .unwrap_or_else(|_| "?".into());
            lines.push(format!(
                "Session: {} messages, {} tokens, ${:.4}, {} old",
                active.message_count, active.total_tokens, active.total_cost_usd, age
            ));
        }
        None => lines.push("Session: none".into()),
    }

    if orch.process_registry().has_active(chat_id) {
        lines.push("Busy: a CLI process is running (use /stop to abort).".into());
    }
    Ok(OrchestratorResult::text(lines.join("\n")))
}

/// `/model [name]` -- show or switch the default model.
pub async fn cmd_model(orch: &Orchestrator, _chat_id: i64, text: &str) -> Result<OrchestratorResult> {
    let arg = text
        .trim()
        .strip_prefix("/model")
        .unwrap_or("")
        .trim()
        .to_string();

    if arg.is_empty() {
        let config = orch.config_snapshot();
        let mut known: Vec<String> = CLAUDE_MODELS.iter().map(|m| m.to_string()).collect();
        known.extend(orch.codex_model_ids());
        return Ok(OrchestratorResult::text(format!(
            "Current model: {}\nAvailable: {}",
            config.model,
            known.join(", ")
        )));
    }

    let provider = orch.models().provider_for(&arg);
    let valid = match provider.as_str() {
        "claude" => CLAUDE_MODELS.contains(&arg.as_str()),
        "gemini" => true,
        _ => orch.codex_model_ids().iter().any(|m| m == &arg),
    };
    if !valid {
        return Ok(OrchestratorResult::text(format!(
            "Unknown model: {arg}. Use /model to list available models."
        )));
    }

    {
        let mut config = orch.config_mut();
        config.model = arg.clone();
        config.provider = provider.clone();
    }
    orch.cli_service().update_default_model(&arg);
    let paths = orch.paths().clone();
    let model_value = serde_json::Value::String(arg.clone());
    let provider_value = serde_json::Value::String(provider.clone());
    let persisted = tokio::task::spawn_blocking(move || {
        update_config_file(
            &paths.config_path,
            &[("model", model_value), ("provider", provider_value)],
        )
    })
    .await;
    if matches!(persisted, Ok(Err(_)) | Err(_)) {
        tracing::warn!("Failed to persist model switch");
    }

    Ok(OrchestratorResult::text(format!(
        "Model switched to {arg} ({provider})."
    )))
}

/// `/memory` -- show the main memory file.
pub async fn cmd_memory(orch: &Orchestrator, _chat_id: i64, _text: &str) -> Result<OrchestratorResult> {
    let content = orch.paths().read_mainmemory();
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Ok(OrchestratorResult::text("Memory is empty."));
    }
    let cut = trimmed
        .char_indices()
        .nth(3500)
        .map_or(trimmed.len(), |(i, _)| i);
    Ok(OrchestratorResult::text(&trimmed[..cut]))
}

/// `/cron` -- list scheduled jobs.
pub async fn cmd_cron(orch: &Orchestrator, _chat_id: i64, _text: &str) -> Result<OrchestratorResult> {
    let jobs = orch.cron_manager().lock().expect("manager lock").list_jobs();
    if jobs.is_empty() {
        return Ok(OrchestratorResult::text("No cron jobs configured."));
    }
    let lines: Vec<String> = jobs
        .iter()
        .map(|job| {
            format!(
                "{} {} — {} ({}){}",
                if job.enabled { "[on]" } else { "[off]" },
                job.id,
                job.title,
                job.schedule,
                job.last_run_status
                    .as_deref()
                    .map(|s| format!(" last: {s}"))
                    .unwrap_or_default(),
            )
        })
        .collect();
    Ok(OrchestratorResult::text(lines.join("\n")))
}

/// `/diagnose` -- quick health overview for debugging.
pub async fn cmd_diagnose(orch: &Orchestrator, chat_id: i64, _text: &str) -> Result<OrchestratorResult> {
    let config = orch.config_snapshot();
    let providers = orch.available_providers();
    let hooks = orch
        .webhook_manager()
        .lock()
        .expect("manager lock")
        .list_hooks()
        .len();
    let jobs = orch
        .cron_manager()
        .lock()
        .expect("manager lock")
        .list_jobs()
        .len();
    let lines = vec![
        format!("Home: {}", orch.paths().ductor_home.display()),
        format!(
            "Providers: {}",
            if providers.is_empty() {
                "none".to_string()
            } else {
                providers.iter().cloned().collect::<Vec<_>>().join(", ")
            }
        ),
        format!("Active processes (this chat): {}", orch.process_registry().has_active(chat_id)),
        format!("Cron jobs: {jobs}"),
        format!(
            "Webhooks: {} (server {})",
            hooks,
            if config.webhooks.enabled { "enabled" } else { "disabled" }
        ),
        format!(
            "Heartbeat: {}",
            if config.heartbeat.enabled { "enabled" } else { "disabled" }
        ),
        format!("Streaming: {}", config.streaming.enabled),
        format!("CLI timeout: {:.0}s", config.cli_timeout),
    ];
    Ok(OrchestratorResult::text(lines.join("\n")))
}

/// `/upgrade` -- refresh the Codex model catalog.
pub async fn cmd_upgrade(orch: &Orchestrator, _chat_id: i64, _text: &str) -> Result<OrchestratorResult> {
    let count = orch.refresh_codex_cache(true).await;
    Ok(OrchestratorResult::text(format!(
        "Model catalog refreshed: {count} Codex model(s) discovered."
    )))
}
