//! Core conversation flows: normal message handling with session management.

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::cli::service::StreamCallbacks;
use crate::cli::types::{AgentRequest, AgentResponse};
use crate::orchestrator::hooks::HookContext;
use crate::orchestrator::{Orchestrator, OrchestratorResult};
use crate::session::Session;

const SIGKILL_RETURNCODE: i32 = -9;

/// Shared setup for the conversation flow (initial call and retries).
///
/// Returns `(request, session)` so the caller can update the session after
/// the CLI call.
async fn prepare_normal(
    orch: &Orchestrator,
    chat_id: i64,
    text: &str,
    model_override: Option<&str>,
) -> Result<(AgentRequest, Session)> {
    let config = orch.config_snapshot();
    let requested_model = model_override.unwrap_or(&config.model);
    let (req_model, req_provider) = orch.resolve_runtime_target(requested_model)?;

    let (mut session, is_new) = orch
        .sessions()
        .resolve_session(chat_id, &req_provider, &req_model)
        .await;
    orch.sessions()
        .sync_session_target(&mut session, Some(&req_provider), Some(&req_model))
        .await;
    info!(
        sid = %short_sid(&session.session_id()),
        new = is_new,
        msgs = session.message_count(),
        "Session resolved"
    );

    let append_prompt = if is_new {
        let mainmemory = orch.paths().read_mainmemory();
        (!mainmemory.trim().is_empty()).then_some(mainmemory)
    } else {
        None
    };

    let hook_ctx = HookContext {
        chat_id,
        message_count: session.message_count(),
        is_new_session: is_new,
        provider: req_provider.clone(),
        model: req_model.clone(),
    };
    let prompt = orch.hooks().apply(text, &hook_ctx);

    let request = AgentRequest {
        prompt,
        append_system_prompt: append_prompt,
        model_override: Some(req_model),
        provider_override: Some(req_provider),
        chat_id,
        process_label: "main".into(),
        resume_session: (!is_new && !session.session_id().is_empty())
            .then(|| session.session_id()),
        timeout_seconds: Some(config.cli_timeout),
        ..Default::default()
    };
    Ok((request, session))
}

/// Store the real CLI session id and update metrics.
async fn store_session_update(
    orch: &Orchestrator,
    session: &mut Session,
    response: &AgentResponse,
) {
    if let Some(new_sid) = response
        .session_id
        .as_deref()
        .filter(|sid| !sid.is_empty() && **sid != session.session_id())
    {
        info!(
            from = %short_sid(&session.session_id()),
            to = %short_sid(new_sid),
            "Session id updated"
        );
        session.set_session_id(new_sid);
    }
    orch.sessions()
        .update_session(session, response.cost_usd, response.total_tokens)
        .await;
}

/// User-facing message for signal-killed CLI subprocesses.
fn sigkill_message(returncode: Option<i32>) -> Option<&'static str> {
    (returncode == Some(SIGKILL_RETURNCODE))
        .then_some("Execution was interrupted. Please send the same request again.")
}

fn is_sigkill(response: &AgentResponse) -> bool {
    response.is_error && response.returncode == Some(SIGKILL_RETURNCODE)
}

fn short_sid(sid: &str) -> &str {
    if sid.is_empty() {
        "<new>"
    } else {
        &sid[..sid.len().min(8)]
    }
}

async fn execute_request(
    orch: &Orchestrator,
    request: &AgentRequest,
    callbacks: Option<&StreamCallbacks>,
) -> Result<AgentResponse> {
    match callbacks {
        Some(callbacks) => orch.cli_service().execute_streaming(request, callbacks).await,
        None => orch.cli_service().execute(request).await,
    }
}

/// Handle a normal conversation turn with session resume.
///
/// With callbacks, events stream through them; otherwise the call is a
/// single non-streaming round trip.
pub async fn normal(
    orch: &Orchestrator,
    chat_id: i64,
    text: &str,
    model_override: Option<&str>,
    callbacks: Option<&StreamCallbacks>,
) -> Result<OrchestratorResult> {
    info!(streaming = callbacks.is_some(), "Conversation flow starting");
    let (mut request, mut session) = prepare_normal(orch, chat_id, text, model_override).await?;
    let mut response = execute_request(orch, &request, callbacks).await?;

    if orch.process_registry().was_aborted(chat_id) {
        info!("Conversation flow aborted by user");
        return Ok(OrchestratorResult::text(""));
    }

    if response.is_error && request.resume_session.is_some() {
        // Resume failed: reset this provider's thread and retry fresh once.
        warn!(
            sid = %short_sid(request.resume_session.as_deref().unwrap_or("")),
            "Resume failed, retrying fresh"
        );
        orch.sessions()
            .reset_provider_session(chat_id, &session.provider)
            .await;
        (request, session) = prepare_normal(orch, chat_id, text, model_override).await?;
        response = execute_request(orch, &request, callbacks).await?;
    }

    if is_sigkill(&response) {
        // One recovery cycle: reset the provider session and retry.
        warn!(chat_id, "SIGKILL recovery: resetting session and retrying");
        orch.process_registry().kill_all(chat_id).await;
        orch.sessions()
            .reset_provider_session(chat_id, &session.provider)
            .await;
        if let Some(callbacks) = callbacks {
            if let Some(on_status) = &callbacks.on_system_status {
                on_status(Some("recovering".into())).await;
            }
        }
        (request, session) = prepare_normal(orch, chat_id, text, model_override).await?;
        response = execute_request(orch, &request, callbacks).await?;
    }

    if response.is_error {
        if let Some(message) = sigkill_message(response.returncode) {
            warn!(chat_id, "SIGKILL recovery exhausted, asking user to resend");
            return Ok(OrchestratorResult::text(message));
        }
        if orch.process_registry().was_aborted(chat_id) {
            info!("Conversation flow aborted by user (after retry)");
            return Ok(OrchestratorResult::text(""));
        }
        // Terminal error: surface it and keep the session as-is.
        return Ok(finish_normal(&response, None, 0));
    }

    store_session_update(orch, &mut session, &response).await;
    info!("Conversation flow completed");
    let warning_hours = orch.config_snapshot().session_age_warning_hours;
    Ok(finish_normal(&response, Some(&session), warning_hours))
}

/// Short age warning when the session exceeds the configured threshold.
///
/// Shown once every 10 messages to avoid spam.
fn session_age_note(session: &Session, warning_hours: u64) -> String {
    if warning_hours == 0 {
        return String::new();
    }
    let Ok(created) = DateTime::parse_from_rfc3339(&session.created_at) else {
        return String::new();
    };
    let age_hours = (Utc::now() - created.with_timezone(&Utc)).num_seconds() as f64 / 3600.0;
    if age_hours < warning_hours as f64 {
        return String::new();
    }
    if session.message_count() % 10 != 0 {
        return String::new();
    }
    let age_label = if age_hours < 48.0 {
        format!("{}h", age_hours as u64)
    } else {
        format!("{}d", (age_hours / 24.0) as u64)
    };
    format!("\n\n---\n[Session is {age_label} old. Use /new for a fresh start.]")
}

/// Post-processing shared by the streaming and non-streaming paths.
fn finish_normal(
    response: &AgentResponse,
    session: Option<&Session>,
    warning_hours: u64,
) -> OrchestratorResult {
    if response.is_error {
        if response.timed_out {
            return OrchestratorResult::text("Agent timed out. Please try again.");
        }
        if let Some(message) = sigkill_message(response.returncode) {
            return OrchestratorResult::text(message);
        }
        let trimmed = response.result.trim();
        if !trimmed.is_empty() {
            let cut = trimmed.char_indices().nth(500).map_or(trimmed.len(), |(i, _)| i);
            return OrchestratorResult::text(format!("Error: {}", &trimmed[..cut]));
        }
        return OrchestratorResult::text("Error: check logs for details.");
    }

    let mut text = response.result.clone();
    if let Some(session) = session {
        text.push_str(&session_age_note(session, warning_hours));
    }
    OrchestratorResult {
        text,
        stream_fallback: response.stream_fallback,
    }
}

// ── Heartbeat flow ──────────────────────────────────────────────────

/// Remove leading/trailing repetitions of the ack token.
fn strip_ack_token(text: &str, token: &str) -> String {
    if token.is_empty() {
        return text.trim().to_string();
    }
    let mut stripped = text.trim();
    loop {
        let before = stripped;
        stripped = stripped
            .strip_prefix(token)
            .unwrap_or(stripped)
            .trim_start();
        stripped = stripped.strip_suffix(token).unwrap_or(stripped).trim_end();
        if stripped == before {
            break;
        }
    }
    stripped.to_string()
}

/// Run a heartbeat turn in the existing session.
///
/// Returns the alert text when the model has something to say, or `None`
/// for the ack token. Never creates a session and does not update counters
/// on suppressed acks.
pub async fn heartbeat_flow(orch: &Orchestrator, chat_id: i64) -> Result<Option<String>> {
    let config = orch.config_snapshot();
    let heartbeat_config = config.heartbeat.clone();
    let (req_model, req_provider) = orch.resolve_runtime_target(&config.model)?;

    // Read-only check: never create/overwrite a session from this path.
    let Some(mut session) = orch.sessions().get_active(chat_id).await else {
        return Ok(None);
    };
    if session.session_id().is_empty() {
        return Ok(None);
    }
    if session.provider != req_provider {
        info!(
            session_provider = %session.provider,
            current = %req_provider,
            "Heartbeat skipped: provider mismatch"
        );
        return Ok(None);
    }

    orch.sessions()
        .sync_session_target(&mut session, None, Some(&req_model))
        .await;

    let idle_seconds = DateTime::parse_from_rfc3339(&session.last_active)
        .map(|last| (Utc::now() - last.with_timezone(&Utc)).num_seconds())
        .unwrap_or(i64::MAX);
    let cooldown_seconds = heartbeat_config.cooldown_minutes as i64 * 60;
    if idle_seconds < cooldown_seconds {
        info!(
            idle = idle_seconds,
            cooldown = cooldown_seconds,
            "Heartbeat skipped: cooldown"
        );
        return Ok(None);
    }

    let request = AgentRequest {
        prompt: heartbeat_config.prompt.clone(),
        model_override: Some(req_model),
        provider_override: Some(req_provider),
        chat_id,
        process_label: "heartbeat".into(),
        resume_session: Some(session.session_id()),
        timeout_seconds: Some(config.cli_timeout),
        ..Default::default()
    };

    let response = orch.cli_service().execute(&request).await?;
    if response.is_error {
        warn!(
            result = %response.result.chars().take(200).collect::<String>(),
            "Heartbeat CLI error"
        );
        return Ok(None);
    }

    let alert_text = strip_ack_token(&response.result, &heartbeat_config.ack_token);
    if alert_text.is_empty() {
        info!("Heartbeat OK (suppressed)");
        return Ok(None);
    }

    store_session_update(orch, &mut session, &response).await;
    info!(chars = alert_text.len(), "Heartbeat alert");
    Ok(Some(alert_text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ack_token() {
        assert_eq!(strip_ack_token("HEARTBEAT_OK", "HEARTBEAT_OK"), "");
        assert_eq!(
            strip_ack_token("HEARTBEAT_OK HEARTBEAT_OK", "HEARTBEAT_OK"),
            ""
        );
        assert_eq!(
            strip_ack_token("HEARTBEAT_OK but check the logs", "HEARTBEAT_OK"),
            "but check the logs"
        );
        assert_eq!(
            strip_ack_token("All quiet. HEARTBEAT_OK", "HEARTBEAT_OK"),
            "All quiet."
        );
        assert_eq!(strip_ack_token("  plain reply  ", "HEARTBEAT_OK"), "plain reply");
    }

    #[test]
    fn test_sigkill_detection() {
        assert!(sigkill_message(Some(-9)).is_some());
        assert!(sigkill_message(Some(1)).is_none());
        assert!(sigkill_message(None).is_none());

        let response = AgentResponse {
            is_error: true,
            returncode: Some(-9),
            ..Default::default()
        };
        assert!(is_sigkill(&response));
        let ok = AgentResponse {
            returncode: Some(-9),
            ..Default::default()
        };
        assert!(!is_sigkill(&ok), "non-error responses are not SIGKILL");
    }

    #[test]
    fn test_finish_normal_error_shapes() {
        let timeout = AgentResponse {
            is_error: true,
            timed_out: true,
            ..Default::default()
        };
        assert_eq!(
            finish_normal(&timeout, None, 0).text,
            "Agent timed out. Please try again."
        );

        let with_text = AgentResponse {
            is_error: true,
            result: "model exploded".into(),
            ..Default::default()
        };
        assert_eq!(
            finish_normal(&with_text, None, 0).text,
            "Error: model exploded"
        );

        let silent = AgentResponse {
            is_error: true,
            ..Default::default()
        };
        assert_eq!(
            finish_normal(&silent, None, 0).text,
            "Error: check logs for details."
        );
    }

    #[test]
    fn test_session_age_note_cadence() {
        let mut session = Session::new(1, "claude", "opus");
        session.created_at = (Utc::now() - chrono::Duration::hours(20)).to_rfc3339();

        session.active_mut().message_count = 20;
        assert!(session_age_note(&session, 12).contains("20h old"));

        // Not a 10th message: suppressed.
        session.active_mut().message_count = 21;
        assert!(session_age_note(&session, 12).is_empty());

        // Younger than the threshold: suppressed.
        session.created_at = (Utc::now() - chrono::Duration::hours(2)).to_rfc3339();
        session.active_mut().message_count = 20;
        assert!(session_age_note(&session, 12).is_empty());

        // Disabled threshold: suppressed.
        assert!(session_age_note(&session, 0).is_empty());
    }

    #[test]
    fn test_session_age_note_days_label() {
        let mut session = Session::new(1, "claude", "opus");
        session.created_at = (Utc::now() - chrono::Duration::hours(72)).to_rfc3339();
        session.active_mut().message_count = 10;
        assert!(session_age_note(&session, 12).contains("3d old"));
    }
}
