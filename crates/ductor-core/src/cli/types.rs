//! Shared types for the CLI layer.

use crate::cli::stream::Usage;

/// Immutable specification for a CLI call.
#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub append_system_prompt: Option<String>,
    pub model_override: Option<String>,
    pub provider_override: Option<String>,
    pub chat_id: i64,
    pub process_label: String,
    pub resume_session: Option<String>,
    pub continue_session: bool,
    pub timeout_seconds: Option<f64>,
}

/// Immutable result from a CLI call.
#[derive(Debug, Clone, Default)]
pub struct AgentResponse {
    pub result: String,
    pub returncode: Option<i32>,
    pub session_id: Option<String>,
    pub is_error: bool,
    pub cost_usd: f64,
    pub total_tokens: u64,
    pub input_tokens: u64,
    pub timed_out: bool,
    pub duration_ms: Option<f64>,
    pub stream_fallback: bool,
}

impl AgentResponse {
    /// An empty, non-error response (used for abort suppression).
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Response from a CLI subprocess -- provider-agnostic.
#[derive(Debug, Clone, Default)]
pub struct CliResponse {
    pub session_id: Option<String>,
    pub result: String,
    pub is_error: bool,
    pub returncode: Option<i32>,
    pub stderr: String,
    pub timed_out: bool,
    pub duration_ms: Option<f64>,
    pub duration_api_ms: Option<f64>,
    pub num_turns: Option<u32>,
    pub total_cost_usd: Option<f64>,
    pub usage: Usage,
}

impl CliResponse {
    /// Total input tokens (includes cache reads/writes).
    pub fn input_tokens(&self) -> u64 {
        self.usage.input_tokens
    }

    /// Total output tokens.
    pub fn output_tokens(&self) -> u64 {
        self.usage.output_tokens
    }

    /// Combined input + output tokens for context tracking.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens() + self.output_tokens()
    }
}

impl From<CliResponse> for AgentResponse {
    fn from(resp: CliResponse) -> Self {
        AgentResponse {
            result: resp.result.clone(),
            returncode: resp.returncode,
            session_id: resp.session_id.clone(),
            is_error: resp.is_error,
            cost_usd: resp.total_cost_usd.unwrap_or(0.0),
            total_tokens: resp.total_tokens(),
            input_tokens: resp.input_tokens(),
            timed_out: resp.timed_out,
            duration_ms: resp.duration_ms,
            stream_fallback: false,
        }
    }
}
