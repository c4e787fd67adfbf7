//! The agent execution kernel: provider adapters, stream parsing, process
//! supervision, and the unified CLI service.
//!
//! - [`types`] — request/response carriers across the kernel boundary
//! - [`stream`] — normalized stream events + Claude NDJSON parser
//! - [`codex_events`] / [`gemini_events`] — per-provider line parsers
//! - [`process_registry`] — live subprocess tracking and graceful kill
//! - [`claude`] / [`codex`] / [`gemini`] — subprocess adapters
//! - [`service`] — the single gateway for every agent invocation
//! - [`param_resolver`] — cron/webhook execution parameter merging
//! - [`codex_cache`] — discovered Codex model catalog

pub mod claude;
pub mod codex;
pub mod codex_cache;
pub mod codex_events;
pub mod gemini;
pub mod gemini_events;
pub mod param_resolver;
pub mod process_registry;
pub mod service;
pub mod stream;
pub mod types;

use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cli::claude::ClaudeCodeCli;
use crate::cli::codex::CodexCli;
use crate::cli::gemini::GeminiCli;
use crate::cli::process_registry::ProcessRegistry;
use crate::cli::stream::StreamEvent;
use crate::cli::types::CliResponse;

/// Channel depth between a stream producer task and its consumer.
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Configuration for any CLI adapter.
#[derive(Clone)]
pub struct CliConfig {
    pub provider: String,
    pub working_dir: PathBuf,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub append_system_prompt: Option<String>,
    pub max_turns: Option<u32>,
    pub max_budget_usd: Option<f64>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub permission_mode: String,
    pub docker_container: String,
    // Codex-specific fields (ignored by the Claude adapter):
    pub sandbox_mode: String,
    pub images: Vec<String>,
    pub instructions: Option<String>,
    pub reasoning_effort: String,
    pub cli_parameters: Vec<String>,
    // Process tracking (shared across providers):
    pub process_registry: Option<Arc<ProcessRegistry>>,
    pub chat_id: i64,
    pub process_label: String,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            provider: "claude".into(),
            working_dir: PathBuf::from("."),
            model: None,
            system_prompt: None,
            append_system_prompt: None,
            max_turns: None,
            max_budget_usd: None,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            permission_mode: "bypassPermissions".into(),
            docker_container: String::new(),
            sandbox_mode: "read-only".into(),
            images: Vec::new(),
            instructions: None,
            reasoning_effort: "medium".into(),
            cli_parameters: Vec::new(),
            process_registry: None,
            chat_id: 0,
            process_label: "main".into(),
        }
    }
}

/// Per-call options shared by `send` and `send_streaming`.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub resume_session: Option<String>,
    pub continue_session: bool,
    pub timeout: Option<Duration>,
}

impl SendOptions {
    pub fn timeout_from_seconds(seconds: Option<f64>) -> Option<Duration> {
        seconds.map(Duration::from_secs_f64)
    }
}

/// Wrap a CLI command for Docker execution if a container is set.
///
/// Returns the (possibly rewritten) argv and the working directory to use;
/// under Docker the working directory is `None` so the container picks it.
pub fn docker_wrap(
    cmd: Vec<String>,
    docker_container: &str,
    chat_id: i64,
    working_dir: &PathBuf,
) -> (Vec<String>, Option<PathBuf>) {
    if docker_container.is_empty() {
        return (cmd, Some(working_dir.clone()));
    }
    debug!(container = docker_container, "docker_wrap");
    let mut wrapped = vec![
        "docker".to_string(),
        "exec".to_string(),
        "-e".to_string(),
        format!("DUCTOR_CHAT_ID={chat_id}"),
        docker_container.to_string(),
    ];
    wrapped.extend(cmd);
    (wrapped, None)
}

/// Exit code with Unix signal convention: signalled children map to
/// `-(signal)`, so a SIGKILLed process reports `-9`.
#[cfg(unix)]
pub fn exit_code(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal().map(|s| -s))
}

#[cfg(not(unix))]
pub fn exit_code(status: ExitStatus) -> Option<i32> {
    status.code()
}

/// Truncate to at most `max` characters on a char boundary.
pub(crate) fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Log a CLI command with long values truncated.
pub(crate) fn log_cmd(provider: &str, cmd: &[String], streaming: bool) {
    let safe: Vec<&str> = cmd.iter().map(|c| truncate_chars(c, 80)).collect();
    info!(
        provider,
        streaming,
        cmd = %safe.join(" "),
        "CLI cmd"
    );
}

/// A live stream of [`StreamEvent`]s from a provider subprocess.
///
/// Produced by a background task that owns the child process; dropping the
/// stream closes the channel, which the producer detects and answers by
/// force-killing the subprocess, draining stderr, and unregistering.
pub struct EventStream {
    rx: mpsc::Receiver<StreamEvent>,
}

impl EventStream {
    pub(crate) fn channel() -> (mpsc::Sender<StreamEvent>, EventStream) {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        (tx, EventStream { rx })
    }

    /// Next event, or `None` at end of stream.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }
}

/// The three supported provider adapters behind one capability set.
pub enum ProviderCli {
    Claude(ClaudeCodeCli),
    Codex(CodexCli),
    Gemini(GeminiCli),
}

impl ProviderCli {
    /// Send a prompt and return the final result (non-streaming).
    pub async fn send(&self, prompt: &str, opts: SendOptions) -> Result<CliResponse> {
        match self {
            ProviderCli::Claude(cli) => cli.send(prompt, opts).await,
            ProviderCli::Codex(cli) => cli.send(prompt, opts).await,
            ProviderCli::Gemini(cli) => cli.send(prompt, opts).await,
        }
    }

    /// Send a prompt and stream normalized events as they arrive.
    pub async fn send_streaming(&self, prompt: &str, opts: SendOptions) -> Result<EventStream> {
        match self {
            ProviderCli::Claude(cli) => cli.send_streaming(prompt, opts).await,
            ProviderCli::Codex(cli) => cli.send_streaming(prompt, opts).await,
            ProviderCli::Gemini(cli) => cli.send_streaming(prompt, opts).await,
        }
    }
}

/// Create a CLI adapter based on `config.provider`.
pub fn create_cli(config: CliConfig) -> Result<ProviderCli> {
    debug!(provider = %config.provider, "CLI factory creating provider");
    match config.provider.as_str() {
        "codex" => Ok(ProviderCli::Codex(CodexCli::new(config)?)),
        "gemini" => Ok(ProviderCli::Gemini(GeminiCli::new(config)?)),
        _ => Ok(ProviderCli::Claude(ClaudeCodeCli::new(config)?)),
    }
}
