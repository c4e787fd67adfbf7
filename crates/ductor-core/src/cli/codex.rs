//! Async wrapper around the OpenAI Codex CLI.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

use crate::cli::claude::{communicate, spawn, Communicate, StreamOutcome, StreamSupervisor};
use crate::cli::codex_events::{parse_codex_jsonl, parse_codex_stream_event, CodexThinkingFilter};
use crate::cli::stream::{ResultEvent, StreamEvent, Usage};
use crate::cli::types::CliResponse;
use crate::cli::{docker_wrap, log_cmd, truncate_chars, CliConfig, EventStream, SendOptions};

/// Mutable accumulator for streaming session data.
#[derive(Default)]
struct StreamState {
    accumulated_text: Vec<String>,
    thread_id: Option<String>,
    usage: Option<Usage>,
}

impl StreamState {
    /// Update state from a single stream event.
    fn track(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::SystemInit {
                session_id: Some(sid),
            } => self.thread_id = Some(sid.clone()),
            StreamEvent::AssistantTextDelta { text } if !text.is_empty() => {
                self.accumulated_text.push(text.clone());
            }
            StreamEvent::Result(result) if result.usage != Usage::default() => {
                self.usage = Some(result.usage.clone());
            }
            _ => {}
        }
    }
}

/// Async wrapper around the OpenAI Codex CLI.
pub struct CodexCli {
    config: CliConfig,
    working_dir: PathBuf,
    cli: String,
}

impl CodexCli {
    pub fn new(config: CliConfig) -> Result<Self> {
        let working_dir = config
            .working_dir
            .canonicalize()
            .unwrap_or_else(|_| config.working_dir.clone());
        let cli = if config.docker_container.is_empty() {
            find_cli()?
        } else {
            "codex".to_string()
        };
        info!(cwd = %working_dir.display(), model = ?config.model, "Codex CLI wrapper");
        Ok(Self {
            config,
            working_dir,
            cli,
        })
    }

    /// Inject system context into the user prompt (Codex has no
    /// `--system-prompt` flag).
    fn compose_prompt(&self, prompt: &str) -> String {
        let cfg = &self.config;
        let mut parts: Vec<&str> = Vec::new();
        if let Some(sys) = cfg.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            parts.push(sys);
        }
        parts.push(prompt);
        if let Some(app) = cfg.append_system_prompt.as_deref().filter(|s| !s.is_empty()) {
            parts.push(app);
        }
        parts.join("\n\n")
    }

    /// Sandbox/approval flags derived from the permission mode.
    fn sandbox_flags(&self) -> Vec<String> {
        let cfg = &self.config;
        if cfg.permission_mode == "bypassPermissions" {
            return vec!["--dangerously-bypass-approvals-and-sandbox".into()];
        }
        match cfg.sandbox_mode.as_str() {
            "full-access" => vec!["--sandbox".into(), "danger-full-access".into()],
            "workspace-write" => vec!["--full-auto".into()],
            other => vec!["--sandbox".into(), other.into()],
        }
    }

    fn build_command(&self, prompt: &str, resume_session: Option<&str>) -> Vec<String> {
        let cfg = &self.config;
        let final_prompt = self.compose_prompt(prompt);

        // Resume uses a different argv shape: thread id precedes the prompt.
        if let Some(thread_id) = resume_session {
            let mut cmd = vec![self.cli.clone(), "exec".into(), "resume".into(), "--json".into()];
            cmd.extend(self.sandbox_flags());
            cmd.push("--".into());
            cmd.push(thread_id.to_string());
            cmd.push(final_prompt);
            return cmd;
        }

        let mut cmd = vec![
            self.cli.clone(),
            "exec".into(),
            "--json".into(),
            "--color".into(),
            "never".into(),
        ];
        cmd.extend(self.sandbox_flags());
        cmd.push("--skip-git-repo-check".into());

        if let Some(model) = cfg.model.as_deref().filter(|m| !m.is_empty()) {
            cmd.push("--model".into());
            cmd.push(model.into());
        }
        if !cfg.reasoning_effort.is_empty() && cfg.reasoning_effort != "default" {
            cmd.push("-c".into());
            cmd.push(format!("model_reasoning_effort={}", cfg.reasoning_effort));
        }
        if let Some(instructions) = cfg.instructions.as_deref().filter(|i| !i.is_empty()) {
            cmd.push("--instructions".into());
            cmd.push(instructions.into());
        }
        for img in &cfg.images {
            cmd.push("--image".into());
            cmd.push(img.clone());
        }
        cmd.extend(cfg.cli_parameters.iter().cloned());

        cmd.push("--".into());
        cmd.push(final_prompt);
        cmd
    }

    /// Send a prompt and return the final result.
    pub async fn send(&self, prompt: &str, opts: SendOptions) -> Result<CliResponse> {
        if opts.continue_session {
            debug!("continue_session is not supported by the Codex CLI, ignoring");
        }
        let cmd = self.build_command(prompt, opts.resume_session.as_deref());
        log_cmd("codex", &cmd, false);

        let (exec_cmd, cwd) = docker_wrap(
            cmd,
            &self.config.docker_container,
            self.config.chat_id,
            &self.working_dir,
        );
        let mut child = spawn(&exec_cmd, cwd.as_deref(), Stdio::null())?;
        info!(pid = ?child.id(), "Codex subprocess starting");

        let tracked = self
            .config
            .process_registry
            .as_ref()
            .map(|reg| reg.register(self.config.chat_id, child.id(), &self.config.process_label));
        let result = communicate(&mut child, opts.timeout).await;
        if let Some(tracked) = &tracked {
            tracked.mark_exited();
            if let Some(reg) = &self.config.process_registry {
                reg.unregister(tracked);
            }
        }

        match result {
            Communicate::TimedOut => {
                warn!("Codex CLI timed out");
                Ok(CliResponse {
                    is_error: true,
                    timed_out: true,
                    ..Default::default()
                })
            }
            Communicate::Done {
                stdout,
                stderr,
                returncode,
            } => Ok(parse_output(&stdout, &stderr, returncode)),
        }
    }

    /// Send a prompt and stream events as they arrive.
    ///
    /// The thinking filter drops assistant text that precedes a tool call;
    /// a final Result is always synthesized at end of stream so the caller
    /// gets thread id, accumulated text, and exit status even when Codex's
    /// own result frame is missing.
    pub async fn send_streaming(&self, prompt: &str, opts: SendOptions) -> Result<EventStream> {
        let cmd = self.build_command(prompt, opts.resume_session.as_deref());
        log_cmd("codex", &cmd, true);

        let (exec_cmd, cwd) = docker_wrap(
            cmd,
            &self.config.docker_container,
            self.config.chat_id,
            &self.working_dir,
        );
        let mut child = spawn(&exec_cmd, cwd.as_deref(), Stdio::null())?;
        info!(pid = ?child.id(), "Codex subprocess starting");

        let stdout = child
            .stdout
            .take()
            .context("subprocess created without stdout pipe")?;
        let stderr = child
            .stderr
            .take()
            .context("subprocess created without stderr pipe")?;

        let tracked = self
            .config
            .process_registry
            .as_ref()
            .map(|reg| reg.register(self.config.chat_id, child.id(), &self.config.process_label));
        let registry = self.config.process_registry.clone();
        let (tx, stream) = EventStream::channel();

        tokio::spawn(async move {
            let mut supervisor = StreamSupervisor::new(child, stderr, tracked, registry, tx);
            let state = std::sync::Arc::new(std::sync::Mutex::new(StreamState::default()));
            let loop_state = std::sync::Arc::clone(&state);

            let read = supervisor.with_timeout(opts.timeout, |tx| async move {
                let mut reader = BufReader::new(stdout);
                let mut filter = CodexThinkingFilter::new();
                let mut buf = Vec::new();
                loop {
                    buf.clear();
                    let n = match reader.read_until(b'\n', &mut buf).await {
                        Ok(n) => n,
                        Err(err) => {
                            warn!(%err, "Codex stream read error");
                            break;
                        }
                    };
                    if n == 0 {
                        break;
                    }
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end();
                    if line.is_empty() {
                        continue;
                    }
                    debug!(line = truncate_chars(line, 120), "Stream line");
                    for raw_event in parse_codex_stream_event(line) {
                        for event in filter.process(raw_event) {
                            loop_state.lock().expect("state lock").track(&event);
                            if tx.send(event).await.is_err() {
                                return (false, true);
                            }
                        }
                    }
                }
                for event in filter.flush() {
                    loop_state.lock().expect("state lock").track(&event);
                    if tx.send(event).await.is_err() {
                        return (false, true);
                    }
                }
                (false, false)
            });

            match read.await {
                StreamOutcome::TimedOut | StreamOutcome::ConsumerGone => return,
                StreamOutcome::Completed(_) => {}
            }

            let (stderr_text, returncode) = supervisor.finish().await;
            let state = std::sync::Mutex::into_inner(
                std::sync::Arc::try_unwrap(state).unwrap_or_default(),
            )
            .unwrap_or_default();
            supervisor
                .send_final(final_result(state, stderr_text, returncode))
                .await;
        });

        Ok(stream)
    }
}

/// Build the final ResultEvent after the stream loop completes.
fn final_result(state: StreamState, stderr_text: String, returncode: Option<i32>) -> ResultEvent {
    let accumulated = state.accumulated_text.join("\n");
    if returncode != Some(0) {
        let error_detail = if !stderr_text.is_empty() {
            stderr_text
        } else if !accumulated.is_empty() {
            accumulated
        } else {
            "(no output)".to_string()
        };
        error!(
            returncode = ?returncode,
            detail = truncate_chars(&error_detail, 300),
            "Codex stream exited non-zero"
        );
        return ResultEvent {
            result: truncate_chars(&error_detail, 500).to_string(),
            is_error: true,
            returncode,
            ..Default::default()
        };
    }

    ResultEvent {
        session_id: state.thread_id,
        result: accumulated,
        is_error: false,
        returncode,
        usage: state.usage.unwrap_or_default(),
        ..Default::default()
    }
}

fn find_cli() -> Result<String> {
    which::which("codex")
        .map(|p| p.to_string_lossy().into_owned())
        .context("codex CLI not found on PATH. Install via: npm install -g @openai/codex")
}

/// Parse Codex subprocess output into a CliResponse.
fn parse_output(stdout: &[u8], stderr: &[u8], returncode: Option<i32>) -> CliResponse {
    let stderr_text = truncate_chars(&String::from_utf8_lossy(stderr), 2000).to_string();
    if !stderr_text.is_empty() {
        warn!(
            returncode = ?returncode,
            stderr = truncate_chars(&stderr_text, 500),
            "Codex stderr"
        );
    }

    let raw = String::from_utf8_lossy(stdout).trim().to_string();
    if raw.is_empty() {
        error!(returncode = ?returncode, "Codex returned empty output");
        return CliResponse {
            is_error: true,
            returncode,
            stderr: stderr_text,
            ..Default::default()
        };
    }

    let exit_error = returncode != Some(0);
    let (result_text, thread_id, usage) = parse_codex_jsonl(&raw);
    let response = CliResponse {
        session_id: thread_id,
        is_error: exit_error || result_text.is_empty(),
        result: if result_text.is_empty() { raw } else { result_text },
        returncode,
        stderr: stderr_text,
        usage: usage.unwrap_or_default(),
        ..Default::default()
    };

    if response.is_error {
        error!(
            returncode = ?returncode,
            result = truncate_chars(&response.result, 300),
            "Codex error"
        );
    } else {
        info!(
            session = truncate_chars(response.session_id.as_deref().unwrap_or("?"), 8),
            tokens = response.total_tokens(),
            "Codex done"
        );
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CliConfig {
        CliConfig {
            provider: "codex".into(),
            docker_container: "test-container".into(),
            model: Some("gpt-5.2-codex".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_compose_prompt_order() {
        let mut cfg = config();
        cfg.system_prompt = Some("SYS".into());
        cfg.append_system_prompt = Some("APPEND".into());
        let cli = CodexCli::new(cfg).unwrap();
        assert_eq!(cli.compose_prompt("USER"), "SYS\n\nUSER\n\nAPPEND");
    }

    #[test]
    fn test_build_command_fresh() {
        let cli = CodexCli::new(config()).unwrap();
        let cmd = cli.build_command("go", None);
        assert_eq!(&cmd[..5], &["codex", "exec", "--json", "--color", "never"]);
        assert!(cmd.contains(&"--dangerously-bypass-approvals-and-sandbox".to_string()));
        assert!(cmd.contains(&"--skip-git-repo-check".to_string()));
        let idx = cmd.iter().position(|c| c == "--model").unwrap();
        assert_eq!(cmd[idx + 1], "gpt-5.2-codex");
        // Default reasoning effort is forwarded.
        let idx = cmd.iter().position(|c| c == "-c").unwrap();
        assert_eq!(cmd[idx + 1], "model_reasoning_effort=medium");
        assert_eq!(cmd[cmd.len() - 2], "--");
        assert_eq!(cmd[cmd.len() - 1], "go");
    }

    #[test]
    fn test_build_command_resume_shape() {
        let cli = CodexCli::new(config()).unwrap();
        let cmd = cli.build_command("follow up", Some("thread-7"));
        assert_eq!(&cmd[..4], &["codex", "exec", "resume", "--json"]);
        // Thread id precedes the prompt after the separator.
        let sep = cmd.iter().position(|c| c == "--").unwrap();
        assert_eq!(cmd[sep + 1], "thread-7");
        assert_eq!(cmd[sep + 2], "follow up");
        assert!(!cmd.contains(&"--skip-git-repo-check".to_string()));
    }

    #[test]
    fn test_sandbox_flags_by_mode() {
        let mut cfg = config();
        cfg.permission_mode = "default".into();
        cfg.sandbox_mode = "workspace-write".into();
        let cli = CodexCli::new(cfg).unwrap();
        assert_eq!(cli.sandbox_flags(), vec!["--full-auto".to_string()]);

        let mut cfg = config();
        cfg.permission_mode = "default".into();
        cfg.sandbox_mode = "read-only".into();
        let cli = CodexCli::new(cfg).unwrap();
        assert_eq!(
            cli.sandbox_flags(),
            vec!["--sandbox".to_string(), "read-only".to_string()]
        );
    }

    #[test]
    fn test_parse_output_success() {
        let stdout = concat!(
            r#"{"type":"thread.started","thread_id":"th-1"}"#,
            "\n",
            r#"{"type":"item.completed","item":{"type":"agent_message","text":"done"}}"#,
            "\n",
            r#"{"type":"turn.completed","usage":{"input_tokens":5,"output_tokens":2}}"#,
        );
        let resp = parse_output(stdout.as_bytes(), b"", Some(0));
        assert!(!resp.is_error);
        assert_eq!(resp.session_id.as_deref(), Some("th-1"));
        assert_eq!(resp.result, "done");
        assert_eq!(resp.total_tokens(), 7);
    }

    #[test]
    fn test_parse_output_nonzero_exit_is_error() {
        let stdout = r#"{"type":"item.completed","item":{"type":"agent_message","text":"partial"}}"#;
        let resp = parse_output(stdout.as_bytes(), b"crash", Some(1));
        assert!(resp.is_error);
        assert_eq!(resp.result, "partial");
    }

    #[test]
    fn test_final_result_error_prefers_stderr() {
        let state = StreamState {
            accumulated_text: vec!["text".into()],
            thread_id: Some("t".into()),
            usage: None,
        };
        let result = final_result(state, "stderr says no".into(), Some(2));
        assert!(result.is_error);
        assert_eq!(result.result, "stderr says no");
        assert_eq!(result.returncode, Some(2));
    }

    #[test]
    fn test_final_result_no_output_placeholder() {
        let result = final_result(StreamState::default(), String::new(), Some(1));
        assert_eq!(result.result, "(no output)");
    }

    #[test]
    fn test_final_result_success_carries_state() {
        let state = StreamState {
            accumulated_text: vec!["a".into(), "b".into()],
            thread_id: Some("th-3".into()),
            usage: Some(Usage {
                input_tokens: 9,
                output_tokens: 4,
                cached_tokens: 0,
            }),
        };
        let result = final_result(state, String::new(), Some(0));
        assert!(!result.is_error);
        assert_eq!(result.result, "a\nb");
        assert_eq!(result.session_id.as_deref(), Some("th-3"));
        assert_eq!(result.usage.output_tokens, 4);
    }
}
