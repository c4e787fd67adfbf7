//! Async wrapper around the Claude Code CLI.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, error, info, warn};

use crate::cli::process_registry::TrackedProcess;
use crate::cli::stream::{parse_claude_result, parse_claude_stream_line, ResultEvent, StreamEvent};
use crate::cli::types::CliResponse;
use crate::cli::{
    docker_wrap, exit_code, log_cmd, truncate_chars, CliConfig, EventStream, SendOptions,
};

/// Async wrapper around the Claude Code CLI.
pub struct ClaudeCodeCli {
    config: CliConfig,
    working_dir: PathBuf,
    cli: String,
}

impl ClaudeCodeCli {
    pub fn new(config: CliConfig) -> Result<Self> {
        let working_dir = config
            .working_dir
            .canonicalize()
            .unwrap_or_else(|_| config.working_dir.clone());
        let cli = if config.docker_container.is_empty() {
            find_cli()?
        } else {
            "claude".to_string()
        };
        info!(cwd = %working_dir.display(), model = ?config.model, "CLI wrapper");
        Ok(Self {
            config,
            working_dir,
            cli,
        })
    }

    fn build_command(&self, prompt: &str, opts: &SendOptions) -> Vec<String> {
        let cfg = &self.config;
        let mut cmd = vec![
            self.cli.clone(),
            "-p".into(),
            "--output-format".into(),
            "json".into(),
        ];

        add_opt(&mut cmd, "--permission-mode", Some(&cfg.permission_mode));
        add_opt(&mut cmd, "--model", cfg.model.as_deref());
        add_opt(&mut cmd, "--system-prompt", cfg.system_prompt.as_deref());
        add_opt(
            &mut cmd,
            "--append-system-prompt",
            cfg.append_system_prompt.as_deref(),
        );
        add_opt(
            &mut cmd,
            "--max-turns",
            cfg.max_turns.map(|n| n.to_string()).as_deref(),
        );
        add_opt(
            &mut cmd,
            "--max-budget-usd",
            cfg.max_budget_usd.map(|b| b.to_string()).as_deref(),
        );

        if !cfg.allowed_tools.is_empty() {
            cmd.push("--allowedTools".into());
            cmd.extend(cfg.allowed_tools.iter().cloned());
        }
        if !cfg.disallowed_tools.is_empty() {
            cmd.push("--disallowedTools".into());
            cmd.extend(cfg.disallowed_tools.iter().cloned());
        }

        if let Some(sid) = &opts.resume_session {
            cmd.push("--resume".into());
            cmd.push(sid.clone());
        } else if opts.continue_session {
            cmd.push("--continue".into());
        }

        cmd.extend(cfg.cli_parameters.iter().cloned());

        cmd.push("--".into());
        cmd.push(prompt.to_string());
        cmd
    }

    /// Build the streaming variant: `stream-json` format plus `--verbose`.
    fn build_command_streaming(&self, prompt: &str, opts: &SendOptions) -> Vec<String> {
        let mut cmd = self.build_command(prompt, opts);
        if let Some(idx) = cmd.iter().position(|c| c == "json") {
            cmd[idx] = "stream-json".into();
        }
        if !cmd.iter().any(|c| c == "--verbose") {
            cmd.insert(1, "--verbose".into());
        }
        cmd
    }

    /// Send a prompt and return the final result.
    pub async fn send(&self, prompt: &str, opts: SendOptions) -> Result<CliResponse> {
        let cmd = self.build_command(prompt, &opts);
        log_cmd("claude", &cmd, false);

        let (exec_cmd, cwd) = docker_wrap(
            cmd,
            &self.config.docker_container,
            self.config.chat_id,
            &self.working_dir,
        );
        let mut child = spawn(&exec_cmd, cwd.as_deref(), Stdio::null())?;
        info!(pid = ?child.id(), "CLI subprocess starting");

        let tracked = self.register(&child);
        let result = communicate(&mut child, opts.timeout).await;
        if let Some(tracked) = &tracked {
            tracked.mark_exited();
            if let Some(reg) = &self.config.process_registry {
                reg.unregister(tracked);
            }
        }

        match result {
            Communicate::TimedOut => {
                warn!("CLI timed out");
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
            } => Ok(parse_response(&stdout, &stderr, returncode)),
        }
    }

    /// Send a prompt and stream events as they arrive.
    pub async fn send_streaming(&self, prompt: &str, opts: SendOptions) -> Result<EventStream> {
        let cmd = self.build_command_streaming(prompt, &opts);
        log_cmd("claude", &cmd, true);

        let (exec_cmd, cwd) = docker_wrap(
            cmd,
            &self.config.docker_container,
            self.config.chat_id,
            &self.working_dir,
        );
        let mut child = spawn(&exec_cmd, cwd.as_deref(), Stdio::null())?;
        info!(pid = ?child.id(), "CLI subprocess starting");

        let stdout = child
            .stdout
            .take()
            .context("subprocess created without stdout pipe")?;
        let stderr = child
            .stderr
            .take()
            .context("subprocess created without stderr pipe")?;

        let tracked = self.register(&child);
        let registry = self.config.process_registry.clone();
        let (tx, stream) = EventStream::channel();

        tokio::spawn(async move {
            let mut supervisor =
                StreamSupervisor::new(child, stderr, tracked, registry, tx);

            let read = supervisor.with_timeout(opts.timeout, |tx| async move {
                let mut reader = BufReader::new(stdout);
                let mut buf = Vec::new();
                loop {
                    buf.clear();
                    let n = match reader.read_until(b'\n', &mut buf).await {
                        Ok(n) => n,
                        Err(err) => {
                            warn!(%err, "CLI stream read error");
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
                    for event in parse_claude_stream_line(line) {
                        let is_result = matches!(event, StreamEvent::Result(_));
                        if tx.send(event).await.is_err() {
                            return (false, true);
                        }
                        if is_result {
                            return (true, false);
                        }
                    }
                }
                (false, false)
            });

            let yielded_result = match read.await {
                StreamOutcome::TimedOut | StreamOutcome::ConsumerGone => return,
                StreamOutcome::Completed(result_seen) => result_seen,
            };

            let (stderr_text, returncode) = supervisor.finish().await;
            if returncode != Some(0) && !yielded_result {
                warn!(
                    returncode = ?returncode,
                    stderr = truncate_chars(&stderr_text, 200),
                    "CLI stream exited non-zero"
                );
                supervisor
                    .send_final(ResultEvent {
                        result: truncate_chars(&stderr_text, 500).to_string(),
                        is_error: true,
                        returncode,
                        ..Default::default()
                    })
                    .await;
            }
        });

        Ok(stream)
    }

    fn register(&self, child: &Child) -> Option<std::sync::Arc<TrackedProcess>> {
        self.config
            .process_registry
            .as_ref()
            .map(|reg| reg.register(self.config.chat_id, child.id(), &self.config.process_label))
    }
}

// ── Shared subprocess plumbing (used by all three adapters) ──────────

fn find_cli() -> Result<String> {
    which::which("claude")
        .map(|p| p.to_string_lossy().into_owned())
        .context("claude CLI not found on PATH. Install via: npm install -g @anthropic-ai/claude-code")
}

pub(crate) fn spawn(cmd: &[String], cwd: Option<&std::path::Path>, stdin: Stdio) -> Result<Child> {
    spawn_with_env(cmd, cwd, stdin, &[])
}

pub(crate) fn spawn_with_env(
    cmd: &[String],
    cwd: Option<&std::path::Path>,
    stdin: Stdio,
    envs: &[(&str, String)],
) -> Result<Child> {
    let mut command = Command::new(&cmd[0]);
    command
        .args(&cmd[1..])
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in envs {
        command.env(key, value);
    }
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    command
        .spawn()
        .with_context(|| format!("failed to spawn {}", cmd[0]))
}

fn add_opt(cmd: &mut Vec<String>, flag: &str, value: Option<&str>) {
    if let Some(value) = value {
        if !value.is_empty() {
            cmd.push(flag.into());
            cmd.push(value.into());
        }
    }
}

pub(crate) enum Communicate {
    TimedOut,
    Done {
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        returncode: Option<i32>,
    },
}

/// Read both pipes to completion and wait for exit, honoring a timeout.
///
/// On expiry the child is force-killed and reaped before returning.
pub(crate) async fn communicate(child: &mut Child, timeout: Option<Duration>) -> Communicate {
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let io = async {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut stdout).await;
        }
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut stderr).await;
        }
        (stdout, stderr)
    };

    let combined = async {
        let (stdout, stderr) = io.await;
        let status = child.wait().await.ok();
        (stdout, stderr, status)
    };

    let result = match timeout {
        Some(t) => tokio::time::timeout(t, combined).await,
        None => Ok(combined.await),
    };

    match result {
        Ok((stdout, stderr, status)) => Communicate::Done {
            stdout,
            stderr,
            returncode: status.and_then(exit_code),
        },
        Err(_) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            Communicate::TimedOut
        }
    }
}

pub(crate) enum StreamOutcome {
    TimedOut,
    ConsumerGone,
    Completed(bool),
}

/// Owns the child, stderr drain, and registry bookkeeping for a streaming
/// producer task. All exit paths kill/reap/unregister exactly once.
pub(crate) struct StreamSupervisor {
    child: Child,
    stderr_drain: tokio::task::JoinHandle<Vec<u8>>,
    tracked: Option<std::sync::Arc<TrackedProcess>>,
    registry: Option<std::sync::Arc<crate::cli::process_registry::ProcessRegistry>>,
    tx: Option<tokio::sync::mpsc::Sender<StreamEvent>>,
    finished: bool,
}

impl StreamSupervisor {
    pub(crate) fn new(
        child: Child,
        mut stderr: ChildStderr,
        tracked: Option<std::sync::Arc<TrackedProcess>>,
        registry: Option<std::sync::Arc<crate::cli::process_registry::ProcessRegistry>>,
        tx: tokio::sync::mpsc::Sender<StreamEvent>,
    ) -> Self {
        let stderr_drain = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        });
        Self {
            child,
            stderr_drain,
            tracked,
            registry,
            tx: Some(tx),
            finished: false,
        }
    }

    /// Run the read loop with an optional timeout.
    ///
    /// The closure returns `(result_seen, consumer_gone)`. On timeout the
    /// child is killed and a timed-out error Result is emitted; on consumer
    /// drop the child is killed silently.
    pub(crate) async fn with_timeout<F, Fut>(
        &mut self,
        timeout: Option<Duration>,
        read_loop: F,
    ) -> StreamOutcome
    where
        F: FnOnce(tokio::sync::mpsc::Sender<StreamEvent>) -> Fut,
        Fut: std::future::Future<Output = (bool, bool)>,
    {
        let tx = self.tx.clone().expect("stream sender present");
        let fut = read_loop(tx);
        let outcome = match timeout {
            Some(t) => tokio::time::timeout(t, fut).await,
            None => Ok(fut.await),
        };
        match outcome {
            Err(_) => {
                let _ = self.child.kill().await;
                warn!("CLI stream timed out");
                self.teardown().await;
                self.send_final(ResultEvent::error("")).await;
                StreamOutcome::TimedOut
            }
            Ok((_, true)) => {
                let _ = self.child.kill().await;
                self.teardown().await;
                StreamOutcome::ConsumerGone
            }
            Ok((result_seen, false)) => StreamOutcome::Completed(result_seen),
        }
    }

    /// Drain stderr, reap the child, and unregister. Returns
    /// `(stderr_text, returncode)`.
    pub(crate) async fn finish(&mut self) -> (String, Option<i32>) {
        let status = self.child.wait().await.ok();
        let stderr_bytes = (&mut self.stderr_drain).await.unwrap_or_default();
        self.mark_done();
        let stderr_text =
            truncate_chars(&String::from_utf8_lossy(&stderr_bytes), 2000).to_string();
        (stderr_text, status.and_then(exit_code))
    }

    pub(crate) async fn send_final(&mut self, result: ResultEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(StreamEvent::Result(result)).await;
        }
    }

    async fn teardown(&mut self) {
        let _ = self.child.wait().await;
        self.stderr_drain.abort();
        self.mark_done();
    }

    fn mark_done(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(tracked) = &self.tracked {
            tracked.mark_exited();
            if let Some(registry) = &self.registry {
                registry.unregister(tracked);
            }
        }
    }
}

/// Parse the single JSON document of a non-streaming Claude call.
fn parse_response(stdout: &[u8], stderr: &[u8], returncode: Option<i32>) -> CliResponse {
    let stderr_text = truncate_chars(&String::from_utf8_lossy(stderr), 2000).to_string();
    if !stderr_text.is_empty() {
        warn!(stderr = truncate_chars(&stderr_text, 500), "CLI stderr");
    }

    let raw = String::from_utf8_lossy(stdout).trim().to_string();
    if raw.is_empty() {
        error!(returncode = ?returncode, "CLI returned empty output");
        return CliResponse {
            is_error: true,
            returncode,
            stderr: stderr_text,
            ..Default::default()
        };
    }

    let data: Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(err) => {
            error!(%err, raw = truncate_chars(&raw, 500), "Failed to parse CLI JSON");
            return CliResponse {
                result: raw,
                is_error: true,
                returncode,
                stderr: stderr_text,
                ..Default::default()
            };
        }
    };

    let parsed = parse_claude_result(&data);
    let response = CliResponse {
        session_id: parsed.session_id,
        result: parsed.result,
        is_error: parsed.is_error,
        returncode,
        stderr: stderr_text,
        timed_out: false,
        duration_ms: parsed.duration_ms,
        duration_api_ms: parsed.duration_api_ms,
        num_turns: parsed.num_turns,
        total_cost_usd: parsed.total_cost_usd,
        usage: parsed.usage,
    };

    if response.is_error {
        error!(result = truncate_chars(&response.result, 200), "CLI error");
    } else {
        info!(
            session = truncate_chars(response.session_id.as_deref().unwrap_or("?"), 8),
            turns = ?response.num_turns,
            cost = response.total_cost_usd.unwrap_or(0.0),
            tokens = response.total_tokens(),
            "CLI done"
        );
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CliConfig {
        CliConfig {
            docker_container: "test-container".into(),
            model: Some("opus".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_command_basic_shape() {
        let cli = ClaudeCodeCli::new(config()).unwrap();
        let cmd = cli.build_command("hello world", &SendOptions::default());
        assert_eq!(&cmd[..4], &["claude", "-p", "--output-format", "json"]);
        // Prompt is the final positional, preceded by `--`.
        assert_eq!(cmd[cmd.len() - 2], "--");
        assert_eq!(cmd[cmd.len() - 1], "hello world");
        assert!(cmd.contains(&"--model".to_string()));
        assert!(cmd.contains(&"--permission-mode".to_string()));
    }

    #[test]
    fn test_build_command_resume_vs_continue() {
        let cli = ClaudeCodeCli::new(config()).unwrap();

        let resume = cli.build_command(
            "x",
            &SendOptions {
                resume_session: Some("sid-1".into()),
                ..Default::default()
            },
        );
        let idx = resume.iter().position(|c| c == "--resume").unwrap();
        assert_eq!(resume[idx + 1], "sid-1");
        assert!(!resume.contains(&"--continue".to_string()));

        let cont = cli.build_command(
            "x",
            &SendOptions {
                continue_session: true,
                ..Default::default()
            },
        );
        assert!(cont.contains(&"--continue".to_string()));
        assert!(!cont.contains(&"--resume".to_string()));
    }

    #[test]
    fn test_streaming_command_swaps_format_and_adds_verbose() {
        let cli = ClaudeCodeCli::new(config()).unwrap();
        let cmd = cli.build_command_streaming("x", &SendOptions::default());
        assert!(cmd.contains(&"stream-json".to_string()));
        assert!(!cmd.contains(&"json".to_string()));
        assert_eq!(cmd[1], "--verbose");
    }

    #[test]
    fn test_parse_response_success() {
        let stdout = br#"{"type":"result","session_id":"s1","result":"Hi!","is_error":false,
            "total_cost_usd":0.01,"usage":{"input_tokens":400,"output_tokens":100}}"#;
        let resp = parse_response(stdout, b"", Some(0));
        assert!(!resp.is_error);
        assert_eq!(resp.session_id.as_deref(), Some("s1"));
        assert_eq!(resp.result, "Hi!");
        assert_eq!(resp.total_tokens(), 500);
    }

    #[test]
    fn test_parse_response_empty_output() {
        let resp = parse_response(b"", b"boom", Some(1));
        assert!(resp.is_error);
        assert_eq!(resp.returncode, Some(1));
        assert_eq!(resp.stderr, "boom");
    }

    #[test]
    fn test_parse_response_invalid_json_keeps_raw() {
        let resp = parse_response(b"not json", b"", Some(0));
        assert!(resp.is_error);
        assert_eq!(resp.result, "not json");
    }
}
