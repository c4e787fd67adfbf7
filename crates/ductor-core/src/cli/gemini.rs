//! Async wrapper around the Google Gemini CLI.
//!
//! Gemini differs from the other adapters in three ways: the prompt is
//! delivered on stdin, system prompts travel via a temporary markdown file
//! referenced by `GEMINI_SYSTEM_MD`, and the workspace must be marked
//! trusted in `~/.gemini/trustedFolders.json` before the first spawn.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::cli::claude::{communicate, spawn_with_env, Communicate, StreamOutcome, StreamSupervisor};
use crate::cli::gemini_events::parse_gemini_stream_line;
use crate::cli::stream::{ResultEvent, StreamEvent, Usage};
use crate::cli::types::CliResponse;
use crate::cli::{docker_wrap, log_cmd, truncate_chars, CliConfig, EventStream, SendOptions};

const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(300);

/// Async wrapper around the Google Gemini CLI.
pub struct GeminiCli {
    config: CliConfig,
    working_dir: PathBuf,
    cli: String,
}

impl GeminiCli {
    pub fn new(config: CliConfig) -> Result<Self> {
        let working_dir = config
            .working_dir
            .canonicalize()
            .unwrap_or_else(|_| config.working_dir.clone());
        let cli = if config.docker_container.is_empty() {
            find_cli()?
        } else {
            "gemini".to_string()
        };
        info!(cwd = %working_dir.display(), model = ?config.model, "Gemini CLI wrapper");
        let adapter = Self {
            config,
            working_dir,
            cli,
        };
        adapter.trust_workspace();
        Ok(adapter)
    }

    /// Upsert the workspace path into `~/.gemini/trustedFolders.json`.
    fn trust_workspace(&self) {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        let gemini_home = home.join(".gemini");
        let trust_file = gemini_home.join("trustedFolders.json");
        let workspace_path = self.working_dir.to_string_lossy().into_owned();

        let mut data: serde_json::Map<String, Value> = match std::fs::read_to_string(&trust_file) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(Value::Object(map)) => map,
                _ => {
                    warn!("Corrupt Gemini trust file, starting fresh");
                    serde_json::Map::new()
                }
            },
            Err(_) => serde_json::Map::new(),
        };

        if data.contains_key(&workspace_path) {
            return;
        }
        data.insert(workspace_path.clone(), Value::String("TRUST_FOLDER".into()));
        let write = std::fs::create_dir_all(&gemini_home).and_then(|_| {
            std::fs::write(
                &trust_file,
                serde_json::to_string_pretty(&Value::Object(data)).unwrap_or_default(),
            )
        });
        match write {
            Ok(()) => info!(workspace = %workspace_path, "Trusted workspace in Gemini CLI"),
            Err(err) => warn!(%err, "Failed to update Gemini trusted folders"),
        }
    }

    fn build_command(&self, opts: &SendOptions, streaming: bool) -> Vec<String> {
        let cfg = &self.config;
        let mut cmd = vec![
            self.cli.clone(),
            "--output-format".into(),
            if streaming { "stream-json" } else { "json" }.into(),
            "--include-directories".into(),
            ".".into(),
        ];

        if let Some(model) = cfg.model.as_deref().filter(|m| !m.is_empty()) {
            cmd.push("--model".into());
            cmd.push(model.into());
        }
        if cfg.permission_mode == "bypassPermissions" {
            cmd.push("--approval-mode".into());
            cmd.push("yolo".into());
        }
        if let Some(sid) = &opts.resume_session {
            cmd.push("--resume".into());
            cmd.push(sid.clone());
        } else if opts.continue_session {
            cmd.push("--resume".into());
            cmd.push("latest".into());
        }
        if !cfg.allowed_tools.is_empty() {
            cmd.push("--allowed-tools".into());
            cmd.extend(cfg.allowed_tools.iter().cloned());
        }
        cmd.extend(cfg.cli_parameters.iter().cloned());
        cmd
    }

    /// Write system + appended system prompt to a temp markdown file and
    /// return its path, for delivery via `GEMINI_SYSTEM_MD`.
    fn system_prompt_file(&self) -> Option<PathBuf> {
        let sys = self.config.system_prompt.clone().unwrap_or_default();
        let append = self.config.append_system_prompt.clone().unwrap_or_default();
        let path = std::env::temp_dir().join(format!("ductor-gemini-{}.md", uuid::Uuid::new_v4()));
        match std::fs::write(&path, format!("{sys}\n\n{append}")) {
            Ok(()) => Some(path),
            Err(err) => {
                warn!(%err, "Failed to write Gemini system prompt file");
                None
            }
        }
    }

    /// Send a prompt and return the final result (non-streaming).
    pub async fn send(&self, prompt: &str, opts: SendOptions) -> Result<CliResponse> {
        let cmd = self.build_command(&opts, false);
        log_cmd("gemini", &cmd, false);

        let (exec_cmd, cwd) = docker_wrap(
            cmd,
            &self.config.docker_container,
            self.config.chat_id,
            &self.working_dir,
        );
        let mut child = spawn_with_env(
            &exec_cmd,
            cwd.as_deref(),
            Stdio::piped(),
            &[("GEMINI_IDE_ENABLED", "false".into())],
        )?;
        info!(pid = ?child.id(), "Gemini subprocess starting");

        let tracked = self
            .config
            .process_registry
            .as_ref()
            .map(|reg| reg.register(self.config.chat_id, child.id(), &self.config.process_label));

        // Prompt goes on stdin; close it so Gemini knows input ended.
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(prompt.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }

        let result = communicate(&mut child, opts.timeout).await;
        if let Some(tracked) = &tracked {
            tracked.mark_exited();
            if let Some(reg) = &self.config.process_registry {
                reg.unregister(tracked);
            }
        }

        match result {
            Communicate::TimedOut => Ok(CliResponse {
                is_error: true,
                timed_out: true,
                ..Default::default()
            }),
            Communicate::Done {
                stdout,
                stderr,
                returncode,
            } => Ok(parse_response(&stdout, &stderr, returncode)),
        }
    }

    /// Send a prompt and stream events as they arrive.
    pub async fn send_streaming(&self, prompt: &str, opts: SendOptions) -> Result<EventStream> {
        let cmd = self.build_command(&opts, true);
        log_cmd("gemini", &cmd, true);

        let (exec_cmd, cwd) = docker_wrap(
            cmd,
            &self.config.docker_container,
            self.config.chat_id,
            &self.working_dir,
        );

        let sys_path = self.system_prompt_file();
        let mut envs: Vec<(&str, String)> = vec![("GEMINI_IDE_ENABLED", "false".into())];
        if let Some(path) = &sys_path {
            envs.push(("GEMINI_SYSTEM_MD", path.to_string_lossy().into_owned()));
        }

        let mut child = spawn_with_env(&exec_cmd, cwd.as_deref(), Stdio::piped(), &envs)?;
        info!(pid = ?child.id(), "Gemini subprocess starting");

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
        let chat_id = self.config.chat_id;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(prompt.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }

        let (tx, stream) = EventStream::channel();
        let resume_sid = opts.resume_session.clone();
        let timeout = opts.timeout.or(Some(DEFAULT_STREAM_TIMEOUT));

        tokio::spawn(async move {
            let registry_for_final = registry.clone();
            let mut supervisor = StreamSupervisor::new(child, stderr, tracked, registry, tx);
            let last_sid = std::sync::Arc::new(std::sync::Mutex::new(resume_sid));
            let loop_sid = std::sync::Arc::clone(&last_sid);

            let read = supervisor.with_timeout(timeout, |tx| async move {
                let mut reader = BufReader::new(stdout);
                let mut buf = Vec::new();
                loop {
                    buf.clear();
                    let n = match reader.read_until(b'\n', &mut buf).await {
                        Ok(n) => n,
                        Err(err) => {
                            warn!(%err, "Gemini stream read error");
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
                    debug!(line = truncate_chars(line, 200), "Gemini raw line");
                    for mut event in parse_gemini_stream_line(line) {
                        match &mut event {
                            StreamEvent::SystemInit {
                                session_id: Some(sid),
                            } => {
                                *loop_sid.lock().expect("sid lock") = Some(sid.clone());
                            }
                            StreamEvent::Result(result) => {
                                // Inject the session id when missing so resumes work.
                                let mut sid = loop_sid.lock().expect("sid lock");
                                if let Some(found) = result.session_id.clone() {
                                    *sid = Some(found);
                                } else {
                                    result.session_id = sid.clone();
                                }
                            }
                            _ => {}
                        }
                        if tx.send(event).await.is_err() {
                            return (false, true);
                        }
                    }
                }
                (false, false)
            });

            let outcome = read.await;
            if let Some(path) = &sys_path {
                let _ = std::fs::remove_file(path);
            }
            match outcome {
                StreamOutcome::TimedOut | StreamOutcome::ConsumerGone => return,
                StreamOutcome::Completed(_) => {}
            }

            let (_, returncode) = supervisor.finish().await;
            let session_id = last_sid.lock().expect("sid lock").clone();

            let aborted = registry_for_final
                .as_ref()
                .is_some_and(|reg| reg.was_aborted(chat_id));
            if aborted {
                supervisor
                    .send_final(ResultEvent {
                        result: "Process aborted by user.".into(),
                        is_error: true,
                        session_id,
                        returncode,
                        ..Default::default()
                    })
                    .await;
            } else if returncode != Some(0) {
                supervisor
                    .send_final(ResultEvent {
                        result: format!(
                            "Process exited with code {}",
                            returncode.map_or_else(|| "?".into(), |c| c.to_string())
                        ),
                        is_error: true,
                        session_id,
                        returncode,
                        ..Default::default()
                    })
                    .await;
            }
        });

        Ok(stream)
    }
}

fn find_cli() -> Result<String> {
    which::which("gemini")
        .map(|p| p.to_string_lossy().into_owned())
        .context("gemini CLI not found on PATH. Install via: npm install -g @google/gemini-cli")
}

/// Parse Gemini's single JSON document into a CliResponse.
fn parse_response(stdout: &[u8], stderr: &[u8], returncode: Option<i32>) -> CliResponse {
    let stderr_text = truncate_chars(&String::from_utf8_lossy(stderr), 2000).to_string();
    let raw = String::from_utf8_lossy(stdout).trim().to_string();
    if raw.is_empty() {
        return CliResponse {
            is_error: true,
            returncode,
            stderr: stderr_text,
            ..Default::default()
        };
    }

    let (result, session_id, usage) = match serde_json::from_str::<Value>(&raw) {
        Ok(data) => {
            let result = data
                .get("response")
                .or_else(|| data.get("content"))
                .or_else(|| data.get("output"))
                .and_then(Value::as_str)
                .map(|s| s.to_string())
                .unwrap_or_else(|| raw.clone());
            let session_id = data
                .get("session_id")
                .and_then(Value::as_str)
                .map(|s| s.to_string());
            let usage = data
                .get("stats")
                .map(Usage::from_value)
                .unwrap_or_default();
            (result, session_id, usage)
        }
        Err(_) => (raw.clone(), None, Usage::default()),
    };

    CliResponse {
        session_id,
        result,
        is_error: returncode != Some(0),
        returncode,
        stderr: stderr_text,
        usage,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CliConfig {
        CliConfig {
            provider: "gemini".into(),
            docker_container: "test-container".into(),
            model: Some("gemini-2.5-pro".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_command_streaming() {
        let cli = GeminiCli::new(config()).unwrap();
        let cmd = cli.build_command(&SendOptions::default(), true);
        assert_eq!(cmd[0], "gemini");
        assert!(cmd.contains(&"stream-json".to_string()));
        assert!(cmd.contains(&"--include-directories".to_string()));
        assert!(cmd.contains(&"--approval-mode".to_string()));
        assert!(cmd.contains(&"yolo".to_string()));
    }

    #[test]
    fn test_build_command_resume_and_continue() {
        let cli = GeminiCli::new(config()).unwrap();
        let resumed = cli.build_command(
            &SendOptions {
                resume_session: Some("g-1".into()),
                ..Default::default()
            },
            false,
        );
        let idx = resumed.iter().position(|c| c == "--resume").unwrap();
        assert_eq!(resumed[idx + 1], "g-1");

        let continued = cli.build_command(
            &SendOptions {
                continue_session: true,
                ..Default::default()
            },
            false,
        );
        let idx = continued.iter().position(|c| c == "--resume").unwrap();
        assert_eq!(continued[idx + 1], "latest");
    }

    #[test]
    fn test_parse_response_json() {
        let stdout = br#"{"response":"Sure.","session_id":"g-7",
            "stats":{"input_tokens":12,"output_tokens":3}}"#;
        let resp = parse_response(stdout, b"", Some(0));
        assert!(!resp.is_error);
        assert_eq!(resp.result, "Sure.");
        assert_eq!(resp.session_id.as_deref(), Some("g-7"));
        assert_eq!(resp.total_tokens(), 15);
    }

    #[test]
    fn test_parse_response_plain_text_fallback() {
        let resp = parse_response(b"plain output", b"", Some(0));
        assert_eq!(resp.result, "plain output");
        assert!(resp.session_id.is_none());
    }
}
