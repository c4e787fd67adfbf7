//! CLIService: unified gateway for ALL CLI calls in the project.
//!
//! No retry/backoff, no circuit breaker, no dead letters. The only
//! recovery behavior is the documented streaming-to-non-streaming
//! fallback, performed once.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use anyhow::Result;
use futures::future::BoxFuture;
use tracing::{info, warn};

use crate::cli::process_registry::ProcessRegistry;
use crate::cli::stream::{ResultEvent, StreamEvent};
use crate::cli::types::{AgentRequest, AgentResponse, CliResponse};
use crate::cli::{create_cli, CliConfig, ProviderCli, SendOptions};
use crate::config::ModelRegistry;

/// Async callback invoked with each assistant text delta.
pub type TextCallback = Box<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;
/// Async callback invoked when a tool starts running.
pub type ToolCallback = Box<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;
/// Async callback invoked on status changes (`None` clears the indicator).
pub type StatusCallback = Box<dyn Fn(Option<String>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Bundle of optional streaming callbacks.
#[derive(Default)]
pub struct StreamCallbacks {
    pub on_text_delta: Option<TextCallback>,
    pub on_tool_activity: Option<ToolCallback>,
    pub on_system_status: Option<StatusCallback>,
}

impl StreamCallbacks {
    /// Handle one event. Returns `(text_chunk, result_or_none)`.
    async fn dispatch(&self, event: StreamEvent) -> (String, Option<ResultEvent>) {
        match event {
            StreamEvent::AssistantTextDelta { text } if !text.is_empty() => {
                if let Some(on_text) = &self.on_text_delta {
                    on_text(text.clone()).await;
                }
                (text, None)
            }
            StreamEvent::Thinking { .. } => {
                if let Some(on_status) = &self.on_system_status {
                    on_status(Some("thinking".into())).await;
                }
                (String::new(), None)
            }
            StreamEvent::ToolUse { tool_name, .. } => {
                if let Some(on_tool) = &self.on_tool_activity {
                    on_tool(tool_name).await;
                }
                (String::new(), None)
            }
            StreamEvent::SystemStatus { status } => {
                if let Some(on_status) = &self.on_system_status {
                    on_status(status).await;
                }
                (String::new(), None)
            }
            StreamEvent::CompactBoundary {
                trigger,
                pre_tokens,
            } => {
                info!(trigger = %trigger, pre_tokens, "Context compacted");
                if let Some(on_status) = &self.on_system_status {
                    on_status(None).await;
                }
                (String::new(), None)
            }
            StreamEvent::Result(result) => (String::new(), Some(result)),
            _ => (String::new(), None),
        }
    }
}

/// Static wiring that CLIService needs from the orchestrator.
#[derive(Debug, Clone)]
pub struct CliServiceConfig {
    pub working_dir: String,
    pub default_model: String,
    pub provider: String,
    pub max_turns: Option<u32>,
    pub max_budget_usd: Option<f64>,
    pub permission_mode: String,
    pub reasoning_effort: String,
    pub docker_container: String,
    pub claude_cli_parameters: Vec<String>,
    pub codex_cli_parameters: Vec<String>,
    pub gemini_cli_parameters: Vec<String>,
}

impl CliServiceConfig {
    /// Extra argv for the given provider.
    pub fn cli_parameters_for_provider(&self, provider: &str) -> Vec<String> {
        match provider {
            "codex" => self.codex_cli_parameters.clone(),
            "gemini" => self.gemini_cli_parameters.clone(),
            _ => self.claude_cli_parameters.clone(),
        }
    }
}

/// Single gateway for every CLI call in the project.
pub struct CliService {
    config: RwLock<CliServiceConfig>,
    models: ModelRegistry,
    available_providers: RwLock<BTreeSet<String>>,
    process_registry: Arc<ProcessRegistry>,
}

impl CliService {
    pub fn new(
        config: CliServiceConfig,
        models: ModelRegistry,
        available_providers: BTreeSet<String>,
        process_registry: Arc<ProcessRegistry>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            models,
            available_providers: RwLock::new(available_providers),
            process_registry,
        }
    }

    pub fn update_available_providers(&self, providers: BTreeSet<String>) {
        *self.available_providers.write().expect("providers lock") = providers;
    }

    /// Update the default model after a `/model` switch.
    pub fn update_default_model(&self, model: &str) {
        self.config.write().expect("config lock").default_model = model.to_string();
    }

    /// Update the default reasoning effort after wizard selection.
    pub fn update_reasoning_effort(&self, effort: &str) {
        self.config.write().expect("config lock").reasoning_effort = effort.to_string();
    }

    /// Switch Docker container (empty string = host execution).
    pub fn update_docker_container(&self, container: &str) {
        self.config.write().expect("config lock").docker_container = container.to_string();
    }

    fn config_snapshot(&self) -> CliServiceConfig {
        self.config.read().expect("config lock").clone()
    }

    /// Execute a non-streaming CLI call.
    pub async fn execute(&self, request: &AgentRequest) -> Result<AgentResponse> {
        let cli = self.make_cli(request)?;
        let config = self.config_snapshot();
        let model_name = request
            .model_override
            .clone()
            .unwrap_or(config.default_model);
        info!(
            label = %request.process_label,
            model = %model_name,
            "CLI execute starting"
        );

        let t0 = Instant::now();
        let response = cli
            .send(
                &request.prompt,
                SendOptions {
                    resume_session: request.resume_session.clone(),
                    continue_session: request.continue_session,
                    timeout: SendOptions::timeout_from_seconds(request.timeout_seconds),
                },
            )
            .await?;
        let elapsed_ms = t0.elapsed().as_secs_f64() * 1000.0;

        let agent_resp: AgentResponse = response.into();
        self.log_call(request, &agent_resp, elapsed_ms);
        Ok(agent_resp)
    }

    /// Execute a streaming CLI call with automatic fallback to non-streaming.
    pub async fn execute_streaming(
        &self,
        request: &AgentRequest,
        callbacks: &StreamCallbacks,
    ) -> Result<AgentResponse> {
        let config = self.config_snapshot();
        let model_name = request
            .model_override
            .clone()
            .unwrap_or(config.default_model);
        info!(
            label = %request.process_label,
            model = %model_name,
            "CLI streaming starting"
        );

        let mut accumulated_text = String::new();
        let mut result_event: Option<ResultEvent> = None;
        let mut stream_error = false;

        let opts = SendOptions {
            resume_session: request.resume_session.clone(),
            continue_session: request.continue_session,
            timeout: SendOptions::timeout_from_seconds(request.timeout_seconds),
        };

        let stream = match self.make_cli(request) {
            Ok(cli) => cli.send_streaming(&request.prompt, opts).await,
            Err(err) => Err(err),
        };
        match stream {
            Ok(mut stream) => {
                while let Some(event) = stream.next().await {
                    if self.process_registry.was_aborted(request.chat_id) {
                        info!(chat_id = request.chat_id, "Streaming aborted mid-stream");
                        break;
                    }
                    let (text, result) = callbacks.dispatch(event).await;
                    accumulated_text.push_str(&text);
                    if result.is_some() {
                        result_event = result;
                    }
                }
            }
            Err(err) => {
                warn!(
                    label = %request.process_label,
                    %err,
                    "Stream error, falling back"
                );
                stream_error = true;
            }
        }

        let Some(result) = result_event.filter(|_| !stream_error) else {
            return self
                .handle_stream_fallback(request, accumulated_text, stream_error)
                .await;
        };

        info!(label = %request.process_label, "CLI streaming completed");
        let cli_resp = CliResponse {
            session_id: result.session_id,
            result: if result.result.is_empty() {
                accumulated_text
            } else {
                result.result
            },
            is_error: result.is_error,
            returncode: result.returncode,
            duration_ms: result.duration_ms,
            duration_api_ms: result.duration_api_ms,
            total_cost_usd: result.total_cost_usd,
            usage: result.usage,
            num_turns: result.num_turns,
            ..Default::default()
        };
        Ok(cli_resp.into())
    }

    /// Handle failed or incomplete streaming: use accumulated text or retry.
    async fn handle_stream_fallback(
        &self,
        request: &AgentRequest,
        accumulated_text: String,
        stream_error: bool,
    ) -> Result<AgentResponse> {
        let was_aborted = self.process_registry.was_aborted(request.chat_id);
        info!(
            aborted = was_aborted,
            accumulated = accumulated_text.len(),
            "Stream fallback"
        );

        if was_aborted {
            return Ok(AgentResponse::empty());
        }

        if !accumulated_text.is_empty() && !stream_error {
            info!(
                chars = accumulated_text.len(),
                "Stream completed without result frame, using accumulated text"
            );
            return Ok(AgentResponse {
                result: accumulated_text,
                ..Default::default()
            });
        }

        warn!(
            stream_error,
            accumulated = accumulated_text.len(),
            "Streaming failed, retrying non-streaming"
        );
        let resp = self.execute(request).await?;
        Ok(AgentResponse {
            stream_fallback: true,
            ..resp
        })
    }

    /// Create a provider adapter for the given request.
    fn make_cli(&self, request: &AgentRequest) -> Result<ProviderCli> {
        let config = self.config_snapshot();
        let model_name = request
            .model_override
            .clone()
            .unwrap_or_else(|| config.default_model.clone());

        let (model, provider) = if let Some(provider) = &request.provider_override {
            (model_name, provider.clone())
        } else {
            let available = self
                .available_providers
                .read()
                .expect("providers lock")
                .clone();
            if available.is_empty() {
                let provider = self.models.provider_for(&model_name);
                (model_name, provider)
            } else {
                self.models.resolve_for_provider(&model_name, &available)?
            }
        };

        let cli_parameters = config.cli_parameters_for_provider(&provider);
        create_cli(CliConfig {
            provider,
            working_dir: config.working_dir.clone().into(),
            model: Some(model),
            system_prompt: request.system_prompt.clone(),
            append_system_prompt: request.append_system_prompt.clone(),
            max_turns: config.max_turns,
            max_budget_usd: config.max_budget_usd,
            permission_mode: config.permission_mode.clone(),
            reasoning_effort: config.reasoning_effort.clone(),
            docker_container: config.docker_container.clone(),
            cli_parameters,
            process_registry: Some(Arc::clone(&self.process_registry)),
            chat_id: request.chat_id,
            process_label: request.process_label.clone(),
            ..Default::default()
        })
    }

    fn log_call(&self, request: &AgentRequest, response: &AgentResponse, elapsed_ms: f64) {
        let status = if response.is_error { "error" } else { "ok" };
        info!(
            label = %request.process_label,
            status,
            cost = response.cost_usd,
            tokens = response.total_tokens,
            duration_ms = elapsed_ms as u64,
            "CLI call finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn callbacks_with_counters() -> (StreamCallbacks, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let text_count = Arc::new(AtomicUsize::new(0));
        let tool_count = Arc::new(AtomicUsize::new(0));
        let text_clone = Arc::clone(&text_count);
        let tool_clone = Arc::clone(&tool_count);
        let callbacks = StreamCallbacks {
            on_text_delta: Some(Box::new(move |_| {
                let counter = Arc::clone(&text_clone);
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })),
            on_tool_activity: Some(Box::new(move |_| {
                let counter = Arc::clone(&tool_clone);
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })),
            on_system_status: None,
        };
        (callbacks, text_count, tool_count)
    }

    #[tokio::test]
    async fn test_dispatch_routes_callbacks() {
        let (callbacks, text_count, tool_count) = callbacks_with_counters();

        let (text, result) = callbacks
            .dispatch(StreamEvent::AssistantTextDelta {
                text: "hello".into(),
            })
            .await;
        assert_eq!(text, "hello");
        assert!(result.is_none());

        callbacks
            .dispatch(StreamEvent::ToolUse {
                tool_name: "Bash".into(),
                tool_id: None,
                parameters: None,
            })
            .await;

        let (_, result) = callbacks
            .dispatch(StreamEvent::Result(ResultEvent::default()))
            .await;
        assert!(result.is_some());

        assert_eq!(text_count.load(Ordering::SeqCst), 1);
        assert_eq!(tool_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_empty_text_not_forwarded() {
        let (callbacks, text_count, _) = callbacks_with_counters();
        let (text, _) = callbacks
            .dispatch(StreamEvent::AssistantTextDelta { text: String::new() })
            .await;
        assert!(text.is_empty());
        assert_eq!(text_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cli_parameters_for_provider() {
        let config = CliServiceConfig {
            working_dir: ".".into(),
            default_model: "opus".into(),
            provider: "claude".into(),
            max_turns: None,
            max_budget_usd: None,
            permission_mode: "bypassPermissions".into(),
            reasoning_effort: "medium".into(),
            docker_container: String::new(),
            claude_cli_parameters: vec!["--a".into()],
            codex_cli_parameters: vec!["--b".into()],
            gemini_cli_parameters: vec!["--c".into()],
        };
        assert_eq!(config.cli_parameters_for_provider("claude"), vec!["--a"]);
        assert_eq!(config.cli_parameters_for_provider("codex"), vec!["--b"]);
        assert_eq!(config.cli_parameters_for_provider("gemini"), vec!["--c"]);
    }

    #[test]
    fn test_mutators_swap_config() {
        let service = CliService::new(
            CliServiceConfig {
                working_dir: ".".into(),
                default_model: "opus".into(),
                provider: "claude".into(),
                max_turns: None,
                max_budget_usd: None,
                permission_mode: "bypassPermissions".into(),
                reasoning_effort: "medium".into(),
                docker_container: String::new(),
                claude_cli_parameters: Vec::new(),
                codex_cli_parameters: Vec::new(),
                gemini_cli_parameters: Vec::new(),
            },
            ModelRegistry,
            BTreeSet::new(),
            Arc::new(ProcessRegistry::new()),
        );

        service.update_default_model("sonnet");
        service.update_reasoning_effort("high");
        service.update_docker_container("sandbox");
        let snapshot = service.config_snapshot();
        assert_eq!(snapshot.default_model, "sonnet");
        assert_eq!(snapshot.reasoning_effort, "high");
        assert_eq!(snapshot.docker_container, "sandbox");
    }
}
