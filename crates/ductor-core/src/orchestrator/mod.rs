//! Core orchestrator: routes messages through command and conversation flows.

pub mod commands;
pub mod directives;
pub mod flows;
pub mod hooks;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};

use anyhow::Result;
use futures::future::BoxFuture;
use tracing::{error, info, warn};

use crate::cli::codex_cache::CodexModelCache;
use crate::cli::process_registry::ProcessRegistry;
use crate::cli::service::{CliService, CliServiceConfig, StreamCallbacks};
use crate::cleanup::CleanupObserver;
use crate::config::paths::DuctorPaths;
use crate::config::{AgentConfig, ModelRegistry, CLAUDE_MODELS};
use crate::cron::observer::{CronObserver, CronResultCallback};
use crate::cron::CronManager;
use crate::errors::DuctorError;
use crate::heartbeat::{HeartbeatObserver, HeartbeatResultCallback};
use crate::orchestrator::directives::parse_directives;
use crate::orchestrator::hooks::{mainmemory_reminder, MessageHookRegistry};
use crate::session::SessionStore;
use crate::webhook::observer::{WakeHandler, WebhookObserver, WebhookResultCallback};
use crate::webhook::WebhookManager;
use crate::SharedConfig;

/// Reply produced by a command or conversation flow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrchestratorResult {
    pub text: String,
    pub stream_fallback: bool,
}

impl OrchestratorResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            stream_fallback: false,
        }
    }
}

type CommandHandler =
    for<'a> fn(&'a Orchestrator, i64, &'a str) -> BoxFuture<'a, Result<OrchestratorResult>>;

/// Maps command tokens to async handlers; unknown commands fall through to
/// the conversation flow.
#[derive(Default)]
pub struct CommandRegistry {
    entries: Vec<(&'static str, CommandHandler)>,
}

impl CommandRegistry {
    pub fn register(&mut self, token: &'static str, handler: CommandHandler) {
        self.entries.push((token, handler));
    }

    /// Dispatch by prefix match on the lowercased, trimmed command with an
    /// optional `@bot_name` suffix on the first token.
    pub async fn dispatch(
        &self,
        orch: &Orchestrator,
        chat_id: i64,
        text: &str,
    ) -> Option<Result<OrchestratorResult>> {
        let lowered = text.trim().to_lowercase();
        let mut parts = lowered.splitn(2, char::is_whitespace);
        let first = parts.next().unwrap_or("");
        let first = first.split('@').next().unwrap_or(first);
        let rest = parts.next().unwrap_or("");
        let normalized = if rest.is_empty() {
            first.to_string()
        } else {
            format!("{first} {rest}")
        };

        for (token, handler) in &self.entries {
            if normalized == *token || normalized.starts_with(&format!("{token} ")) {
                return Some(handler(orch, chat_id, text).await);
            }
        }
        None
    }
}

/// Log-only scan for suspicious inbound text.
fn detect_suspicious_patterns(text: &str) -> Vec<&'static str> {
    let mut patterns = Vec::new();
    if text.contains('\0') {
        patterns.push("null_byte");
    }
    if text.contains('\u{1b}') {
        patterns.push("ansi_escape");
    }
    if text.len() > 50_000 {
        patterns.push("oversized_input");
    }
    patterns
}

/// Routes messages through command dispatch and conversation flows.
pub struct Orchestrator {
    config: SharedConfig,
    paths: DuctorPaths,
    models: ModelRegistry,
    sessions: SessionStore,
    process_registry: Arc<ProcessRegistry>,
    available_providers: RwLock<BTreeSet<String>>,
    cli_service: CliService,
    codex_cache: Arc<RwLock<CodexModelCache>>,
    cron_manager: Arc<Mutex<CronManager>>,
    cron_observer: Arc<CronObserver>,
    webhook_manager: Arc<Mutex<WebhookManager>>,
    webhook_observer: Arc<WebhookObserver>,
    heartbeat: Arc<HeartbeatObserver>,
    cleanup_observer: Arc<CleanupObserver>,
    hook_registry: MessageHookRegistry,
    command_registry: CommandRegistry,
}

impl Orchestrator {
    pub fn new(config: AgentConfig, paths: DuctorPaths) -> Arc<Self> {
        let shared_config: SharedConfig = Arc::new(RwLock::new(config.clone()));
        let process_registry = Arc::new(ProcessRegistry::new());
        let codex_cache = Arc::new(RwLock::new(CodexModelCache::default()));

        let cli_service = CliService::new(
            CliServiceConfig {
                working_dir: paths.workspace.to_string_lossy().into_owned(),
                default_model: config.model.clone(),
                provider: config.provider.clone(),
                max_turns: config.max_turns,
                max_budget_usd: config.max_budget_usd,
                permission_mode: config.permission_mode.clone(),
                reasoning_effort: config.reasoning_effort.clone(),
                docker_container: if config.docker.enabled {
                    config.docker.container_name.clone()
                } else {
                    String::new()
                },
                claude_cli_parameters: config.cli_parameters.claude.clone(),
                codex_cli_parameters: config.cli_parameters.codex.clone(),
                gemini_cli_parameters: config.cli_parameters.gemini.clone(),
            },
            ModelRegistry,
            BTreeSet::new(),
            Arc::clone(&process_registry),
        );

        let sessions = SessionStore::new(paths.sessions_path.clone(), Arc::clone(&shared_config));
        let cron_manager = Arc::new(Mutex::new(CronManager::new(paths.cron_jobs_path.clone())));
        let cron_observer = Arc::new(CronObserver::new(
            paths.clone(),
            Arc::clone(&cron_manager),
            Arc::clone(&shared_config),
            Arc::clone(&codex_cache),
        ));
        let webhook_manager = Arc::new(Mutex::new(WebhookManager::new(paths.webhooks_path.clone())));
        let webhook_observer = Arc::new(WebhookObserver::new(
            paths.clone(),
            Arc::clone(&webhook_manager),
            Arc::clone(&shared_config),
            Arc::clone(&codex_cache),
        ));
        let heartbeat = Arc::new(HeartbeatObserver::new(Arc::clone(&shared_config)));
        let cleanup_observer = Arc::new(CleanupObserver::new(
            Arc::clone(&shared_config),
            paths.clone(),
        ));

        let mut hook_registry = MessageHookRegistry::new();
        hook_registry.register(mainmemory_reminder());

        let orch = Arc::new(Self {
            config: shared_config,
            paths,
            models: ModelRegistry,
            sessions,
            process_registry,
            available_providers: RwLock::new(BTreeSet::new()),
            cli_service,
            codex_cache,
            cron_manager,
            cron_observer,
            webhook_manager,
            webhook_observer,
            heartbeat,
            cleanup_observer,
            hook_registry,
            command_registry: build_command_registry(),
        });
        orch.wire_heartbeat();
        orch
    }

    /// Async factory: detect providers, load the model cache, start the
    /// observers.
    pub async fn create(config: AgentConfig, paths: DuctorPaths) -> Result<Arc<Self>> {
        paths.ensure_dirs()?;
        std::env::set_var("DUCTOR_HOME", &paths.ductor_home);

        let orch = Self::new(config, paths);

        let available = detect_available_providers();
        if available.is_empty() {
            error!("No providers found on PATH! CLI calls will fail.");
        } else {
            info!(
                providers = %available.iter().cloned().collect::<Vec<_>>().join(", "),
                "Available providers"
            );
        }
        orch.update_available_providers(available);

        orch.refresh_codex_cache(false).await;
        orch.start_observers().await;
        Ok(orch)
    }

    /// Start all four background observers.
    pub async fn start_observers(self: &Arc<Self>) {
        self.cron_observer.start().await;
        self.heartbeat.start().await;
        self.webhook_observer.start().await;
        self.cleanup_observer.start().await;
    }

    /// Cleanup on shutdown.
    pub async fn shutdown(&self) {
        self.heartbeat.stop().await;
        self.webhook_observer.stop().await;
        self.cron_observer.stop().await;
        self.cleanup_observer.stop().await;
        info!("Orchestrator shutdown");
    }

    // ── Message entry points ────────────────────────────────────────

    /// Main entry point: route a message to the appropriate handler.
    pub async fn handle_message(&self, chat_id: i64, text: &str) -> OrchestratorResult {
        self.handle_message_impl(chat_id, text, None).await
    }

    /// Entry point with streaming callbacks.
    pub async fn handle_message_streaming(
        &self,
        chat_id: i64,
        text: &str,
        callbacks: &StreamCallbacks,
    ) -> OrchestratorResult {
        self.handle_message_impl(chat_id, text, Some(callbacks)).await
    }

    async fn handle_message_impl(
        &self,
        chat_id: i64,
        text: &str,
        callbacks: Option<&StreamCallbacks>,
    ) -> OrchestratorResult {
        self.process_registry.clear_abort(chat_id);
        let cmd = text.trim().to_lowercase();
        info!(text = %cmd.chars().take(80).collect::<String>(), "Message received");

        let patterns = detect_suspicious_patterns(text);
        if !patterns.is_empty() {
            warn!(patterns = %patterns.join(","), "Suspicious input patterns");
        }

        match self.route_message(chat_id, text, callbacks).await {
            Ok(result) => result,
            Err(err) => {
                error!(%err, "Error in handle_message");
                OrchestratorResult::text("An internal error occurred. Please try again.")
            }
        }
    }

    async fn route_message(
        &self,
        chat_id: i64,
        text: &str,
        callbacks: Option<&StreamCallbacks>,
    ) -> Result<OrchestratorResult> {
        if let Some(result) = self.command_registry.dispatch(self, chat_id, text).await {
            return result;
        }

        let known = self.known_model_ids();
        let directives = parse_directives(text, &known);

        if directives.is_directive_only && directives.has_model() {
            let model = directives.model.as_deref().unwrap_or_default();
            return Ok(OrchestratorResult::text(format!(
                "Next message will use: {model}\n(Send a message with @{model} <text> to use it.)"
            )));
        }

        let prompt = if directives.cleaned.is_empty() {
            text
        } else {
            directives.cleaned.as_str()
        };
        flows::normal(self, chat_id, prompt, directives.model.as_deref(), callbacks).await
    }

    // ── Capabilities and wiring ─────────────────────────────────────

    fn wire_heartbeat(self: &Arc<Self>) {
        let orch = Arc::clone(self);
        self.heartbeat
            .set_heartbeat_handler(Arc::new(move |chat_id| {
                let orch = Arc::clone(&orch);
                Box::pin(async move { orch.handle_heartbeat(chat_id).await })
            }));

        let registry = Arc::clone(&self.process_registry);
        self.heartbeat
            .set_busy_check(Arc::new(move |chat_id| registry.has_active(chat_id)));

        let registry = Arc::clone(&self.process_registry);
        let stale_max = self.config_snapshot().cli_timeout * 2.0;
        self.heartbeat.set_stale_cleanup(Arc::new(move || {
            let registry = Arc::clone(&registry);
            Box::pin(async move { registry.kill_stale(stale_max).await })
        }));
    }

    /// Run a heartbeat turn in the main session. Returns alert text or None.
    pub async fn handle_heartbeat(&self, chat_id: i64) -> Option<String> {
        match flows::heartbeat_flow(self, chat_id).await {
            Ok(alert) => alert,
            Err(err) => {
                warn!(%err, "Heartbeat flow failed");
                None
            }
        }
    }

    /// Kill all active CLI processes for a chat.
    pub async fn abort(&self, chat_id: i64) -> usize {
        self.process_registry.kill_all(chat_id).await
    }

    /// Check whether a chat has active CLI processes.
    pub fn is_chat_busy(&self, chat_id: i64) -> bool {
        self.process_registry.has_active(chat_id)
    }

    /// Forward cron job results to an external handler (e.g. Telegram).
    pub fn set_cron_result_handler(&self, handler: CronResultCallback) {
        self.cron_observer.set_result_handler(handler);
    }

    /// Forward heartbeat alerts to an external handler.
    pub fn set_heartbeat_result_handler(&self, handler: HeartbeatResultCallback) {
        self.heartbeat.set_result_handler(handler);
    }

    /// Forward webhook results to an external handler.
    pub fn set_webhook_result_handler(&self, handler: WebhookResultCallback) {
        self.webhook_observer.set_result_handler(handler);
    }

    /// Set the webhook wake handler (provided by the bot layer).
    pub fn set_webhook_wake_handler(&self, handler: WakeHandler) {
        self.webhook_observer.set_wake_handler(handler);
    }

    /// Swap the authenticated-provider set everywhere it is consulted.
    pub fn update_available_providers(&self, providers: BTreeSet<String>) {
        *self.available_providers.write().expect("providers lock") = providers.clone();
        self.cli_service.update_available_providers(providers);
    }

    /// Reload the Codex model cache (optionally forcing rediscovery).
    pub async fn refresh_codex_cache(&self, force: bool) -> usize {
        let cache =
            CodexModelCache::load_or_refresh(&self.paths.codex_models_path, force).await;
        let count = cache.models.len();
        *self.codex_cache.write().expect("cache lock") = cache;
        count
    }

    /// Resolve `(model, provider)` for the current availability set.
    pub fn resolve_runtime_target(
        &self,
        requested_model: &str,
    ) -> Result<(String, String), DuctorError> {
        let available = self.available_providers();
        if available.is_empty() {
            return Ok((
                requested_model.to_string(),
                self.models.provider_for(requested_model),
            ));
        }
        self.models.resolve_for_provider(requested_model, &available)
    }

    /// Model names recognized by `@model` directives and `/model`.
    pub fn known_model_ids(&self) -> BTreeSet<String> {
        let mut known: BTreeSet<String> =
            CLAUDE_MODELS.iter().map(|m| m.to_string()).collect();
        known.extend(self.codex_model_ids());
        known.insert(self.config_snapshot().model);
        known
    }

    pub fn codex_model_ids(&self) -> Vec<String> {
        self.codex_cache
            .read()
            .expect("cache lock")
            .models
            .iter()
            .map(|m| m.id.clone())
            .collect()
    }

    // ── Accessors for flows, commands, and the bot layer ────────────

    pub fn config_snapshot(&self) -> AgentConfig {
        self.config.read().expect("config lock").clone()
    }

    pub fn config_mut(&self) -> RwLockWriteGuard<'_, AgentConfig> {
        self.config.write().expect("config lock")
    }

    pub fn paths(&self) -> &DuctorPaths {
        &self.paths
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn process_registry(&self) -> &Arc<ProcessRegistry> {
        &self.process_registry
    }

    pub fn cli_service(&self) -> &CliService {
        &self.cli_service
    }

    pub fn hooks(&self) -> &MessageHookRegistry {
        &self.hook_registry
    }

    pub fn cron_manager(&self) -> &Arc<Mutex<CronManager>> {
        &self.cron_manager
    }

    pub fn webhook_manager(&self) -> &Arc<Mutex<WebhookManager>> {
        &self.webhook_manager
    }

    pub fn available_providers(&self) -> BTreeSet<String> {
        self.available_providers
            .read()
            .expect("providers lock")
            .clone()
    }
}

/// Providers whose CLI binaries are installed on this host.
fn detect_available_providers() -> BTreeSet<String> {
    let mut available = BTreeSet::new();
    for provider in ["claude", "codex", "gemini"] {
        match which::which(provider) {
            Ok(path) => {
                info!(provider, path = %path.display(), "Provider CLI found");
                available.insert(provider.to_string());
            }
            Err(_) => info!(provider, "Provider CLI not found"),
        }
    }
    available
}

macro_rules! boxed_command {
    ($handler:path) => {{
        fn call<'a>(
            orch: &'a Orchestrator,
            chat_id: i64,
            text: &'a str,
        ) -> BoxFuture<'a, Result<OrchestratorResult>> {
            Box::pin($handler(orch, chat_id, text))
        }
        call as CommandHandler
    }};
}

fn build_command_registry() -> CommandRegistry {
    let mut registry = CommandRegistry::default();
    registry.register("/new", boxed_command!(commands::cmd_reset));
    registry.register("/stop", boxed_command!(commands::cmd_stop));
    registry.register("/status", boxed_command!(commands::cmd_status));
    registry.register("/model", boxed_command!(commands::cmd_model));
    registry.register("/memory", boxed_command!(commands::cmd_memory));
    registry.register("/cron", boxed_command!(commands::cmd_cron));
    registry.register("/diagnose", boxed_command!(commands::cmd_diagnose));
    registry.register("/upgrade", boxed_command!(commands::cmd_upgrade));
    registry
}
