//! ductor-core: the agent execution kernel behind the ductor bot.
//!
//! This crate contains everything between the chat transport and the
//! provider CLI binaries:
//!
//! - [`config`] — typed configuration, deep-merged from JSON, plus the
//!   model registry and workspace paths
//! - [`cli`] — provider adapters (Claude Code, Codex, Gemini), stream
//!   parsing, process supervision, and the unified CLI service
//! - [`session`] — per-chat, per-provider session persistence
//! - [`orchestrator`] — command routing, directives, hooks, and the
//!   conversation flows
//! - [`cron`] / [`webhook`] / [`heartbeat`] / [`cleanup`] — the four
//!   background observers
//! - [`gateway`] — inbound middleware (dedup, sequential lock, preemption)
//!
//! # Quick Start
//!
//! ```no_run
//! use ductor_core::config::paths::resolve_paths;
//! use ductor_core::config::AgentConfig;
//! use ductor_core::orchestrator::Orchestrator;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let paths = resolve_paths("~/.ductor");
//! let config = AgentConfig::load(&paths.config_path);
//! let orch = Orchestrator::create(config, paths).await?;
//!
//! let reply = orch.handle_message(12345, "Hello!").await;
//! println!("{}", reply.text);
//! # Ok(()) }
//! ```

pub mod cleanup;
pub mod cli;
pub mod config;
pub mod cron;
pub mod errors;
pub mod gateway;
pub mod heartbeat;
pub mod orchestrator;
pub mod session;
pub mod util;
pub mod webhook;

use std::sync::{Arc, RwLock};

use crate::config::AgentConfig;

/// Shared, read-mostly runtime configuration.
///
/// Live mutations (`/model`, `/upgrade`) write through this handle;
/// observers re-snapshot per tick to avoid torn reads across await points.
pub type SharedConfig = Arc<RwLock<AgentConfig>>;
