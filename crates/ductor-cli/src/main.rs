//! ductor CLI — run the orchestrator service or poke it from a terminal.
//!
//! Usage:
//!   ductor run               — Start the orchestrator and all observers
//!   ductor send <text>       — Route one message through the orchestrator
//!   ductor status            — Show configuration and provider health
//!   ductor cron list         — List scheduled jobs

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use ductor_core::config::paths::resolve_paths;
use ductor_core::config::AgentConfig;
use ductor_core::cron::CronJob;
use ductor_core::orchestrator::Orchestrator;

#[derive(Parser)]
#[command(
    name = "ductor",
    version,
    about = "A Telegram-fronted orchestrator for coding-agent CLIs",
    long_about = "ductor — multiplexes chat conversations onto Claude Code, Codex, and \
                  Gemini CLI subprocesses with persistent sessions and background observers."
)]
struct Cli {
    /// Override the ductor home directory (default: ~/.ductor)
    #[arg(long)]
    home: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestrator service with all observers
    Run,

    /// Route a single message through the orchestrator and print the reply
    Send {
        /// Chat id to use (defaults to the first allowed user, else 0)
        #[arg(short, long)]
        chat: Option<i64>,

        /// The message text
        text: Vec<String>,
    },

    /// Show configuration status and provider health
    Status,

    /// Manage scheduled jobs
    Cron {
        #[command(subcommand)]
        action: CronCommands,
    },
}

#[derive(Subcommand)]
enum CronCommands {
    /// List all scheduled jobs
    List,
    /// Add a new job
    Add {
        /// Job id
        #[arg(long)]
        id: String,
        /// Human title
        #[arg(long)]
        title: String,
        /// Cron expression (e.g., "0 9 * * *")
        #[arg(long)]
        schedule: String,
        /// Task folder under cron_tasks/
        #[arg(long)]
        folder: String,
        /// Instruction for the agent
        #[arg(long)]
        instruction: String,
    },
    /// Remove a job
    Remove {
        /// Job id
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let paths = resolve_paths(cli.home.as_deref().unwrap_or("~/.ductor"));
    let config = AgentConfig::load(&paths.config_path);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(config.log_level.to_lowercase())
            }),
        )
        .with_target(false)
        .compact()
        .init();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => cmd_run(config, paths).await,
        Commands::Send { chat, text } => cmd_send(config, paths, chat, text.join(" ")).await,
        Commands::Status => cmd_status(config, paths).await,
        Commands::Cron { action } => cmd_cron(config, paths, action).await,
    }
}

/// Start the orchestrator and park until Ctrl-C.
async fn cmd_run(
    config: AgentConfig,
    paths: ductor_core::config::paths::DuctorPaths,
) -> Result<()> {
    let orch = Orchestrator::create(config, paths).await?;
    info!("ductor is running (Ctrl-C to stop)");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    orch.shutdown().await;
    Ok(())
}

/// One-shot message round trip, useful for smoke tests without Telegram.
async fn cmd_send(
    config: AgentConfig,
    paths: ductor_core::config::paths::DuctorPaths,
    chat: Option<i64>,
    text: String,
) -> Result<()> {
    if text.trim().is_empty() {
        anyhow::bail!("nothing to send; pass the message text");
    }
    let chat_id = chat
        .or_else(|| config.allowed_user_ids.first().copied())
        .unwrap_or(0);

    let orch = Orchestrator::create(config, paths).await?;
    let reply = orch.handle_message(chat_id, &text).await;
    println!("{}", reply.text);
    orch.shutdown().await;
    Ok(())
}

async fn cmd_status(
    config: AgentConfig,
    paths: ductor_core::config::paths::DuctorPaths,
) -> Result<()> {
    println!("Home:      {}", paths.ductor_home.display());
    println!("Provider:  {} (model {})", config.provider, config.model);
    println!("Streaming: {}", config.streaming.enabled);
    println!("Heartbeat: {}", config.heartbeat.enabled);
    println!("Webhooks:  {}", config.webhooks.enabled);
    for provider in ["claude", "codex", "gemini"] {
        match which::which(provider) {
            Ok(path) => println!("  [{provider}] {}", path.display()),
            Err(_) => println!("  [{provider}] not found"),
        }
    }
    Ok(())
}

async fn cmd_cron(
    _config: AgentConfig,
    paths: ductor_core::config::paths::DuctorPaths,
    action: CronCommands,
) -> Result<()> {
    let mut manager = ductor_core::cron::CronManager::new(paths.cron_jobs_path.clone());
    match action {
        CronCommands::List => {
            let jobs = manager.list_jobs();
            if jobs.is_empty() {
                println!("No cron jobs configured.");
            }
            for job in jobs {
                println!(
                    "{} {} — {} ({})",
                    if job.enabled { "[on] " } else { "[off]" },
                    job.id,
                    job.title,
                    job.schedule
                );
            }
        }
        CronCommands::Add {
            id,
            title,
            schedule,
            folder,
            instruction,
        } => {
            manager.add_job(CronJob {
                id: id.clone(),
                title,
                schedule,
                task_folder: folder,
                agent_instruction: instruction,
                ..Default::default()
            })?;
            println!("Added job {id}");
        }
        CronCommands::Remove { id } => {
            if manager.remove_job(&id) {
                println!("Removed job {id}");
            } else {
                println!("No job named {id}");
            }
        }
    }
    Ok(())
}
