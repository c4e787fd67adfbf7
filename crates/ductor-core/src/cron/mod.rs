//! Cron job management: JSON-based persistence.
//!
//! Jobs are stored in `cron_jobs.json`. The [`observer::CronObserver`]
//! watches the file for changes and schedules jobs in-process; this module
//! is responsible for data only.

pub mod execution;
pub mod observer;

use std::path::PathBuf;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::DuctorError;

/// A scheduled job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CronJob {
    pub id: String,
    pub title: String,
    pub description: String,
    /// POSIX-style cron expression (5 fields, minute resolution).
    pub schedule: String,
    /// Folder under the cron-tasks root the job runs in.
    pub task_folder: String,
    pub agent_instruction: String,
    pub enabled: bool,
    pub timezone: String,
    pub created_at: String,
    pub last_run_at: Option<String>,
    pub last_run_status: Option<String>,

    // Per-task execution overrides
    pub provider: Option<String>,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub cli_parameters: Vec<String>,

    // Quiet hours (None = global config defaults)
    pub quiet_start: Option<u32>,
    pub quiet_end: Option<u32>,

    /// Optional id of a job this one should run after (ordering hint).
    pub dependency: Option<String>,
}

impl Default for CronJob {
    fn default() -> Self {
        Self {
            id: String::new(),
            title: String::new(),
            description: String::new(),
            schedule: String::new(),
            task_folder: String::new(),
            agent_instruction: String::new(),
            enabled: true,
            timezone: String::new(),
            created_at: Utc::now().to_rfc3339(),
            last_run_at: None,
            last_run_status: None,
            provider: None,
            model: None,
            reasoning_effort: None,
            cli_parameters: Vec::new(),
            quiet_start: None,
            quiet_end: None,
            dependency: None,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CronStore {
    jobs: Vec<CronJob>,
}

/// Parse a cron expression, accepting the POSIX 5-field form.
///
/// The `cron` crate wants a seconds field; 5-field expressions get `0`
/// prepended so `0 9 * * *` means 09:00:00.
pub fn parse_schedule(expression: &str) -> Result<cron::Schedule, DuctorError> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| DuctorError::Cron(format!("Invalid cron expression '{expression}': {e}")))
}

/// Manages cron jobs with atomic JSON persistence.
pub struct CronManager {
    jobs_path: PathBuf,
    jobs: Vec<CronJob>,
}

impl CronManager {
    pub fn new(jobs_path: PathBuf) -> Self {
        let jobs = load_jobs(&jobs_path);
        Self { jobs_path, jobs }
    }

    /// Add a new job. Fails on duplicate id or invalid schedule.
    pub fn add_job(&mut self, job: CronJob) -> Result<(), DuctorError> {
        if self.jobs.iter().any(|j| j.id == job.id) {
            return Err(DuctorError::Cron(format!("Job '{}' already exists", job.id)));
        }
        parse_schedule(&job.schedule)?;
        info!(id = %job.id, schedule = %job.schedule, "Cron job added");
        self.jobs.push(job);
        self.save();
        Ok(())
    }

    /// Remove a job by id. Returns false when not found.
    pub fn remove_job(&mut self, job_id: &str) -> bool {
        let before = self.jobs.len();
        self.jobs.retain(|j| j.id != job_id);
        if self.jobs.len() == before {
            return false;
        }
        self.save();
        info!(id = job_id, "Cron job removed");
        true
    }

    pub fn list_jobs(&self) -> Vec<CronJob> {
        self.jobs.clone()
    }

    pub fn get_job(&self, job_id: &str) -> Option<CronJob> {
        self.jobs.iter().find(|j| j.id == job_id).cloned()
    }

    /// Update `last_run_at` and `last_run_status` for a job.
    pub fn update_run_status(&mut self, job_id: &str, status: &str) {
        let Some(job) = self.jobs.iter_mut().find(|j| j.id == job_id) else {
            return;
        };
        job.last_run_at = Some(Utc::now().to_rfc3339());
        job.last_run_status = Some(status.to_string());
        self.save();
    }

    /// Re-read jobs from disk (called by the observer on file change).
    pub fn reload(&mut self) {
        self.jobs = load_jobs(&self.jobs_path);
    }

    fn save(&self) {
        if let Err(err) = save_jobs(&self.jobs_path, &self.jobs) {
            warn!(%err, "Failed to persist cron jobs");
        }
    }
}

fn load_jobs(path: &PathBuf) -> Vec<CronJob> {
    let raw = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return Vec::new(),
    };
    let store: CronStore = match serde_json::from_str(&raw) {
        Ok(store) => store,
        Err(_) => {
            warn!(path = %path.display(), "Corrupt cron jobs file");
            return Vec::new();
        }
    };
    for job in &store.jobs {
        debug!(id = %job.id, title = %job.title, enabled = job.enabled, "Job loaded");
    }
    store.jobs
}

/// Atomic write: temp file then rename.
fn save_jobs(path: &PathBuf, jobs: &[CronJob]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = CronStore {
        jobs: jobs.to_vec(),
    };
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(&store)? + "\n")?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
