//! In-process cron scheduler: watches `cron_jobs.json`, schedules and
//! executes jobs.
//!
//! On start every enabled job gets a timer task aimed at its next fire
//! time in the job's timezone. A watcher polls the JSON file's mtime every
//! 5 seconds and reschedules everything on change.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cli::codex_cache::CodexModelCache;
use crate::cli::param_resolver::{resolve_cli_config, TaskOverrides};
use crate::config::paths::DuctorPaths;
use crate::cron::execution::{
    build_cmd, enrich_instruction, parse_claude_result, parse_codex_result,
};
use crate::cron::{parse_schedule, CronJob, CronManager};
use crate::util::quiet_hours::check_quiet_hour;
use crate::SharedConfig;

const WATCH_INTERVAL: Duration = Duration::from_secs(5);

/// Callback signature: `(job_title, result_text, status)`.
pub type CronResultCallback =
    Arc<dyn Fn(String, String, String) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct CronObserver {
    paths: DuctorPaths,
    manager: Arc<Mutex<CronManager>>,
    config: SharedConfig,
    codex_cache: Arc<RwLock<CodexModelCache>>,
    on_result: Mutex<Option<CronResultCallback>>,
    scheduled: Mutex<HashMap<String, JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
    last_mtime: Mutex<Option<SystemTime>>,
    running: AtomicBool,
}

impl CronObserver {
    pub fn new(
        paths: DuctorPaths,
        manager: Arc<Mutex<CronManager>>,
        config: SharedConfig,
        codex_cache: Arc<RwLock<CodexModelCache>>,
    ) -> Self {
        Self {
            paths,
            manager,
            config,
            codex_cache,
            on_result: Mutex::new(None),
            scheduled: Mutex::new(HashMap::new()),
            watcher: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            last_mtime: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Set the callback invoked with each job result.
    pub fn set_result_handler(&self, handler: CronResultCallback) {
        *self.on_result.lock().expect("handler lock") = Some(handler);
    }

    /// Schedule all jobs and begin watching the jobs file.
    pub async fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        *self.cancel.lock().expect("cancel lock") = CancellationToken::new();
        self.update_mtime();
        self.schedule_all();

        let observer = Arc::clone(self);
        let cancel = self.cancel_token();
        *self.watcher.lock().expect("watcher lock") = Some(tokio::spawn(async move {
            observer.watch_loop(cancel).await;
        }));
        info!(
            jobs = self.scheduled.lock().expect("scheduled lock").len(),
            "CronObserver started"
        );
    }

    /// Cancel all scheduled jobs and the watcher.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel_token().cancel();
        if let Some(watcher) = self.watcher.lock().expect("watcher lock").take() {
            watcher.abort();
            let _ = watcher.await;
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut scheduled = self.scheduled.lock().expect("scheduled lock");
            scheduled.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.abort();
        }
        info!("CronObserver stopped");
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().expect("cancel lock").clone()
    }

    // ── File watcher ────────────────────────────────────────────────

    async fn watch_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Cron watcher cancelled");
                    return;
                }
                _ = tokio::time::sleep(WATCH_INTERVAL) => {}
            }
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            let Ok(meta) = std::fs::metadata(&self.paths.cron_jobs_path) else {
                continue;
            };
            let Ok(mtime) = meta.modified() else {
                continue;
            };
            let changed = {
                let mut last = self.last_mtime.lock().expect("mtime lock");
                if *last != Some(mtime) {
                    *last = Some(mtime);
                    true
                } else {
                    false
                }
            };
            if changed {
                self.manager.lock().expect("manager lock").reload();
                self.reschedule_all();
            }
        }
    }

    fn update_mtime(&self) {
        let mtime = std::fs::metadata(&self.paths.cron_jobs_path)
            .and_then(|m| m.modified())
            .ok();
        *self.last_mtime.lock().expect("mtime lock") = mtime;
    }

    // ── Scheduling ──────────────────────────────────────────────────

    fn schedule_all(self: &Arc<Self>) {
        let jobs = self.manager.lock().expect("manager lock").list_jobs();
        for job in jobs.into_iter().filter(|j| j.enabled) {
            self.schedule_job(job);
        }
    }

    fn reschedule_all(self: &Arc<Self>) {
        {
            let mut scheduled = self.scheduled.lock().expect("scheduled lock");
            for (_, handle) in scheduled.drain() {
                handle.abort();
            }
        }
        self.schedule_all();
        info!(
            jobs = self.scheduled.lock().expect("scheduled lock").len(),
            "Rescheduled cron jobs"
        );
    }

    /// Calculate the next fire time and spawn a timer task for one job.
    ///
    /// Timezone resolution: job timezone, then the global `user_timezone`
    /// config, then the host zone, then UTC -- so `0 9 * * *` means 09:00
    /// on the user's wall clock.
    fn schedule_job(self: &Arc<Self>, job: CronJob) {
        let schedule = match parse_schedule(&job.schedule) {
            Ok(schedule) => schedule,
            Err(err) => {
                warn!(job = %job.id, %err, "Invalid cron expression");
                return;
            }
        };
        let config = self.config.read().expect("config lock").clone();
        let tz = crate::config::resolve_user_timezone(if job.timezone.is_empty() {
            &config.user_timezone
        } else {
            &job.timezone
        });
        let Some(next) = schedule.upcoming(tz).next() else {
            warn!(job = %job.id, "Cron schedule has no upcoming fire time");
            return;
        };
        let delay = (next.with_timezone(&chrono::Utc) - chrono::Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        debug!(
            job = %job.id,
            next = %next.to_rfc3339(),
            delay_secs = delay.as_secs(),
            "Scheduled cron job"
        );

        let observer = Arc::clone(self);
        let cancel = self.cancel_token();
        let job_id = job.id.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            observer
                .scheduled
                .lock()
                .expect("scheduled lock")
                .remove(&job.id);
            observer.execute_job(&job.id).await;
            if observer.running.load(Ordering::SeqCst) {
                if let Some(current) = observer
                    .manager
                    .lock()
                    .expect("manager lock")
                    .get_job(&job.id)
                {
                    if current.enabled {
                        observer.schedule_job(current);
                    }
                }
            }
        });
        self.scheduled
            .lock()
            .expect("scheduled lock")
            .insert(job_id, handle);
    }

    // ── Execution ───────────────────────────────────────────────────

    /// Spawn a fresh one-shot CLI session in the job's task folder.
    async fn execute_job(&self, job_id: &str) {
        let Some(job) = self.manager.lock().expect("manager lock").get_job(job_id) else {
            return;
        };
        // Snapshot config once so a concurrent /model switch cannot
        // produce an inconsistent (model, provider) pair.
        let config = self.config.read().expect("config lock").clone();

        let (quiet, hour, _tz) = check_quiet_hour(
            job.quiet_start,
            job.quiet_end,
            &config.user_timezone,
            config.heartbeat.quiet_start,
            config.heartbeat.quiet_end,
        );
        if quiet {
            debug!(job = %job.id, hour, "Cron job skipped: quiet hours");
            return;
        }

        info!(job = %job.title, "Cron job starting");
        let t0 = Instant::now();

        let folder = self.paths.cron_task_folder(&job.task_folder);
        if !folder.is_dir() {
            error!(folder = %folder.display(), "Cron task folder missing");
            self.record_status(&job.id, "error:folder_missing");
            return;
        }

        let overrides = TaskOverrides {
            provider: job.provider.clone(),
            model: job.model.clone(),
            reasoning_effort: job.reasoning_effort.clone(),
            cli_parameters: job.cli_parameters.clone(),
        };
        let cache = self.codex_cache.read().expect("cache lock").clone();
        let exec_config = match resolve_cli_config(&config, Some(&cache), Some(&overrides)) {
            Ok(exec_config) => exec_config,
            Err(err) => {
                error!(job = %job.id, %err, "Cron parameter resolution failed");
                self.record_status(&job.id, "error:validation");
                return;
            }
        };

        let enriched = enrich_instruction(&job.agent_instruction, &job.task_folder);
        let Some(cmd) = build_cmd(&exec_config, &enriched) else {
            error!(provider = %exec_config.provider, job = %job.id, "CLI not found for cron job");
            self.record_status(&job.id, &format!("error:cli_not_found_{}", exec_config.provider));
            return;
        };

        let timeout = Duration::from_secs_f64(config.cli_timeout);
        debug!(
            cmd = %cmd[..cmd.len().min(3)].join(" "),
            cwd = %folder.display(),
            provider = %exec_config.provider,
            model = %exec_config.model,
            timeout_secs = timeout.as_secs(),
            "Cron subprocess"
        );

        let (status, result_text) =
            run_task_process(&cmd, &folder, timeout, &exec_config.provider).await;

        self.record_status(&job.id, &status);
        info!(
            job = %job.title,
            status = %status,
            duration_ms = t0.elapsed().as_millis() as u64,
            result = result_text.len(),
            "Cron job completed"
        );

        let callback = self.on_result.lock().expect("handler lock").clone();
        if let Some(callback) = callback {
            callback(job.title.clone(), result_text, status).await;
        }
    }

    fn record_status(&self, job_id: &str, status: &str) {
        self.manager
            .lock()
            .expect("manager lock")
            .update_run_status(job_id, status);
    }
}

/// Spawn a one-shot task process and wait with a timeout.
///
/// Returns `(status, result_text)`; shared with the webhook cron_task
/// dispatch.
pub(crate) async fn run_task_process(
    cmd: &[String],
    cwd: &std::path::Path,
    timeout: Duration,
    provider: &str,
) -> (String, String) {
    let mut command = tokio::process::Command::new(&cmd[0]);
    command
        .args(&cmd[1..])
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!(%err, cmd = %cmd[0], "Failed to spawn task process");
            return ("error:spawn_failed".into(), String::new());
        }
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            if !output.stderr.is_empty() {
                debug!(
                    stderr = %String::from_utf8_lossy(&output.stderr[..output.stderr.len().min(500)]),
                    "Task stderr"
                );
            }
            let result_text = if provider == "codex" {
                parse_codex_result(&output.stdout)
            } else {
                parse_claude_result(&output.stdout)
            };
            let status = if output.status.success() {
                "success".to_string()
            } else {
                format!("error:exit_{}", output.status.code().unwrap_or(-1))
            };
            (status, result_text)
        }
        Ok(Err(err)) => {
            error!(%err, "Task process failed");
            ("error:io".into(), String::new())
        }
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs(), "Task process timed out");
            (
                "error:timeout".into(),
                format!("[Task timed out after {}s]", timeout.as_secs()),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::paths::resolve_paths_at;
    use crate::config::AgentConfig;

    fn setup(dir: &tempfile::TempDir) -> (Arc<CronObserver>, Arc<Mutex<CronManager>>) {
        let paths = resolve_paths_at(dir.path());
        paths.ensure_dirs().unwrap();
        let manager = Arc::new(Mutex::new(CronManager::new(paths.cron_jobs_path.clone())));
        let config = Arc::new(RwLock::new(AgentConfig::default()));
        let cache = Arc::new(RwLock::new(CodexModelCache::default()));
        let observer = Arc::new(CronObserver::new(
            paths,
            Arc::clone(&manager),
            config,
            cache,
        ));
        (observer, manager)
    }

    #[tokio::test]
    async fn test_start_schedules_enabled_jobs_only() {
        let dir = tempfile::tempdir().unwrap();
        let (observer, manager) = setup(&dir);
        {
            let mut manager = manager.lock().unwrap();
            manager
                .add_job(CronJob {
                    id: "on".into(),
                    title: "On".into(),
                    schedule: "0 9 * * *".into(),
                    task_folder: "daily".into(),
                    agent_instruction: "x".into(),
                    ..Default::default()
                })
                .unwrap();
            manager
                .add_job(CronJob {
                    id: "off".into(),
                    title: "Off".into(),
                    schedule: "0 9 * * *".into(),
                    task_folder: "daily".into(),
                    agent_instruction: "x".into(),
                    enabled: false,
                    ..Default::default()
                })
                .unwrap();
        }

        observer.start().await;
        assert_eq!(observer.scheduled.lock().unwrap().len(), 1);
        observer.stop().await;
        assert!(observer.scheduled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_folder_records_error() {
        let dir = tempfile::tempdir().unwrap();
        let (observer, manager) = setup(&dir);
        manager
            .lock()
            .unwrap()
            .add_job(CronJob {
                id: "j1".into(),
                title: "J1".into(),
                schedule: "0 9 * * *".into(),
                task_folder: "does_not_exist".into(),
                agent_instruction: "x".into(),
                // Equal bounds disable quiet hours, keeping the test
                // independent of the wall clock.
                quiet_start: Some(0),
                quiet_end: Some(0),
                ..Default::default()
            })
            .unwrap();

        observer.execute_job("j1").await;
        let job = manager.lock().unwrap().get_job("j1").unwrap();
        assert_eq!(job.last_run_status.as_deref(), Some("error:folder_missing"));
    }

    #[tokio::test]
    async fn test_run_task_process_success_and_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            r#"echo '{"type":"result","result":"ok"}'"#.to_string(),
        ];
        let (status, text) =
            run_task_process(&cmd, dir.path(), Duration::from_secs(5), "claude").await;
        assert_eq!(status, "success");
        assert_eq!(text, "ok");

        let slow = vec!["sleep".to_string(), "5".to_string()];
        let (status, _) =
            run_task_process(&slow, dir.path(), Duration::from_millis(100), "claude").await;
        assert_eq!(status, "error:timeout");
    }
}
