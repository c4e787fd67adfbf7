//! Cleanup observer: daily removal of old files from workspace directories.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use chrono::Timelike;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::paths::DuctorPaths;
use crate::config::resolve_user_timezone;
use crate::SharedConfig;

// Re-check every hour whether it's time to run.
const CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Delete top-level files older than `max_age_days` from `directory`.
///
/// Non-recursive on purpose: subdirectories are left untouched. Returns
/// the number of deleted files.
fn delete_old_files(directory: &Path, max_age_days: u64) -> usize {
    let Ok(entries) = std::fs::read_dir(directory) else {
        return 0;
    };
    let cutoff = SystemTime::now() - Duration::from_secs(max_age_days * 86_400);
    let mut deleted = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let old = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(|mtime| mtime < cutoff)
            .unwrap_or(false);
        if old {
            match std::fs::remove_file(&path) {
                Ok(()) => deleted += 1,
                Err(_) => warn!(path = %path.display(), "Failed to delete"),
            }
        }
    }
    deleted
}

/// Runs daily file cleanup for `telegram_files/` and `output_to_user/`.
///
/// Same lifecycle pattern as the heartbeat observer: `start()`/`stop()`
/// around a background task; each tick is exception-tolerant.
pub struct CleanupObserver {
    config: SharedConfig,
    paths: DuctorPaths,
    task: Mutex<Option<JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
    running: AtomicBool,
    last_run_date: Mutex<String>,
}

impl CleanupObserver {
    pub fn new(config: SharedConfig, paths: DuctorPaths) -> Self {
        Self {
            config,
            paths,
            task: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
            last_run_date: Mutex::new(String::new()),
        }
    }

    /// Start the cleanup background loop.
    pub async fn start(self: &Arc<Self>) {
        let cleanup = self.config.read().expect("config lock").cleanup.clone();
        if !cleanup.enabled {
            info!("File cleanup disabled in config");
            return;
        }
        self.running.store(true, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        *self.cancel.lock().expect("cancel lock") = cancel.clone();

        let observer = Arc::clone(self);
        *self.task.lock().expect("task lock") = Some(tokio::spawn(async move {
            observer.run_loop(cancel).await;
        }));
        info!(
            telegram_files_days = cleanup.telegram_files_days,
            output_to_user_days = cleanup.output_to_user_days,
            check_hour = cleanup.check_hour,
            "File cleanup started"
        );
    }

    /// Stop the cleanup background loop.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel.lock().expect("cancel lock").cancel();
        if let Some(task) = self.task.lock().expect("task lock").take() {
            task.abort();
            let _ = task.await;
        }
        info!("File cleanup stopped");
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Cleanup loop cancelled");
                    return;
                }
                _ = tokio::time::sleep(CHECK_INTERVAL) => {}
            }
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            self.maybe_run().await;
        }
    }

    /// Run cleanup when the hour matches and it has not run today.
    async fn maybe_run(&self) {
        let config = self.config.read().expect("config lock").clone();
        if !config.cleanup.enabled {
            return;
        }
        let tz = resolve_user_timezone(&config.user_timezone);
        let now = chrono::Utc::now().with_timezone(&tz);
        let today = now.format("%Y-%m-%d").to_string();

        if now.hour() != config.cleanup.check_hour {
            return;
        }
        {
            let mut last = self.last_run_date.lock().expect("date lock");
            if *last == today {
                return;
            }
            *last = today;
        }
        self.execute().await;
    }

    /// Perform the deletion in a worker thread to keep the loop responsive.
    async fn execute(&self) {
        let config = self.config.read().expect("config lock").clone();
        let telegram_dir = self.paths.telegram_files_dir.clone();
        let output_dir = self.paths.output_to_user_dir.clone();

        let result = tokio::task::spawn_blocking(move || {
            run_cleanup(
                &telegram_dir,
                config.cleanup.telegram_files_days,
                &output_dir,
                config.cleanup.output_to_user_days,
            )
        })
        .await;

        match result {
            Ok((telegram_deleted, output_deleted)) if telegram_deleted + output_deleted > 0 => {
                info!(
                    telegram_files = telegram_deleted,
                    output_to_user = output_deleted,
                    "Cleanup complete"
                );
            }
            Ok(_) => debug!("Cleanup: nothing to delete"),
            Err(err) => warn!(%err, "Cleanup task failed"),
        }
    }
}

fn run_cleanup(
    telegram_dir: &PathBuf,
    telegram_days: u64,
    output_dir: &PathBuf,
    output_days: u64,
) -> (usize, usize) {
    (
        delete_old_files(telegram_dir, telegram_days),
        delete_old_files(output_dir, output_days),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_old_files_spares_fresh_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let fresh = dir.path().join("fresh.txt");
        std::fs::write(&fresh, "new").unwrap();
        let subdir = dir.path().join("keep_me");
        std::fs::create_dir(&subdir).unwrap();

        // Nothing is older than 1 day, so nothing is deleted.
        assert_eq!(delete_old_files(dir.path(), 1), 0);
        assert!(fresh.exists());
        assert!(subdir.exists());

        // With a zero-day cutoff every top-level file is stale.
        assert_eq!(delete_old_files(dir.path(), 0), 1);
        assert!(!fresh.exists());
        assert!(subdir.exists(), "subdirectories are never touched");
    }

    #[test]
    fn test_delete_missing_directory_is_noop() {
        assert_eq!(delete_old_files(Path::new("/nonexistent/ductor"), 1), 0);
    }
}
