//! Filesystem layout under the ductor home directory.

use std::path::{Path, PathBuf};

/// Resolved locations of every file and directory the service touches.
#[derive(Debug, Clone)]
pub struct DuctorPaths {
    pub ductor_home: PathBuf,
    pub workspace: PathBuf,
    pub config_path: PathBuf,
    pub sessions_path: PathBuf,
    pub cron_jobs_path: PathBuf,
    pub webhooks_path: PathBuf,
    pub codex_models_path: PathBuf,
    pub cron_tasks_dir: PathBuf,
    pub telegram_files_dir: PathBuf,
    pub output_to_user_dir: PathBuf,
    pub mainmemory_path: PathBuf,
}

/// Expand a leading `~/` against the user's home directory.
fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest)
    } else {
        PathBuf::from(raw)
    }
}

/// Resolve all paths from the configured home directory (default `~/.ductor`).
pub fn resolve_paths(ductor_home: &str) -> DuctorPaths {
    let home = expand_home(if ductor_home.is_empty() {
        "~/.ductor"
    } else {
        ductor_home
    });
    let workspace = home.join("workspace");

    DuctorPaths {
        config_path: home.join("config.json"),
        sessions_path: home.join("sessions.json"),
        cron_jobs_path: home.join("cron_jobs.json"),
        webhooks_path: home.join("webhooks.json"),
        codex_models_path: home.join("codex_models.json"),
        cron_tasks_dir: workspace.join("cron_tasks"),
        telegram_files_dir: workspace.join("telegram_files"),
        output_to_user_dir: workspace.join("output_to_user"),
        mainmemory_path: workspace.join("memory_system").join("MAINMEMORY.md"),
        workspace,
        ductor_home: home,
    }
}

impl DuctorPaths {
    /// Create the workspace subtree if it does not exist yet.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            &self.ductor_home,
            &self.workspace,
            &self.cron_tasks_dir,
            &self.telegram_files_dir,
            &self.output_to_user_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        if let Some(parent) = self.mainmemory_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Read `MAINMEMORY.md`, returning an empty string when absent.
    pub fn read_mainmemory(&self) -> String {
        std::fs::read_to_string(&self.mainmemory_path).unwrap_or_default()
    }

    /// Resolve a cron task folder under `cron_tasks/`.
    pub fn cron_task_folder(&self, task_folder: &str) -> PathBuf {
        self.cron_tasks_dir.join(task_folder)
    }
}

/// Paths rooted at an explicit directory, for tests and embedded setups.
pub fn resolve_paths_at(home: &Path) -> DuctorPaths {
    resolve_paths(&home.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_under_home() {
        let paths = resolve_paths("/tmp/ductor-test-home");
        assert_eq!(paths.config_path, PathBuf::from("/tmp/ductor-test-home/config.json"));
        assert_eq!(
            paths.cron_tasks_dir,
            PathBuf::from("/tmp/ductor-test-home/workspace/cron_tasks")
        );
        assert!(paths.mainmemory_path.ends_with("memory_system/MAINMEMORY.md"));
    }

    #[test]
    fn test_tilde_expansion() {
        let paths = resolve_paths("~/.ductor");
        assert!(!paths.ductor_home.to_string_lossy().starts_with('~'));
    }
}
