//! Webhook ingress: registered HTTP endpoints triggering agent work.
//!
//! - [`models`] — entry definitions, dispatch results, template rendering
//! - [`auth`] — bearer/HMAC validation and rate limiting
//! - [`server`] — the axum HTTP ingress
//! - [`observer`] — lifecycle, file watching, and dispatch

pub mod auth;
pub mod models;
pub mod observer;
pub mod server;

use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::DuctorError;
use crate::webhook::models::WebhookEntry;

#[derive(Debug, Default, Serialize, Deserialize)]
struct WebhookStore {
    hooks: Vec<WebhookEntry>,
}

/// Manages webhook entries with atomic JSON persistence.
pub struct WebhookManager {
    hooks_path: PathBuf,
    hooks: Vec<WebhookEntry>,
}

impl WebhookManager {
    pub fn new(hooks_path: PathBuf) -> Self {
        let hooks = load_hooks(&hooks_path);
        Self { hooks_path, hooks }
    }

    pub fn add_hook(&mut self, hook: WebhookEntry) -> Result<(), DuctorError> {
        if self.hooks.iter().any(|h| h.id == hook.id) {
            return Err(DuctorError::Webhook(format!(
                "Hook '{}' already exists",
                hook.id
            )));
        }
        if hook.mode == "cron_task" && hook.task_folder.is_none() {
            return Err(DuctorError::Webhook(
                "cron_task hooks require a task_folder".into(),
            ));
        }
        info!(id = %hook.id, mode = %hook.mode, "Webhook added");
        self.hooks.push(hook);
        self.save();
        Ok(())
    }

    pub fn remove_hook(&mut self, hook_id: &str) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|h| h.id != hook_id);
        if self.hooks.len() == before {
            return false;
        }
        self.save();
        info!(id = hook_id, "Webhook removed");
        true
    }

    pub fn list_hooks(&self) -> Vec<WebhookEntry> {
        self.hooks.clone()
    }

    pub fn get_hook(&self, hook_id: &str) -> Option<WebhookEntry> {
        self.hooks.iter().find(|h| h.id == hook_id).cloned()
    }

    /// Record a trigger: bump the counter, stamp the time, store the error
    /// (`None` clears it).
    pub fn record_trigger(&mut self, hook_id: &str, error: Option<&str>) {
        let Some(hook) = self.hooks.iter_mut().find(|h| h.id == hook_id) else {
            return;
        };
        hook.trigger_count += 1;
        hook.last_triggered_at = Some(Utc::now().to_rfc3339());
        hook.last_error = error.map(|e| e.to_string());
        self.save();
    }

    /// Re-read hooks from disk (called by the observer on file change).
    pub fn reload(&mut self) {
        self.hooks = load_hooks(&self.hooks_path);
    }

    fn save(&self) {
        if let Err(err) = save_hooks(&self.hooks_path, &self.hooks) {
            warn!(%err, "Failed to persist webhooks");
        }
    }
}

fn load_hooks(path: &PathBuf) -> Vec<WebhookEntry> {
    let raw = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return Vec::new(),
    };
    match serde_json::from_str::<WebhookStore>(&raw) {
        Ok(store) => store.hooks,
        Err(_) => {
            warn!(path = %path.display(), "Corrupt webhooks file");
            Vec::new()
        }
    }
}

fn save_hooks(path: &PathBuf, hooks: &[WebhookEntry]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = WebhookStore {
        hooks: hooks.to_vec(),
    };
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(&store)? + "\n")?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook(id: &str) -> WebhookEntry {
        WebhookEntry {
            id: id.into(),
            title: format!("Hook {id}"),
            prompt_template: "Do {{msg}}".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_crud_and_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("webhooks.json");
        {
            let mut manager = WebhookManager::new(path.clone());
            manager.add_hook(hook("h1")).unwrap();
            assert!(manager.add_hook(hook("h1")).is_err());
            manager.record_trigger("h1", None);
            manager.record_trigger("h1", Some("error:timeout"));
        }
        let manager = WebhookManager::new(path);
        let loaded = manager.get_hook("h1").unwrap();
        assert_eq!(loaded.trigger_count, 2);
        assert_eq!(loaded.last_error.as_deref(), Some("error:timeout"));
    }

    #[test]
    fn test_cron_task_requires_folder() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = WebhookManager::new(dir.path().join("webhooks.json"));
        let mut bad = hook("h2");
        bad.mode = "cron_task".into();
        assert!(manager.add_hook(bad).is_err());
    }
}
