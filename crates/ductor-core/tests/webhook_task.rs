//! End-to-end webhook cron_task dispatch against a fake `claude` binary.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::sync::{Arc, Mutex, RwLock};

use ductor_core::cli::codex_cache::CodexModelCache;
use ductor_core::config::paths::resolve_paths_at;
use ductor_core::config::AgentConfig;
use ductor_core::webhook::models::WebhookEntry;
use ductor_core::webhook::observer::WebhookObserver;
use ductor_core::webhook::WebhookManager;

const FAKE_CLAUDE: &str = r#"#!/bin/sh
{
  echo "=== CALL ==="
  echo "cwd:$PWD"
  for a in "$@"; do printf '%s\n' "$a"; done
} >> "$DUCTOR_WEBHOOK_ARGV_LOG"
echo '{"type":"result","result":"task done","is_error":false}'
"#;

#[tokio::test]
async fn test_cron_task_dispatch_spawns_in_task_folder() {
    let bin_dir = tempfile::tempdir().unwrap();
    let home_dir = tempfile::tempdir().unwrap();

    let script = bin_dir.path().join("claude");
    std::fs::write(&script, FAKE_CLAUDE).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    let path = std::env::var("PATH").unwrap_or_default();
    std::env::set_var("PATH", format!("{}:{}", bin_dir.path().display(), path));

    let argv_log = home_dir.path().join("argv.log");
    std::env::set_var("DUCTOR_WEBHOOK_ARGV_LOG", &argv_log);

    let paths = resolve_paths_at(home_dir.path());
    paths.ensure_dirs().unwrap();
    let task_folder = paths.cron_task_folder("daily");
    std::fs::create_dir_all(&task_folder).unwrap();

    let manager = Arc::new(Mutex::new(WebhookManager::new(paths.webhooks_path.clone())));
    manager
        .lock()
        .unwrap()
        .add_hook(WebhookEntry {
            id: "h1".into(),
            title: "Daily build".into(),
            mode: "cron_task".into(),
            task_folder: Some("daily".into()),
            prompt_template: "Do {{msg}}".into(),
            // Equal bounds disable quiet hours for a clock-independent test.
            quiet_start: Some(0),
            quiet_end: Some(0),
            ..Default::default()
        })
        .unwrap();

    let observer = Arc::new(WebhookObserver::new(
        paths,
        Arc::clone(&manager),
        Arc::new(RwLock::new(AgentConfig::default())),
        Arc::new(RwLock::new(CodexModelCache::default())),
    ));

    let mut payload = serde_json::Map::new();
    payload.insert("msg".into(), serde_json::Value::String("build".into()));
    let result = observer.dispatch("h1", payload).await;

    assert_eq!(result.status, "success");
    assert_eq!(result.mode, "cron_task");
    assert_eq!(result.result_text, "task done");

    let log = std::fs::read_to_string(&argv_log).unwrap();
    assert!(log.contains("cwd:"), "the task process logged its cwd");
    assert!(
        log.contains("cron_tasks/daily"),
        "spawned inside the task folder"
    );
    // The rendered prompt is wrapped in the untrusted-input markers and
    // enriched with the task memory instructions.
    assert!(log.contains("Do build"));
    assert!(log.contains("EXTERNAL WEBHOOK PAYLOAD"));
    assert!(log.contains("daily_MEMORY.md"));
    assert!(log.contains("--no-session-persistence"));

    let hook = manager.lock().unwrap().get_hook("h1").unwrap();
    assert_eq!(hook.trigger_count, 1);
    assert!(hook.last_error.is_none());
    assert!(hook.last_triggered_at.is_some());
}
