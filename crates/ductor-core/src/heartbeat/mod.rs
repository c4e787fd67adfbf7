//! Heartbeat observer: periodic background agent turns in the main session.
//!
//! The orchestrator injects three capabilities at wiring time (the
//! heartbeat turn itself, a busy check, and the stale-process reaper) so
//! the observer never holds a back-pointer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use chrono::Timelike;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::resolve_user_timezone;
use crate::util::quiet_hours::is_quiet_hour;
use crate::SharedConfig;

/// Callback signature: `(chat_id, alert_text)`.
pub type HeartbeatResultCallback =
    Arc<dyn Fn(i64, String) -> BoxFuture<'static, ()> + Send + Sync>;
/// Executes one heartbeat turn; `None` means nothing worth saying.
pub type HeartbeatHandler = Arc<dyn Fn(i64) -> BoxFuture<'static, Option<String>> + Send + Sync>;
/// Returns true when a chat has active CLI processes.
pub type BusyCheck = Arc<dyn Fn(i64) -> bool + Send + Sync>;
/// Kills stale CLI processes; returns the count killed.
pub type StaleCleanup = Arc<dyn Fn() -> BoxFuture<'static, usize> + Send + Sync>;

/// Sends periodic heartbeat prompts through the main session.
pub struct HeartbeatObserver {
    config: SharedConfig,
    on_result: Mutex<Option<HeartbeatResultCallback>>,
    handle_heartbeat: Mutex<Option<HeartbeatHandler>>,
    is_chat_busy: Mutex<Option<BusyCheck>>,
    stale_cleanup: Mutex<Option<StaleCleanup>>,
    task: Mutex<Option<JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
    running: AtomicBool,
}

impl HeartbeatObserver {
    pub fn new(config: SharedConfig) -> Self {
        Self {
            config,
            on_result: Mutex::new(None),
            handle_heartbeat: Mutex::new(None),
            is_chat_busy: Mutex::new(None),
            stale_cleanup: Mutex::new(None),
            task: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn set_result_handler(&self, handler: HeartbeatResultCallback) {
        *self.on_result.lock().expect("handler lock") = Some(handler);
    }

    pub fn set_heartbeat_handler(&self, handler: HeartbeatHandler) {
        *self.handle_heartbeat.lock().expect("handler lock") = Some(handler);
    }

    pub fn set_busy_check(&self, check: BusyCheck) {
        *self.is_chat_busy.lock().expect("handler lock") = Some(check);
    }

    pub fn set_stale_cleanup(&self, cleanup: StaleCleanup) {
        *self.stale_cleanup.lock().expect("handler lock") = Some(cleanup);
    }

    /// Start the heartbeat background loop.
    pub async fn start(self: &Arc<Self>) {
        let heartbeat_config = self.config.read().expect("config lock").heartbeat.clone();
        if !heartbeat_config.enabled {
            info!("Heartbeat disabled in config");
            return;
        }
        if self.handle_heartbeat.lock().expect("handler lock").is_none() {
            error!("Heartbeat handler not set, cannot start");
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
            interval_minutes = heartbeat_config.interval_minutes,
            quiet_start = heartbeat_config.quiet_start,
            quiet_end = heartbeat_config.quiet_end,
            "Heartbeat started"
        );
    }

    /// Stop the heartbeat background loop.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel.lock().expect("cancel lock").cancel();
        if let Some(task) = self.task.lock().expect("task lock").take() {
            task.abort();
            let _ = task.await;
        }
        info!("Heartbeat stopped");
    }

    /// Sleep -> check -> execute -> repeat.
    ///
    /// A wall-clock gap of more than twice the interval implies the host
    /// was suspended; that tick still runs (the stale reaper needs it).
    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut last_wall = SystemTime::now();
        loop {
            let interval = {
                let config = self.config.read().expect("config lock");
                Duration::from_secs(config.heartbeat.interval_minutes.max(1) * 60)
            };
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Heartbeat loop cancelled");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            if !self.running.load(Ordering::SeqCst) {
                return;
            }

            let now_wall = SystemTime::now();
            if let Ok(elapsed) = now_wall.duration_since(last_wall) {
                if elapsed > interval * 2 {
                    warn!(
                        elapsed_secs = elapsed.as_secs(),
                        expected_secs = interval.as_secs(),
                        "Wall-clock gap -- system likely suspended"
                    );
                }
            }
            last_wall = now_wall;

            self.tick().await;
        }
    }

    /// Run one heartbeat cycle for all allowed users.
    async fn tick(&self) {
        // Reap stale processes first (catches suspend hangovers).
        let cleanup = self.stale_cleanup.lock().expect("handler lock").clone();
        if let Some(cleanup) = cleanup {
            let killed = cleanup().await;
            if killed > 0 {
                info!(killed, "Cleaned up stale process(es)");
            }
        }

        let config = self.config.read().expect("config lock").clone();
        let tz = resolve_user_timezone(&config.user_timezone);
        let now_hour = chrono::Utc::now().with_timezone(&tz).hour();
        if is_quiet_hour(
            now_hour,
            config.heartbeat.quiet_start,
            config.heartbeat.quiet_end,
        ) {
            debug!(hour = now_hour, "Heartbeat skipped: quiet hours");
            return;
        }

        debug!(
            chats = config.allowed_user_ids.len(),
            "Heartbeat tick"
        );
        for &chat_id in &config.allowed_user_ids {
            self.run_for_chat(chat_id).await;
        }
    }

    /// Execute a single heartbeat for one chat.
    async fn run_for_chat(&self, chat_id: i64) {
        let busy_check = self.is_chat_busy.lock().expect("handler lock").clone();
        if busy_check.is_some_and(|busy| busy(chat_id)) {
            debug!(chat_id, "Heartbeat skipped: chat is busy");
            return;
        }

        let handler = self.handle_heartbeat.lock().expect("handler lock").clone();
        let Some(handler) = handler else {
            return;
        };

        let Some(alert_text) = handler(chat_id).await else {
            return;
        };

        let callback = self.on_result.lock().expect("handler lock").clone();
        if let Some(callback) = callback {
            callback(chat_id, alert_text).await;
        }
    }
}
