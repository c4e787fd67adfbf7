//! Inbound message middleware: dedup, per-chat sequential lock, preemption.
//!
//! The chat transport (Telegram glue, out of scope here) calls
//! [`SequentialGate::handle`] for every inbound message. The gate enforces
//! strict FIFO execution per chat, drops duplicates, lets read-only quick
//! commands and abort triggers overtake the lock, and lets an abort drain
//! queued-but-not-yet-executing messages.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tracing::{debug, info};
use uuid::Uuid;

use crate::gateway::dedup::DedupeCache;

const MAX_LOCKS: usize = 1000;

/// Read-only commands that bypass the per-chat lock (and deduplication:
/// they are idempotent, so replaying one is harmless).
const QUICK_COMMANDS: &[&str] = &["/status", "/memory", "/cron", "/diagnose"];

/// Texts that trigger an abort of the chat's running work.
const ABORT_TRIGGERS: &[&str] = &["/stop", "stop"];

/// Strip an optional `@bot_name` suffix from a command token.
fn strip_bot_suffix<'a>(text: &'a str, bot_name: &str) -> &'a str {
    if bot_name.is_empty() {
        return text;
    }
    let suffix = format!("@{}", bot_name.to_lowercase());
    text.strip_suffix(suffix.as_str()).unwrap_or(text)
}

/// Return true if `text` is a read-only command that can bypass the lock.
pub fn is_quick_command(text: &str, bot_name: &str) -> bool {
    let cmd = text.trim().to_lowercase();
    let cmd = strip_bot_suffix(&cmd, bot_name);
    QUICK_COMMANDS.contains(&cmd)
}

/// Return true if `text` should abort the chat's running work.
pub fn is_abort_message(text: &str, bot_name: &str) -> bool {
    let cmd = text.trim().to_lowercase();
    let cmd = strip_bot_suffix(&cmd, bot_name);
    ABORT_TRIGGERS.contains(&cmd)
}

/// A message waiting behind a chat's sequential lock.
pub struct QueueEntry {
    pub entry_id: Uuid,
    pub chat_id: i64,
    pub message_id: i64,
    pub preview: String,
    cancelled: AtomicBool,
}

impl QueueEntry {
    fn new(chat_id: i64, message_id: i64, text: &str) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            chat_id,
            message_id,
            preview: text.chars().take(40).collect(),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Async callback invoked for abort triggers and quick commands before the
/// lock. Returns `true` when the message was fully handled.
pub type BypassHandler = Arc<dyn Fn(i64, String) -> BoxFuture<'static, bool> + Send + Sync>;

/// What the gate did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Ran the handler to completion under the chat lock.
    Handled,
    /// Dropped as a duplicate delivery.
    Duplicate,
    /// Consumed by the abort handler before the lock.
    Aborted,
    /// Consumed by the quick-command handler before the lock.
    QuickCommand,
    /// Cancelled by `/stop` while still queued; handler never ran.
    Cancelled,
}

/// Per-chat sequential processing with dedup and preemption.
pub struct SequentialGate {
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
    dedup: Mutex<DedupeCache>,
    queue: Mutex<HashMap<i64, Vec<Arc<QueueEntry>>>>,
    abort_handler: Mutex<Option<BypassHandler>>,
    quick_handler: Mutex<Option<BypassHandler>>,
    bot_name: String,
}

impl SequentialGate {
    pub fn new(bot_name: &str) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            dedup: Mutex::new(DedupeCache::default()),
            queue: Mutex::new(HashMap::new()),
            abort_handler: Mutex::new(None),
            quick_handler: Mutex::new(None),
            bot_name: bot_name.to_string(),
        }
    }

    /// Register the callback invoked for abort triggers before the lock.
    pub fn set_abort_handler(&self, handler: BypassHandler) {
        *self.abort_handler.lock().expect("handler lock") = Some(handler);
    }

    /// Register the callback for read-only commands dispatched before the lock.
    pub fn set_quick_command_handler(&self, handler: BypassHandler) {
        *self.quick_handler.lock().expect("handler lock") = Some(handler);
    }

    /// Return the per-chat lock, creating it if needed.
    ///
    /// When the table is full, unlocked entries are culled so the table
    /// stays bounded. Also used by webhook wake dispatch to queue behind
    /// active conversations.
    pub fn get_lock(&self, chat_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("locks table");
        if !locks.contains_key(&chat_id) && locks.len() >= MAX_LOCKS {
            let idle: Vec<i64> = locks
                .iter()
                .filter(|(_, lock)| lock.try_lock().is_ok())
                .map(|(id, _)| *id)
                .collect();
            for id in idle.iter().take(idle.len() / 2) {
                locks.remove(id);
            }
        }
        Arc::clone(locks.entry(chat_id).or_default())
    }

    /// Mark every queued entry for `chat_id` cancelled.
    ///
    /// Cancelled entries skip their handler when their turn comes, so a
    /// `/stop` drops all pending work without touching the current
    /// execution.
    pub fn drain_pending(&self, chat_id: i64) -> usize {
        let queue = self.queue.lock().expect("queue lock");
        let Some(entries) = queue.get(&chat_id) else {
            return 0;
        };
        for entry in entries {
            entry.cancel();
        }
        entries.len()
    }

    /// Number of queued (not yet executing) messages for a chat.
    pub fn pending_count(&self, chat_id: i64) -> usize {
        self.queue
            .lock()
            .expect("queue lock")
            .get(&chat_id)
            .map_or(0, |entries| entries.len())
    }

    /// Route one inbound message through abort/quick/dedup/lock.
    pub async fn handle<F, Fut>(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        handler: F,
    ) -> GateOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let trimmed = text.trim();

        if !trimmed.is_empty() && is_abort_message(trimmed, &self.bot_name) {
            let callback = self.abort_handler.lock().expect("handler lock").clone();
            if let Some(callback) = callback {
                debug!(
                    text = %trimmed.chars().take(40).collect::<String>(),
                    "Abort trigger detected"
                );
                let dropped = self.drain_pending(chat_id);
                if dropped > 0 {
                    info!(chat_id, dropped, "Dropped queued messages on abort");
                }
                if callback(chat_id, trimmed.to_string()).await {
                    return GateOutcome::Aborted;
                }
            }
        }

        if !trimmed.is_empty() && is_quick_command(trimmed, &self.bot_name) {
            let callback = self.quick_handler.lock().expect("handler lock").clone();
            if let Some(callback) = callback {
                debug!(cmd = trimmed, "Quick command bypass");
                if callback(chat_id, trimmed.to_string()).await {
                    return GateOutcome::QuickCommand;
                }
            }
        }

        if self.dedup.lock().expect("dedup lock").check((chat_id, message_id)) {
            debug!(message_id, "Message deduplicated");
            return GateOutcome::Duplicate;
        }

        let entry = Arc::new(QueueEntry::new(chat_id, message_id, trimmed));
        self.queue
            .lock()
            .expect("queue lock")
            .entry(chat_id)
            .or_default()
            .push(Arc::clone(&entry));

        let lock = self.get_lock(chat_id);
        let guard = lock.lock().await;
        self.remove_entry(&entry);

        if entry.is_cancelled() {
            debug!(chat_id, message_id, "Queued message cancelled, skipping");
            drop(guard);
            return GateOutcome::Cancelled;
        }

        handler().await;
        drop(guard);
        GateOutcome::Handled
    }

    fn remove_entry(&self, entry: &Arc<QueueEntry>) {
        let mut queue = self.queue.lock().expect("queue lock");
        if let Some(entries) = queue.get_mut(&entry.chat_id) {
            entries.retain(|e| e.entry_id != entry.entry_id);
            if entries.is_empty() {
                queue.remove(&entry.chat_id);
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_quick_command_matching() {
        assert!(is_quick_command("/status", ""));
        assert!(is_quick_command("  /MEMORY  ", ""));
        assert!(is_quick_command("/cron@ductor_bot", "ductor_bot"));
        assert!(!is_quick_command("/new", ""));
        assert!(!is_quick_command("status report please", ""));
    }

    #[test]
    fn test_abort_matching() {
        assert!(is_abort_message("/stop", ""));
        assert!(is_abort_message("STOP", ""));
        assert!(!is_abort_message("stop the presses", ""));
    }

    #[tokio::test]
    async fn test_sequential_execution_per_chat() {
        let gate = Arc::new(SequentialGate::new(""));
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for msg_id in 0..4 {
            let gate = Arc::clone(&gate);
            let running = Arc::clone(&running);
            let max_seen = Arc::clone(&max_seen);
            tasks.push(tokio::spawn(async move {
                gate.handle(1, msg_id, &format!("msg {msg_id}"), || async {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), GateOutcome::Handled);
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1, "handlers must not overlap");
    }

    #[tokio::test]
    async fn test_duplicate_dropped() {
        let gate = SequentialGate::new("");
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let count = Arc::clone(&count);
            gate.handle(1, 55, "hello", || async move {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_quick_command_bypasses_dedup_and_lock() {
        let gate = SequentialGate::new("");
        let quick_count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&quick_count);
        gate.set_quick_command_handler(Arc::new(move |_, _| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            })
        }));

        // Same message id twice: quick commands are exempt from dedup.
        for _ in 0..2 {
            let outcome = gate.handle(1, 77, "/status", || async {}).await;
            assert_eq!(outcome, GateOutcome::QuickCommand);
        }
        assert_eq!(quick_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_abort_drains_queue() {
        let gate = Arc::new(SequentialGate::new(""));
        gate.set_abort_handler(Arc::new(|_, _| Box::pin(async { true })));

        // Occupy the chat lock so the next message queues.
        let blocker = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                gate.handle(1, 1, "long task", || async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let queued = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.handle(1, 2, "queued work", || async {}).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(gate.pending_count(1), 1);

        let outcome = gate.handle(1, 3, "/stop", || async {}).await;
        assert_eq!(outcome, GateOutcome::Aborted);

        assert_eq!(blocker.await.unwrap(), GateOutcome::Handled);
        assert_eq!(queued.await.unwrap(), GateOutcome::Cancelled);
    }
}
