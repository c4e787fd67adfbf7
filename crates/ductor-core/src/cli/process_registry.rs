//! Centralized registry for active CLI subprocesses.
//!
//! Adapters register every spawned child with `(chat_id, label)` and mark it
//! exited once they reap it. The registry kills by pid so it never needs to
//! share ownership of the `tokio::process::Child` with the adapter that is
//! reading its pipes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

const SIGTERM_GRACE: Duration = Duration::from_secs(2);
const REAP_TIMEOUT: Duration = Duration::from_secs(5);
const REAP_POLL: Duration = Duration::from_millis(100);

/// A registered subprocess with metadata.
#[derive(Debug)]
pub struct TrackedProcess {
    id: u64,
    pub chat_id: i64,
    pub label: String,
    pub pid: Option<u32>,
    pub registered_at: SystemTime,
    exited: AtomicBool,
}

impl TrackedProcess {
    /// Mark the process as reaped. Called by the owning adapter after `wait`.
    pub fn mark_exited(&self) {
        self.exited.store(true, Ordering::SeqCst);
    }

    /// Whether the owning adapter has reaped the process.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    fn age_seconds(&self, now: SystemTime) -> f64 {
        now.duration_since(self.registered_at)
            .unwrap_or(Duration::ZERO)
            .as_secs_f64()
    }
}

#[derive(Default)]
struct RegistryInner {
    processes: HashMap<i64, Vec<Arc<TrackedProcess>>>,
    aborted: HashSet<i64>,
}

/// Global registry of active CLI subprocesses, keyed by chat id.
#[derive(Default)]
pub struct ProcessRegistry {
    inner: Mutex<RegistryInner>,
    next_id: AtomicU64,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subprocess. Returns the tracking handle.
    pub fn register(&self, chat_id: i64, pid: Option<u32>, label: &str) -> Arc<TrackedProcess> {
        let tracked = Arc::new(TrackedProcess {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            chat_id,
            label: label.to_string(),
            pid,
            registered_at: SystemTime::now(),
            exited: AtomicBool::new(false),
        });
        let mut inner = self.inner.lock().expect("registry lock");
        inner
            .processes
            .entry(chat_id)
            .or_default()
            .push(Arc::clone(&tracked));
        debug!(chat_id, label, pid = ?pid, "Process registered");
        tracked
    }

    /// Remove a tracked process (idempotent).
    pub fn unregister(&self, tracked: &Arc<TrackedProcess>) {
        let mut inner = self.inner.lock().expect("registry lock");
        let Some(entries) = inner.processes.get_mut(&tracked.chat_id) else {
            return;
        };
        let before = entries.len();
        entries.retain(|e| e.id != tracked.id);
        if entries.len() == before {
            return;
        }
        if entries.is_empty() {
            inner.processes.remove(&tracked.chat_id);
        }
        debug!(
            chat_id = tracked.chat_id,
            label = %tracked.label,
            pid = ?tracked.pid,
            "Process unregistered"
        );
    }

    /// Kill every active process for `chat_id`. Returns the count signalled.
    ///
    /// Also marks the chat aborted so in-flight dispatch loops suppress
    /// their output on the next iteration.
    pub async fn kill_all(&self, chat_id: i64) -> usize {
        let entries = {
            let mut inner = self.inner.lock().expect("registry lock");
            inner.aborted.insert(chat_id);
            inner.processes.remove(&chat_id).unwrap_or_default()
        };
        if entries.is_empty() {
            return 0;
        }
        kill_processes(&entries).await
    }

    /// Check whether `chat_id` has been aborted since the last clear.
    pub fn was_aborted(&self, chat_id: i64) -> bool {
        self.inner
            .lock()
            .expect("registry lock")
            .aborted
            .contains(&chat_id)
    }

    /// Clear the abort flag for `chat_id`.
    pub fn clear_abort(&self, chat_id: i64) {
        self.inner
            .lock()
            .expect("registry lock")
            .aborted
            .remove(&chat_id);
    }

    /// Return true if `chat_id` has at least one running subprocess.
    pub fn has_active(&self, chat_id: i64) -> bool {
        self.inner
            .lock()
            .expect("registry lock")
            .processes
            .get(&chat_id)
            .is_some_and(|entries| entries.iter().any(|e| !e.has_exited()))
    }

    /// Kill processes older than `max_age_seconds` of wall-clock time.
    ///
    /// Wall-clock (not monotonic) on purpose: the heartbeat uses this to
    /// reap processes stranded by an OS suspend/resume. Returns the count
    /// killed.
    pub async fn kill_stale(&self, max_age_seconds: f64) -> usize {
        let now = SystemTime::now();
        let stale: Vec<Arc<TrackedProcess>> = {
            let inner = self.inner.lock().expect("registry lock");
            inner
                .processes
                .values()
                .flatten()
                .filter(|tracked| {
                    !tracked.has_exited() && tracked.age_seconds(now) > max_age_seconds
                })
                .cloned()
                .collect()
        };
        if stale.is_empty() {
            return 0;
        }
        for tracked in &stale {
            warn!(
                pid = ?tracked.pid,
                label = %tracked.label,
                chat_id = tracked.chat_id,
                age = tracked.age_seconds(now) as u64,
                "Stale process"
            );
        }
        let killed = kill_processes(&stale).await;
        for tracked in &stale {
            self.unregister(tracked);
        }
        killed
    }
}

/// SIGTERM -> grace -> SIGKILL -> bounded reap for each process.
async fn kill_processes(entries: &[Arc<TrackedProcess>]) -> usize {
    let killed = send_signal(entries, Signal::Term);
    if killed == 0 {
        return 0;
    }
    tokio::time::sleep(SIGTERM_GRACE).await;
    send_signal(entries, Signal::Kill);
    reap(entries).await;
    info!(count = killed, "Killed CLI process(es)");
    killed
}

#[derive(Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

fn send_signal(entries: &[Arc<TrackedProcess>], signal: Signal) -> usize {
    let mut count = 0;
    for tracked in entries {
        if tracked.has_exited() {
            continue;
        }
        let Some(pid) = tracked.pid else {
            continue;
        };
        if signal_pid(pid, signal) {
            debug!(pid, label = %tracked.label, "Signal sent");
            count += 1;
        }
    }
    count
}

#[cfg(unix)]
fn signal_pid(pid: u32, signal: Signal) -> bool {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // ESRCH (already gone) is treated as a no-op, like ProcessLookupError.
    unsafe { libc::kill(pid as libc::pid_t, sig) == 0 }
}

#[cfg(not(unix))]
fn signal_pid(_pid: u32, _signal: Signal) -> bool {
    false
}

/// Wait (bounded) for the owning adapters to reap the killed processes.
async fn reap(entries: &[Arc<TrackedProcess>]) {
    for tracked in entries {
        let deadline = tokio::time::Instant::now() + REAP_TIMEOUT;
        while !tracked.has_exited() {
            if tokio::time::Instant::now() >= deadline {
                warn!(pid = ?tracked.pid, "Process did not exit after SIGKILL");
                break;
            }
            tokio::time::sleep(REAP_POLL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_unregister_idempotent() {
        let registry = ProcessRegistry::new();
        let tracked = registry.register(1, None, "main");
        assert!(registry.has_active(1));

        registry.unregister(&tracked);
        assert!(!registry.has_active(1));
        // Double-unregister is a no-op.
        registry.unregister(&tracked);
        assert!(!registry.has_active(1));
    }

    #[tokio::test]
    async fn test_kill_all_sets_abort_and_clears_chat() {
        let registry = ProcessRegistry::new();
        let tracked = registry.register(7, None, "main");
        tracked.mark_exited();

        let killed = registry.kill_all(7).await;
        assert_eq!(killed, 0, "already-exited entries are not signalled");
        assert!(registry.was_aborted(7));
        assert!(!registry.has_active(7));

        registry.clear_abort(7);
        assert!(!registry.was_aborted(7));
    }

    #[tokio::test]
    async fn test_kill_all_empty_chat() {
        let registry = ProcessRegistry::new();
        assert_eq!(registry.kill_all(42).await, 0);
        assert!(registry.was_aborted(42));
    }

    #[tokio::test]
    async fn test_kill_all_terminates_live_process() {
        let registry = ProcessRegistry::new();
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        let tracked = registry.register(3, child.id(), "main");

        // Reap in the background, like an adapter would.
        let reaper = {
            let tracked = Arc::clone(&tracked);
            tokio::spawn(async move {
                let _ = child.wait().await;
                tracked.mark_exited();
            })
        };

        let killed = registry.kill_all(3).await;
        assert_eq!(killed, 1);
        assert!(!registry.has_active(3));
        assert!(registry.was_aborted(3));
        reaper.await.unwrap();
        assert!(tracked.has_exited());
    }

    #[tokio::test]
    async fn test_has_active_tracks_exit() {
        let registry = ProcessRegistry::new();
        let tracked = registry.register(9, Some(12345), "label");
        assert!(registry.has_active(9));
        tracked.mark_exited();
        assert!(!registry.has_active(9));
    }

    #[tokio::test]
    async fn test_kill_stale_skips_young_processes() {
        let registry = ProcessRegistry::new();
        let _tracked = registry.register(5, Some(99999), "young");
        let killed = registry.kill_stale(3600.0).await;
        assert_eq!(killed, 0);
        assert!(registry.has_active(5));
    }
}
