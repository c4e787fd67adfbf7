//! Session lifecycle: creation, freshness checks, reset. JSON persistence.
//!
//! Each chat holds one [`Session`] with a per-provider sub-map so switching
//! providers never mixes conversation state: the active provider's
//! [`ProviderSession`] carries the opaque session id and the usage counters
//! for that provider's thread, and other providers' entries stay untouched.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{resolve_user_timezone, AgentConfig};
use crate::SharedConfig;

/// Per-provider thread state inside a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSession {
    /// Provider-assigned id; empty until the provider's first response.
    pub session_id: String,
    pub message_count: u64,
    pub total_cost_usd: f64,
    pub total_tokens: u64,
}

/// Active session state for one chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Session {
    pub chat_id: i64,
    pub provider: String,
    pub model: String,
    pub created_at: String,
    pub last_active: String,
    pub provider_sessions: BTreeMap<String, ProviderSession>,
}

impl Default for Session {
    fn default() -> Self {
        Session::new(0, "claude", "opus")
    }
}

impl Session {
    pub fn new(chat_id: i64, provider: &str, model: &str) -> Self {
        let now = Utc::now().to_rfc3339();
        let mut provider_sessions = BTreeMap::new();
        provider_sessions.insert(provider.to_string(), ProviderSession::default());
        Self {
            chat_id,
            provider: provider.to_string(),
            model: model.to_string(),
            created_at: now.clone(),
            last_active: now,
            provider_sessions,
        }
    }

    /// The active provider's thread state (created empty when absent).
    pub fn active(&self) -> ProviderSession {
        self.provider_sessions
            .get(&self.provider)
            .cloned()
            .unwrap_or_default()
    }

    pub fn active_mut(&mut self) -> &mut ProviderSession {
        self.provider_sessions
            .entry(self.provider.clone())
            .or_default()
    }

    /// The active provider's session id ("" until assigned).
    pub fn session_id(&self) -> String {
        self.active().session_id
    }

    pub fn set_session_id(&mut self, session_id: &str) {
        self.active_mut().session_id = session_id.to_string();
    }

    pub fn message_count(&self) -> u64 {
        self.active().message_count
    }
}

/// Accept a legacy flat record (`session_id`/`message_count` at the top
/// level) and migrate it into `provider_sessions[provider]`.
fn session_from_value(value: Value) -> Option<Session> {
    let mut session: Session = serde_json::from_value(value.clone()).ok()?;
    let has_map = value
        .get("provider_sessions")
        .and_then(Value::as_object)
        .is_some_and(|m| !m.is_empty());
    if !has_map {
        if let Some(flat_sid) = value.get("session_id").and_then(Value::as_str) {
            let migrated = ProviderSession {
                session_id: flat_sid.to_string(),
                message_count: value
                    .get("message_count")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                total_cost_usd: value
                    .get("total_cost_usd")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0),
                total_tokens: value
                    .get("total_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
            };
            session
                .provider_sessions
                .insert(session.provider.clone(), migrated);
            debug!(chat_id = session.chat_id, "Migrated legacy session record");
        }
    }
    Some(session)
}

/// Manages session lifecycle with JSON file persistence.
///
/// All mutations are serialized by one store-wide lock; two concurrent
/// `update_session` calls for the same chat cannot lose an update.
pub struct SessionStore {
    path: PathBuf,
    config: SharedConfig,
    lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(sessions_path: PathBuf, config: SharedConfig) -> Self {
        Self {
            path: sessions_path,
            config,
            lock: Mutex::new(()),
        }
    }

    fn config_snapshot(&self) -> AgentConfig {
        self.config.read().expect("config lock").clone()
    }

    /// Resolve the session for a chat. Returns `(session, is_new)`.
    ///
    /// Reuses a fresh session (switching provider/model in place as
    /// needed); creates a new one when absent or stale.
    pub async fn resolve_session(
        &self,
        chat_id: i64,
        provider: &str,
        model: &str,
    ) -> (Session, bool) {
        let config = self.config_snapshot();
        let mut sessions = self.load().await;
        let key = chat_id.to_string();

        if let Some(existing) = sessions.get_mut(&key) {
            if is_fresh(existing, &config) {
                if existing.provider != provider {
                    info!(
                        from = %existing.provider,
                        to = provider,
                        "Provider switch, resetting incoming provider slot"
                    );
                    existing
                        .provider_sessions
                        .insert(provider.to_string(), ProviderSession::default());
                    existing.provider = provider.to_string();
                    existing.model = model.to_string();
                    let session = existing.clone();
                    self.save(&sessions).await;
                    return (session, true);
                }
                if existing.model != model {
                    existing.model = model.to_string();
                    let session = existing.clone();
                    self.save(&sessions).await;
                    return (session.clone(), session.session_id().is_empty());
                }
                let session = existing.clone();
                return (session.clone(), session.session_id().is_empty());
            }
        }

        let session = Session::new(chat_id, provider, model);
        sessions.insert(key, session.clone());
        self.save(&sessions).await;
        info!(provider, model, "Session created");
        (session, true)
    }

    /// Return the current session for a chat without creating one.
    pub async fn get_active(&self, chat_id: i64) -> Option<Session> {
        self.load().await.remove(&chat_id.to_string())
    }

    /// Force-create a new session (empty id, filled by the CLI on first call).
    ///
    /// Clears *all* provider slots for the chat.
    pub async fn reset_session(&self, chat_id: i64, provider: &str, model: &str) -> Session {
        let _guard = self.lock.lock().await;
        let mut sessions = self.load().await;
        let session = Session::new(chat_id, provider, model);
        sessions.insert(chat_id.to_string(), session.clone());
        self.save(&sessions).await;
        info!(chat_id, "Session reset");
        session
    }

    /// Clear only the named provider's slot, keeping the others intact.
    pub async fn reset_provider_session(&self, chat_id: i64, provider: &str) {
        let _guard = self.lock.lock().await;
        let mut sessions = self.load().await;
        if let Some(session) = sessions.get_mut(&chat_id.to_string()) {
            session
                .provider_sessions
                .insert(provider.to_string(), ProviderSession::default());
            self.save(&sessions).await;
            info!(chat_id, provider, "Provider session reset");
        }
    }

    /// Update session metrics and persist.
    ///
    /// Serialized via the store lock to prevent lost-update races when
    /// concurrent callers (heartbeat + normal flow) touch the same chat.
    /// Identity fields (session id, provider, model) come from the caller;
    /// counters come from the latest persisted record so a concurrent
    /// update is never overwritten. The caller's reference is synced with
    /// the aggregated values before returning.
    pub async fn update_session(&self, session: &mut Session, cost_usd: f64, tokens: u64) {
        let _guard = self.lock.lock().await;
        let mut sessions = self.load().await;
        let key = session.chat_id.to_string();

        let mut current = sessions.remove(&key).unwrap_or_else(|| session.clone());
        current.provider = session.provider.clone();
        current.model = session.model.clone();
        let caller_sid = session.session_id();
        {
            let active = current.active_mut();
            active.session_id = caller_sid;
            active.message_count += 1;
            active.total_cost_usd += cost_usd;
            active.total_tokens += tokens;
        }
        current.last_active = Utc::now().to_rfc3339();
        sessions.insert(key, current.clone());
        self.save(&sessions).await;

        // Keep the caller's reference in sync with the persisted aggregate.
        session.last_active = current.last_active.clone();
        session.provider_sessions = current.provider_sessions;
    }

    /// Persist a provider/model change without touching activity counters.
    pub async fn sync_session_target(
        &self,
        session: &mut Session,
        provider: Option<&str>,
        model: Option<&str>,
    ) {
        let _guard = self.lock.lock().await;
        let mut sessions = self.load().await;
        let key = session.chat_id.to_string();
        let Some(current) = sessions.get_mut(&key) else {
            return;
        };

        let mut changed = false;
        if let Some(provider) = provider {
            if current.provider != provider {
                current.provider = provider.to_string();
                current.provider_sessions
                    .entry(provider.to_string())
                    .or_default();
                changed = true;
            }
        }
        if let Some(model) = model {
            if current.model != model {
                current.model = model.to_string();
                changed = true;
            }
        }
        if !changed {
            return;
        }

        session.provider = current.provider.clone();
        session.model = current.model.clone();
        let snapshot = sessions.clone();
        self.save(&snapshot).await;
    }

    // ── Persistence ─────────────────────────────────────────────────

    async fn load(&self) -> HashMap<String, Session> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || load_sync(&path))
            .await
            .unwrap_or_default()
    }

    async fn save(&self, sessions: &HashMap<String, Session>) {
        let path = self.path.clone();
        let sessions = sessions.clone();
        let result = tokio::task::spawn_blocking(move || save_sync(&path, &sessions)).await;
        if let Ok(Err(err)) = result {
            warn!(%err, "Failed to persist sessions");
        }
    }
}

fn load_sync(path: &PathBuf) -> HashMap<String, Session> {
    let raw = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return HashMap::new(),
    };
    let data: HashMap<String, Value> = match serde_json::from_str(&raw) {
        Ok(map) => map,
        Err(_) => {
            warn!("Corrupt sessions file, starting fresh");
            return HashMap::new();
        }
    };
    data.into_iter()
        .filter_map(|(key, value)| session_from_value(value).map(|s| (key, s)))
        .collect()
}

/// Atomic write: temp file in the same directory, then rename over.
fn save_sync(path: &PathBuf, sessions: &HashMap<String, Session>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(sessions)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Freshness rules: message cap, idle timeout, daily reset boundary.
pub fn is_fresh(session: &Session, config: &AgentConfig) -> bool {
    let now = Utc::now();
    let last = match DateTime::parse_from_rfc3339(&session.last_active) {
        Ok(parsed) => parsed.with_timezone(&Utc),
        Err(_) => {
            warn!(
                last_active = %session.last_active,
                "Corrupt session timestamp, treating as stale"
            );
            return false;
        }
    };

    if let Some(max_messages) = config.max_session_messages {
        if session.message_count() >= max_messages {
            debug!("Session fresh check: fresh=no reason=max_messages");
            return false;
        }
    }

    if config.idle_timeout_minutes > 0 {
        let idle_seconds = (now - last).num_seconds();
        if idle_seconds >= config.idle_timeout_minutes as i64 * 60 {
            debug!("Session fresh check: fresh=no reason=idle_timeout");
            return false;
        }
    }

    if config.daily_reset_enabled {
        let tz = resolve_user_timezone(&config.user_timezone);
        let now_local = now.with_timezone(&tz);
        let last_local = last.with_timezone(&tz);
        let today_reset = now_local
            .with_hour(config.daily_reset_hour)
            .and_then(|t| t.with_minute(0))
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0));
        if let Some(today_reset) = today_reset {
            let crossed_reset = if now_local >= today_reset {
                // Today's reset boundary has passed; stale if the session
                // predates it.
                last_local < today_reset
            } else {
                // Today's reset hasn't occurred yet; compare against
                // yesterday's boundary so sessions surviving one day's
                // boundary still roll over.
                last_local < today_reset - ChronoDuration::days(1)
            };
            if crossed_reset {
                debug!("Session fresh check: fresh=no reason=daily_reset");
                return false;
            }
        }
    }

    debug!("Session fresh check: fresh=yes reason=still_valid");
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, RwLock};

    fn shared_config(config: AgentConfig) -> SharedConfig {
        Arc::new(RwLock::new(config))
    }

    fn store(dir: &tempfile::TempDir, config: AgentConfig) -> SessionStore {
        SessionStore::new(dir.path().join("sessions.json"), shared_config(config))
    }

    #[tokio::test]
    async fn test_resolve_creates_new_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, AgentConfig::default());

        let (session, is_new) = store.resolve_session(1, "claude", "opus").await;
        assert!(is_new);
        assert_eq!(session.provider, "claude");
        assert_eq!(session.session_id(), "");
    }

    #[tokio::test]
    async fn test_resolve_resumes_after_id_assigned() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, AgentConfig::default());

        let (mut session, _) = store.resolve_session(1, "claude", "opus").await;
        session.set_session_id("S1");
        store.update_session(&mut session, 0.01, 100).await;

        let (session, is_new) = store.resolve_session(1, "claude", "opus").await;
        assert!(!is_new);
        assert_eq!(session.session_id(), "S1");
        assert_eq!(session.message_count(), 1);
    }

    #[tokio::test]
    async fn test_provider_switch_resets_only_incoming_slot() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, AgentConfig::default());

        let (mut session, _) = store.resolve_session(1, "claude", "opus").await;
        session.set_session_id("S1");
        store.update_session(&mut session, 0.0, 10).await;

        let (session, is_new) = store
            .resolve_session(1, "codex", "gpt-5.2-codex")
            .await;
        assert!(is_new);
        assert_eq!(session.provider, "codex");
        assert_eq!(session.session_id(), "");
        // Claude slot untouched.
        assert_eq!(session.provider_sessions["claude"].session_id, "S1");
        assert_eq!(session.provider_sessions["claude"].message_count, 1);
    }

    #[tokio::test]
    async fn test_reset_provider_session_clears_exactly_one() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, AgentConfig::default());

        let (mut session, _) = store.resolve_session(1, "claude", "opus").await;
        session.set_session_id("S1");
        store.update_session(&mut session, 0.0, 10).await;
        let (mut session, _) = store.resolve_session(1, "codex", "gpt-5.2-codex").await;
        session.set_session_id("T1");
        store.update_session(&mut session, 0.0, 10).await;

        store.reset_provider_session(1, "codex").await;
        let session = store.get_active(1).await.unwrap();
        assert_eq!(session.provider_sessions["codex"], ProviderSession::default());
        assert_eq!(session.provider_sessions["claude"].session_id, "S1");

        // reset_session clears all slots.
        store.reset_session(1, "claude", "opus").await;
        let session = store.get_active(1).await.unwrap();
        assert_eq!(session.provider_sessions.len(), 1);
        assert_eq!(session.session_id(), "");
    }

    #[tokio::test]
    async fn test_update_preserves_counters_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, AgentConfig::default());

        let (mut a, _) = store.resolve_session(1, "claude", "opus").await;
        a.set_session_id("S1");
        let mut b = a.clone();

        store.update_session(&mut a, 0.01, 100).await;
        // `b` was resolved before `a` persisted; its counter must not
        // clobber the one already on disk.
        store.update_session(&mut b, 0.02, 200).await;

        assert_eq!(b.message_count(), 2);
        assert_eq!(b.active().total_tokens, 300);
        assert!((b.active().total_cost_usd - 0.03).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_stale_by_idle_timeout() {
        let config = AgentConfig {
            idle_timeout_minutes: 30,
            ..Default::default()
        };
        let mut session = Session::new(1, "claude", "opus");

        session.last_active = (Utc::now() - ChronoDuration::minutes(29)).to_rfc3339();
        assert!(is_fresh(&session, &config));

        session.last_active = (Utc::now() - ChronoDuration::minutes(30)).to_rfc3339();
        assert!(!is_fresh(&session, &config));
    }

    #[tokio::test]
    async fn test_stale_by_message_cap() {
        let config = AgentConfig {
            max_session_messages: Some(5),
            ..Default::default()
        };
        let mut session = Session::new(1, "claude", "opus");
        session.active_mut().message_count = 4;
        assert!(is_fresh(&session, &config));
        session.active_mut().message_count = 5;
        assert!(!is_fresh(&session, &config));
    }

    #[tokio::test]
    async fn test_corrupt_timestamp_is_stale() {
        let mut session = Session::new(1, "claude", "opus");
        session.last_active = "not a timestamp".into();
        assert!(!is_fresh(&session, &AgentConfig::default()));
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, "{{{ not json").unwrap();
        let store = SessionStore::new(path, shared_config(AgentConfig::default()));
        assert!(store.get_active(1).await.is_none());
    }

    #[tokio::test]
    async fn test_legacy_flat_record_migrates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "1": {
                    "chat_id": 1,
                    "provider": "claude",
                    "model": "opus",
                    "created_at": Utc::now().to_rfc3339(),
                    "last_active": Utc::now().to_rfc3339(),
                    "session_id": "legacy-sid",
                    "message_count": 7,
                    "total_cost_usd": 0.5,
                    "total_tokens": 1234
                }
            })
            .to_string(),
        )
        .unwrap();

        let store = SessionStore::new(path, shared_config(AgentConfig::default()));
        let session = store.get_active(1).await.unwrap();
        assert_eq!(session.session_id(), "legacy-sid");
        assert_eq!(session.message_count(), 7);
        assert_eq!(session.active().total_tokens, 1234);
    }

    #[test]
    fn test_session_roundtrip() {
        let mut session = Session::new(9, "codex", "gpt-5.2-codex");
        session.set_session_id("th-1");
        session.active_mut().message_count = 3;
        let json = serde_json::to_string(&session).unwrap();
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(session, back);
    }
}
