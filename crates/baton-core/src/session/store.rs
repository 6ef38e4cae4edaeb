//! The session cache and its optional write-through backing.

use std::{
    collections::HashMap,
    fmt,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{
    Role, Session, SessionMessage, SessionMessageRepository, SessionRepository,
    SqliteMessageRepository, SqliteSessionRepository,
};
use crate::{config::SessionConfig, db::chrono_duration, Result};

/// Sessions touched within this window count as active in [`SessionStats`].
const ACTIVE_WINDOW_MINUTES: i64 = 5;

/// Where sessions live besides the cache.
#[derive(Clone)]
pub enum SessionBacking {
    /// Cache only. Every backing call is a no-op.
    Memory,
    /// Write-through to the two repositories.
    Persistent {
        sessions: Arc<dyn SessionRepository>,
        messages: Arc<dyn SessionMessageRepository>,
    },
}

impl fmt::Debug for SessionBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("Memory"),
            Self::Persistent { .. } => f.write_str("Persistent"),
        }
    }
}

impl SessionBacking {
    pub fn persistent(
        sessions: impl SessionRepository + 'static,
        messages: impl SessionMessageRepository + 'static,
    ) -> Self {
        Self::Persistent {
            sessions: Arc::new(sessions),
            messages: Arc::new(messages),
        }
    }

    /// `SQLite` repositories over `pool`, with their tables created.
    pub async fn sqlite(pool: SqlitePool) -> Result<Self> {
        let sessions = SqliteSessionRepository::new(pool.clone());
        let messages = SqliteMessageRepository::new(pool);
        sessions.init().await?;
        messages.init().await?;
        Ok(Self::persistent(sessions, messages))
    }

    pub const fn is_persistent(&self) -> bool {
        matches!(self, Self::Persistent { .. })
    }
}

/// Snapshot counters returned by [`SessionStore::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SessionStats {
    pub total_sessions: usize,
    /// Touched within the last five minutes.
    pub active_sessions: usize,
    pub total_messages: usize,
    pub avg_messages_per_session: f64,
}

/// Outcome of one eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    /// Removed by the TTL sweep.
    pub expired: usize,
    /// Removed by the capacity trim.
    pub evicted: usize,
    /// Backing-store deletes that failed; the cache entries are gone regardless.
    pub failed_deletes: usize,
}

impl EvictionReport {
    pub const fn removed(&self) -> usize {
        self.expired + self.evicted
    }
}

/// Per-conversation state cache.
///
/// Mutating operations run [`evict`](Self::evict) first, then update the
/// cache, then the backing store, holding the cache write lock throughout.
/// Reads never touch the backing store.
pub struct SessionStore {
    config: SessionConfig,
    ttl: chrono::Duration,
    backing: SessionBacking,
    cache: RwLock<HashMap<String, Session>>,
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("config", &self.config)
            .field("backing", &self.backing)
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    /// Build an empty store.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the TTL does not fit a timestamp offset.
    pub fn new(config: SessionConfig, backing: SessionBacking) -> Result<Self> {
        Ok(Self {
            config,
            ttl: chrono_duration(config.ttl())?,
            backing,
            cache: RwLock::new(HashMap::new()),
        })
    }

    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub const fn is_persistent(&self) -> bool {
        self.backing.is_persistent()
    }

    /// Prune the backing store and load every session still inside the TTL.
    ///
    /// Returns the number of sessions loaded. Entries already cached win.
    pub async fn init(&self) -> Result<usize> {
        let SessionBacking::Persistent { sessions, messages } = &self.backing else {
            return Ok(0);
        };

        let pruned = self.prune_backing().await?;
        let records = sessions.find_active_sessions(self.config.ttl()).await?;

        let mut loaded = Vec::with_capacity(records.len());
        for record in records {
            let history = messages.find_by_session_id(&record.id).await?;
            loaded.push(Session::from_parts(record, history, self.config.max_messages));
        }

        let count = loaded.len();
        let mut cache = self.cache.write().await;
        for session in loaded {
            cache.entry(session.id.clone()).or_insert(session);
        }
        drop(cache);

        info!(loaded = count, pruned, "Session store rehydrated");
        Ok(count)
    }

    /// Delete expired and over-capacity rows from the backing store.
    pub async fn prune_backing(&self) -> Result<u64> {
        let SessionBacking::Persistent { sessions, .. } = &self.backing else {
            return Ok(0);
        };
        let expired = sessions.delete_expired(self.config.ttl()).await?;
        let trimmed = sessions.delete_oldest(self.config.max_sessions).await?;
        Ok(expired + trimmed)
    }

    /// Return the cached session, else hydrate it from the backing store,
    /// else create and persist a new one. Always touches it.
    ///
    /// A persisted session idle past the TTL is deleted and replaced by a
    /// fresh one. The cache write lock is held across the backing calls so a
    /// concurrent eviction can never interleave with hydration.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn get_or_create(&self, key: &str, channel: &str, user_id: &str) -> Result<Session> {
        self.evict().await;
        let now = Utc::now();
        let mut cache = self.cache.write().await;

        if let Some(session) = cache.get_mut(key) {
            if !session.is_expired(now, self.ttl) {
                session.touch(now);
                let session = session.clone();
                self.persist_activity(key, now).await?;
                return Ok(session);
            }
            cache.remove(key);
        }

        if let Some(session) = self.hydrate(key, now).await? {
            cache.insert(key.to_string(), session.clone());
            debug!(session = key, messages = session.messages.len(), "Hydrated session");
            return Ok(session);
        }

        let session = Session::new(key, channel, user_id, now);
        cache.insert(key.to_string(), session.clone());
        if let SessionBacking::Persistent { sessions, .. } = &self.backing {
            sessions.save(&session.record()).await?;
        }
        debug!(session = key, channel, user_id, "Created session");
        Ok(session)
    }

    /// Cache-only lookup. Touches the entry on a hit; an entry past its TTL
    /// reads as absent until the next eviction pass removes it.
    pub async fn get(&self, key: &str) -> Option<Session> {
        self.touch_cached(key, Utc::now()).await
    }

    /// Append a message, dropping the oldest beyond the cap.
    ///
    /// Returns `false` if the session is not cached.
    #[tracing::instrument(skip(self, content), level = "debug")]
    pub async fn add_message(&self, key: &str, role: Role, content: &str) -> Result<bool> {
        self.evict().await;
        let now = Utc::now();
        let message = SessionMessage::new(role, content, now);

        let mut cache = self.cache.write().await;
        let Some(session) = cache.get_mut(key) else {
            return Ok(false);
        };
        let dropped = session.push_message(message.clone(), self.config.max_messages);
        session.touch(now);
        if dropped > 0 {
            debug!(session = key, dropped, "Trimmed session history");
        }

        if let SessionBacking::Persistent { sessions, messages } = &self.backing {
            messages.save(key, &message).await?;
            messages
                .delete_old_messages(key, self.config.max_messages)
                .await?;
            sessions.update_last_activity(key, now).await?;
        }
        drop(cache);
        Ok(true)
    }

    /// The newest `limit` messages of a cached session, oldest first.
    pub async fn get_context(&self, key: &str, limit: usize) -> Vec<SessionMessage> {
        let now = Utc::now();
        let mut cache = self.cache.write().await;
        match cache.get_mut(key) {
            Some(session) if !session.is_expired(now, self.ttl) => {
                session.touch(now);
                session.recent_messages(limit)
            }
            _ => Vec::new(),
        }
    }

    pub async fn set_claude_session_id(&self, key: &str, claude_session_id: &str) -> Result<bool> {
        self.evict().await;
        let now = Utc::now();

        let mut cache = self.cache.write().await;
        let Some(session) = cache.get_mut(key) else {
            return Ok(false);
        };
        session.claude_session_id = Some(claude_session_id.to_string());
        session.touch(now);

        if let SessionBacking::Persistent { sessions, .. } = &self.backing {
            sessions
                .update_claude_session_id(key, claude_session_id)
                .await?;
            sessions.update_last_activity(key, now).await?;
        }
        drop(cache);
        Ok(true)
    }

    pub async fn claude_session_id(&self, key: &str) -> Option<String> {
        self.get(key)
            .await
            .and_then(|session| session.claude_session_id)
    }

    /// Set one metadata field and persist the header.
    pub async fn set_metadata(
        &self,
        key: &str,
        field: &str,
        value: serde_json::Value,
    ) -> Result<bool> {
        self.evict().await;
        let now = Utc::now();

        let mut cache = self.cache.write().await;
        let Some(session) = cache.get_mut(key) else {
            return Ok(false);
        };
        session.metadata.insert(field.to_string(), value);
        session.touch(now);

        if let SessionBacking::Persistent { sessions, .. } = &self.backing {
            sessions.save(&session.record()).await?;
        }
        drop(cache);
        Ok(true)
    }

    pub async fn get_metadata(&self, key: &str, field: &str) -> Option<serde_json::Value> {
        self.get(key)
            .await
            .and_then(|mut session| session.metadata.remove(field))
    }

    /// Drop a session from the cache and delete its persisted rows.
    ///
    /// Returns whether anything was removed.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn close(&self, key: &str) -> Result<bool> {
        self.evict().await;
        let mut cache = self.cache.write().await;
        let cached = cache.remove(key).is_some();
        let persisted = self.delete_persisted(key).await?;
        drop(cache);
        Ok(cached || persisted)
    }

    pub async fn stats(&self) -> SessionStats {
        let now = Utc::now();
        let active_cutoff = now - chrono::Duration::minutes(ACTIVE_WINDOW_MINUTES);
        let cache = self.cache.read().await;

        let total_sessions = cache.len();
        let active_sessions = cache
            .values()
            .filter(|session| session.last_activity_at >= active_cutoff)
            .count();
        let total_messages: usize = cache.values().map(|session| session.messages.len()).sum();

        #[allow(clippy::cast_precision_loss)]
        let avg_messages_per_session = if total_sessions == 0 {
            0.0
        } else {
            total_messages as f64 / total_sessions as f64
        };

        SessionStats {
            total_sessions,
            active_sessions,
            total_messages,
            avg_messages_per_session,
        }
    }

    /// Run the two-phase eviction policy: TTL sweep, then trim the least
    /// recently active entries down to `max_sessions`.
    ///
    /// Runs under one cache write lock, backing deletes included, so a
    /// concurrent `get_or_create` cannot rehydrate a victim mid-sweep. Backing
    /// deletes are best-effort per key.
    pub async fn evict(&self) -> EvictionReport {
        let now = Utc::now();
        let mut report = EvictionReport::default();

        let mut cache = self.cache.write().await;
        let victims = {
            let mut victims: Vec<String> = cache
                .iter()
                .filter(|(_, session)| session.is_expired(now, self.ttl))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &victims {
                cache.remove(key);
            }
            report.expired = victims.len();

            if cache.len() > self.config.max_sessions {
                let mut by_activity: Vec<(DateTime<Utc>, String)> = cache
                    .iter()
                    .map(|(key, session)| (session.last_activity_at, key.clone()))
                    .collect();
                by_activity.sort();

                let overflow = cache.len() - self.config.max_sessions;
                for (_, key) in by_activity.into_iter().take(overflow) {
                    cache.remove(&key);
                    victims.push(key);
                }
                report.evicted = overflow;
            }
            victims
        };

        if self.backing.is_persistent() {
            for key in &victims {
                if let Err(e) = self.delete_persisted(key).await {
                    warn!(session = %key, "Failed to delete evicted session: {e}");
                    report.failed_deletes += 1;
                }
            }
        }
        drop(cache);

        if report.removed() > 0 {
            debug!(
                expired = report.expired,
                evicted = report.evicted,
                failed_deletes = report.failed_deletes,
                "Evicted sessions"
            );
        }
        report
    }

    /// Keys currently cached, sorted.
    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.cache.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn touch_cached(&self, key: &str, now: DateTime<Utc>) -> Option<Session> {
        let mut cache = self.cache.write().await;
        let session = cache.get_mut(key)?;
        if session.is_expired(now, self.ttl) {
            return None;
        }
        session.touch(now);
        Some(session.clone())
    }

    /// Load `key` from the backing store and touch it. A header idle past the
    /// TTL is deleted instead and reads as absent.
    async fn hydrate(&self, key: &str, now: DateTime<Utc>) -> Result<Option<Session>> {
        let SessionBacking::Persistent { sessions, messages } = &self.backing else {
            return Ok(None);
        };
        let Some(record) = sessions.find_by_id(key).await? else {
            return Ok(None);
        };

        let stale = Session::from_parts(record, Vec::new(), self.config.max_messages);
        if stale.is_expired(now, self.ttl) {
            self.delete_persisted(key).await?;
            debug!(session = key, "Discarded expired persisted session");
            return Ok(None);
        }

        let history = messages.find_by_session_id(key).await?;
        let mut session = Session::from_parts(stale.record(), history, self.config.max_messages);
        session.touch(now);
        sessions.update_last_activity(key, now).await?;
        Ok(Some(session))
    }

    async fn persist_activity(&self, key: &str, now: DateTime<Utc>) -> Result<()> {
        if let SessionBacking::Persistent { sessions, .. } = &self.backing {
            sessions.update_last_activity(key, now).await?;
        }
        Ok(())
    }

    async fn delete_persisted(&self, key: &str) -> Result<bool> {
        let SessionBacking::Persistent { sessions, messages } = &self.backing else {
            return Ok(false);
        };
        let removed_messages = messages.delete_by_session_id(key).await?;
        let removed_header = sessions.delete_by_id(key).await?;
        Ok(removed_header || removed_messages > 0)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use proptest::prelude::*;

    use super::*;
    use crate::{db::memory_pool, session::SessionRecord, Error};

    fn config(max_sessions: usize, max_messages: usize) -> SessionConfig {
        SessionConfig {
            ttl_minutes: 60,
            max_sessions,
            max_messages,
            persist: false,
        }
    }

    fn memory_store(max_sessions: usize, max_messages: usize) -> Result<SessionStore> {
        SessionStore::new(config(max_sessions, max_messages), SessionBacking::Memory)
    }

    async fn persistent_store(pool: SqlitePool, max_messages: usize) -> Result<SessionStore> {
        let backing = SessionBacking::sqlite(pool).await?;
        SessionStore::new(config(100, max_messages), backing)
    }

    async fn seed(store: &SessionStore, key: &str, minutes_ago: i64) {
        let at = Utc::now() - chrono::Duration::minutes(minutes_ago);
        store
            .cache
            .write()
            .await
            .insert(key.to_string(), Session::new(key, "slack", "u1", at));
    }

    async fn backdate(store: &SessionStore, key: &str, minutes: i64) {
        if let Some(session) = store.cache.write().await.get_mut(key) {
            session.last_activity_at = Utc::now() - chrono::Duration::minutes(minutes);
        }
    }

    #[tokio::test]
    async fn test_thread_context_keeps_last_two() -> Result<()> {
        let store = memory_store(10, 2)?;
        store.get_or_create("thread-1", "slack", "u1").await?;
        for content in ["first", "second", "third"] {
            assert!(store.add_message("thread-1", Role::User, content).await?);
        }

        let context: Vec<String> = store
            .get_context("thread-1", 10)
            .await
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(context, vec!["second", "third"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_get_or_create_returns_existing() -> Result<()> {
        let store = memory_store(10, 10)?;
        let first = store.get_or_create("t", "slack", "u1").await?;
        store.add_message("t", Role::Assistant, "hello").await?;
        let second = store.get_or_create("t", "other", "u2").await?;

        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.channel, "slack");
        assert_eq!(second.messages.len(), 1);
        assert!(second.last_activity_at >= first.last_activity_at);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_key_is_not_an_error() -> Result<()> {
        let store = memory_store(10, 10)?;
        assert!(store.get("nope").await.is_none());
        assert!(!store.add_message("nope", Role::User, "x").await?);
        assert!(!store.set_claude_session_id("nope", "c").await?);
        assert!(!store.set_metadata("nope", "k", serde_json::json!(1)).await?);
        assert!(!store.close("nope").await?);
        assert!(store.get_context("nope", 5).await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_mutators_and_accessors() -> Result<()> {
        let store = memory_store(10, 10)?;
        store.get_or_create("t", "slack", "u1").await?;

        assert!(store.set_claude_session_id("t", "claude-1").await?);
        assert!(store.set_metadata("t", "topic", serde_json::json!("billing")).await?);

        assert_eq!(store.claude_session_id("t").await.as_deref(), Some("claude-1"));
        assert_eq!(store.get_metadata("t", "topic").await, Some(serde_json::json!("billing")));
        assert_eq!(store.get_metadata("t", "missing").await, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_get_treats_expired_entry_as_absent() -> Result<()> {
        let store = memory_store(10, 10)?;
        store.get_or_create("t", "slack", "u1").await?;
        backdate(&store, "t", 120).await;

        assert!(store.get("t").await.is_none());
        assert_eq!(store.session_ids().await, vec!["t"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_ttl_sweep_removes_stale_sessions() -> Result<()> {
        let store = memory_store(10, 10)?;
        for key in ["stale-1", "stale-2", "fresh"] {
            store.get_or_create(key, "slack", "u1").await?;
        }
        backdate(&store, "stale-1", 61).await;
        backdate(&store, "stale-2", 500).await;

        let report = store.evict().await;
        assert_eq!(report.expired, 2);
        assert_eq!(report.evicted, 0);
        assert_eq!(store.session_ids().await, vec!["fresh"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_capacity_trim_keeps_most_recent() -> Result<()> {
        let store = memory_store(2, 10)?;
        seed(&store, "a", 40).await;
        seed(&store, "b", 30).await;
        seed(&store, "c", 20).await;
        seed(&store, "d", 10).await;

        let report = store.evict().await;
        assert_eq!(report.evicted, 2);
        assert_eq!(store.session_ids().await, vec!["c", "d"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_mutation_runs_eviction_first() -> Result<()> {
        let store = memory_store(10, 10)?;
        store.get_or_create("old", "slack", "u1").await?;
        store.get_or_create("live", "slack", "u1").await?;
        backdate(&store, "old", 90).await;

        store.add_message("live", Role::User, "hi").await?;
        assert_eq!(store.session_ids().await, vec!["live"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_stats() -> Result<()> {
        let store = memory_store(10, 10)?;
        assert!(store.stats().await.avg_messages_per_session.abs() < f64::EPSILON);

        store.get_or_create("a", "slack", "u1").await?;
        store.get_or_create("b", "slack", "u1").await?;
        store.add_message("a", Role::User, "1").await?;
        store.add_message("a", Role::Assistant, "2").await?;
        store.add_message("a", Role::User, "3").await?;
        store.add_message("b", Role::User, "4").await?;
        backdate(&store, "b", 10).await;

        let stats = store.stats().await;
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.total_messages, 4);
        assert!((stats.avg_messages_per_session - 2.0).abs() < f64::EPSILON);
        Ok(())
    }

    #[tokio::test]
    async fn test_persistent_writes_and_rehydrates() -> Result<()> {
        let pool = memory_pool().await?;
        let store = persistent_store(pool.clone(), 2).await?;
        store.get_or_create("thread-1", "slack", "u1").await?;
        for content in ["a", "b", "c"] {
            store.add_message("thread-1", Role::User, content).await?;
        }
        store.set_claude_session_id("thread-1", "claude-9").await?;
        store
            .set_metadata("thread-1", "project", serde_json::json!("p1"))
            .await?;

        let restarted = persistent_store(pool, 2).await?;
        assert_eq!(restarted.init().await?, 1);

        let session = restarted
            .get("thread-1")
            .await
            .ok_or_else(|| Error::database("session not rehydrated"))?;
        let contents: Vec<&str> = session.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["b", "c"]);
        assert_eq!(session.claude_session_id.as_deref(), Some("claude-9"));
        assert_eq!(session.metadata.get("project"), Some(&serde_json::json!("p1")));
        Ok(())
    }

    #[tokio::test]
    async fn test_get_or_create_hydrates_on_cache_miss() -> Result<()> {
        let pool = memory_pool().await?;
        let writer = persistent_store(pool.clone(), 10).await?;
        writer.get_or_create("t", "slack", "u1").await?;
        writer.add_message("t", Role::User, "persisted").await?;

        let reader = persistent_store(pool, 10).await?;
        assert!(reader.get("t").await.is_none());
        let session = reader.get_or_create("t", "ignored", "ignored").await?;
        assert_eq!(session.channel, "slack");
        assert_eq!(session.messages.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_close_deletes_persisted_rows() -> Result<()> {
        let pool = memory_pool().await?;
        let store = persistent_store(pool.clone(), 10).await?;
        store.get_or_create("t", "slack", "u1").await?;
        store.add_message("t", Role::User, "x").await?;

        assert!(store.close("t").await?);
        assert!(store.get("t").await.is_none());

        let restarted = persistent_store(pool, 10).await?;
        assert_eq!(restarted.init().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_init_skips_expired_rows() -> Result<()> {
        let pool = memory_pool().await?;
        let backing = SessionBacking::sqlite(pool.clone()).await?;
        let SessionBacking::Persistent { sessions, .. } = &backing else {
            return Err(Error::database("expected persistent backing"));
        };
        let old = Utc::now() - chrono::Duration::hours(3);
        sessions.save(&Session::new("old", "c", "u", old).record()).await?;
        sessions.save(&Session::new("new", "c", "u", Utc::now()).record()).await?;

        let store = SessionStore::new(config(100, 10), backing.clone())?;
        assert_eq!(store.init().await?, 1);
        assert_eq!(store.session_ids().await, vec!["new"]);
        assert!(sessions.find_by_id("old").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_get_or_create_replaces_expired_persisted_session() -> Result<()> {
        let pool = memory_pool().await?;
        let writer = persistent_store(pool.clone(), 10).await?;
        writer.get_or_create("t", "slack", "u1").await?;
        writer.add_message("t", Role::User, "old history").await?;
        let headers = SqliteSessionRepository::new(pool.clone());
        headers
            .update_last_activity("t", Utc::now() - chrono::Duration::hours(3))
            .await?;

        // No init: the expired row is only seen through hydration.
        let reader = persistent_store(pool.clone(), 10).await?;
        let session = reader.get_or_create("t", "teams", "u2").await?;
        assert!(session.messages.is_empty());
        assert_eq!(session.channel, "teams");
        assert!(Utc::now() - session.created_at < chrono::Duration::minutes(1));

        let record = headers
            .find_by_id("t")
            .await?
            .ok_or_else(|| Error::database("fresh header not saved"))?;
        assert_eq!(record.channel, "teams");
        let history = SqliteMessageRepository::new(pool).find_by_session_id("t").await?;
        assert!(history.is_empty());
        Ok(())
    }

    /// `SQLite` messages whose per-session delete stalls.
    struct SlowMessageDeletes {
        inner: SqliteMessageRepository,
        delay: Duration,
    }

    #[async_trait]
    impl SessionMessageRepository for SlowMessageDeletes {
        async fn find_by_session_id(&self, id: &str) -> Result<Vec<SessionMessage>> {
            self.inner.find_by_session_id(id).await
        }
        async fn save(&self, id: &str, message: &SessionMessage) -> Result<()> {
            self.inner.save(id, message).await
        }
        async fn delete_old_messages(&self, id: &str, keep: usize) -> Result<u64> {
            self.inner.delete_old_messages(id, keep).await
        }
        async fn delete_by_session_id(&self, id: &str) -> Result<u64> {
            tokio::time::sleep(self.delay).await;
            self.inner.delete_by_session_id(id).await
        }
    }

    #[tokio::test]
    async fn test_reopen_during_eviction_starts_fresh() -> Result<()> {
        let pool = memory_pool().await?;
        let headers = SqliteSessionRepository::new(pool.clone());
        let bodies = SqliteMessageRepository::new(pool.clone());
        headers.init().await?;
        bodies.init().await?;
        let backing = SessionBacking::persistent(
            headers.clone(),
            SlowMessageDeletes {
                inner: bodies,
                delay: Duration::from_millis(200),
            },
        );
        let store = Arc::new(SessionStore::new(config(100, 10), backing)?);

        store.get_or_create("k", "slack", "u1").await?;
        store.add_message("k", Role::User, "stale secret").await?;
        backdate(&store, "k", 90).await;
        headers
            .update_last_activity("k", Utc::now() - chrono::Duration::minutes(90))
            .await?;

        let sweeper = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.evict().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let reopened = store.get_or_create("k", "slack", "u1").await?;
        let report = sweeper.await.map_err(|e| Error::database(e.to_string()))?;

        assert_eq!(report.expired, 1);
        assert!(reopened.messages.is_empty());
        assert!(store.get("k").await.is_some());
        assert!(headers.find_by_id("k").await?.is_some());
        let leftover = SqliteMessageRepository::new(pool.clone())
            .find_by_session_id("k")
            .await?;
        assert!(leftover.is_empty());

        // The reopened session has a header, so new writes survive a restart.
        store.add_message("k", Role::User, "fresh").await?;
        let restarted = persistent_store(pool, 10).await?;
        assert_eq!(restarted.init().await?, 1);
        let session = restarted
            .get("k")
            .await
            .ok_or_else(|| Error::database("reopened session not persisted"))?;
        let contents: Vec<&str> = session.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["fresh"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_init_is_noop() -> Result<()> {
        let store = memory_store(10, 10)?;
        assert_eq!(store.init().await?, 0);
        assert_eq!(store.prune_backing().await?, 0);
        assert!(!store.is_persistent());
        Ok(())
    }

    /// Accepts writes, fails every delete.
    struct UndeletableSessions;

    #[async_trait]
    impl SessionRepository for UndeletableSessions {
        async fn find_by_id(&self, _id: &str) -> Result<Option<SessionRecord>> {
            Ok(None)
        }
        async fn save(&self, _record: &SessionRecord) -> Result<()> {
            Ok(())
        }
        async fn update_last_activity(&self, _id: &str, _at: DateTime<Utc>) -> Result<()> {
            Ok(())
        }
        async fn update_claude_session_id(&self, _id: &str, _claude: &str) -> Result<()> {
            Ok(())
        }
        async fn delete_by_id(&self, _id: &str) -> Result<bool> {
            Err(Error::database("store unreachable"))
        }
        async fn delete_expired(&self, _ttl: Duration) -> Result<u64> {
            Ok(0)
        }
        async fn delete_oldest(&self, _max_count: usize) -> Result<u64> {
            Ok(0)
        }
        async fn find_active_sessions(&self, _ttl: Duration) -> Result<Vec<SessionRecord>> {
            Ok(Vec::new())
        }
    }

    struct NoMessages;

    #[async_trait]
    impl SessionMessageRepository for NoMessages {
        async fn find_by_session_id(&self, _id: &str) -> Result<Vec<SessionMessage>> {
            Ok(Vec::new())
        }
        async fn save(&self, _id: &str, _message: &SessionMessage) -> Result<()> {
            Ok(())
        }
        async fn delete_old_messages(&self, _id: &str, _keep: usize) -> Result<u64> {
            Ok(0)
        }
        async fn delete_by_session_id(&self, _id: &str) -> Result<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_eviction_continues_past_failed_deletes() -> Result<()> {
        let backing = SessionBacking::persistent(UndeletableSessions, NoMessages);
        let store = SessionStore::new(config(10, 10), backing)?;
        for key in ["a", "b", "c"] {
            store.get_or_create(key, "slack", "u1").await?;
        }
        backdate(&store, "a", 90).await;
        backdate(&store, "b", 90).await;

        let report = store.evict().await;
        assert_eq!(report.expired, 2);
        assert_eq!(report.failed_deletes, 2);
        assert_eq!(store.session_ids().await, vec!["c"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_close_propagates_store_failure() -> Result<()> {
        let backing = SessionBacking::persistent(UndeletableSessions, NoMessages);
        let store = SessionStore::new(config(10, 10), backing)?;
        store.get_or_create("a", "slack", "u1").await?;
        assert!(matches!(store.close("a").await, Err(Error::Database(_))));
        Ok(())
    }

    proptest! {
        #[test]
        fn prop_capacity_trim_keeps_newest(capacity in 1usize..8, extra in 0usize..8) {
            let total = capacity + extra;
            let outcome = tokio_test::block_on(async {
                let store = memory_store(capacity, 10)?;
                for n in 0..total {
                    let age = i64::try_from(total - n).unwrap_or(i64::MAX);
                    seed(&store, &format!("s{n:02}"), age).await;
                }
                let report = store.evict().await;
                Ok::<_, Error>((report, store.session_ids().await))
            });
            let (report, ids) = outcome.map_err(|e| TestCaseError::fail(e.to_string()))?;

            prop_assert_eq!(report.evicted, extra);
            let expected: Vec<String> = (extra..total).map(|n| format!("s{n:02}")).collect();
            prop_assert_eq!(ids, expected);
        }
    }
}
