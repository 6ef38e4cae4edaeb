//! Persistence ports for the session store.
//!
//! The store depends on these traits, never on a concrete database. Both are
//! optional: a store built with [`SessionBacking::Memory`](super::SessionBacking)
//! never calls them.
//!
//! # Error Conditions
//!
//! Every method returns `Err` only for infrastructure failures (store
//! unreachable, undecodable rows). Missing rows are `Ok(None)` / `Ok(0)`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{SessionMessage, SessionRecord};
use crate::Result;

/// Storage for session headers.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Load a session header by id.
    async fn find_by_id(&self, id: &str) -> Result<Option<SessionRecord>>;

    /// Insert or replace a session header.
    async fn save(&self, record: &SessionRecord) -> Result<()>;

    async fn update_last_activity(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn update_claude_session_id(&self, id: &str, claude_session_id: &str) -> Result<()>;

    /// Delete a session header. Returns whether a row existed.
    async fn delete_by_id(&self, id: &str) -> Result<bool>;

    /// Delete sessions idle for longer than `ttl`. Returns the number removed.
    async fn delete_expired(&self, ttl: Duration) -> Result<u64>;

    /// Delete the least recently active sessions so at most `max_count` remain.
    async fn delete_oldest(&self, max_count: usize) -> Result<u64>;

    /// Sessions active within `ttl`, most recent first.
    async fn find_active_sessions(&self, ttl: Duration) -> Result<Vec<SessionRecord>>;
}

/// Storage for session messages.
#[async_trait]
pub trait SessionMessageRepository: Send + Sync {
    /// All stored messages for a session, oldest first.
    async fn find_by_session_id(&self, session_id: &str) -> Result<Vec<SessionMessage>>;

    async fn save(&self, session_id: &str, message: &SessionMessage) -> Result<()>;

    /// Keep only the newest `keep_count` messages. Returns the number removed.
    async fn delete_old_messages(&self, session_id: &str, keep_count: usize) -> Result<u64>;

    async fn delete_by_session_id(&self, session_id: &str) -> Result<u64>;
}
