//! Per-conversation session state.
//!
//! A [`SessionStore`] caches [`Session`]s in memory and optionally writes them
//! through to a persistent backing store (see [`SessionBacking`]). The cache
//! is authoritative for reads while the process lives; the backing store
//! survives restarts and feeds [`SessionStore::init`].

mod repository;
mod sqlite;
mod store;

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

pub use repository::{SessionMessageRepository, SessionRepository};
pub use sqlite::{SqliteMessageRepository, SqliteSessionRepository};
pub use store::{EvictionReport, SessionBacking, SessionStats, SessionStore};

/// Who authored a message.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One conversational turn. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl SessionMessage {
    pub fn new(role: Role, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp,
        }
    }
}

/// The persisted header of a session: everything except its messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub channel: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub claude_session_id: Option<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// A cached conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Conversation or thread key.
    pub id: String,
    pub channel: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    /// Updated on every read or write; drives eviction.
    pub last_activity_at: DateTime<Utc>,
    pub claude_session_id: Option<String>,
    /// Oldest first, never longer than the store's message cap.
    pub messages: VecDeque<SessionMessage>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Session {
    /// Create an empty session.
    pub fn new(
        id: impl Into<String>,
        channel: impl Into<String>,
        user_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            channel: channel.into(),
            user_id: user_id.into(),
            created_at: now,
            last_activity_at: now,
            claude_session_id: None,
            messages: VecDeque::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Rebuild from persisted parts, keeping the newest `max_messages`.
    pub fn from_parts(
        record: SessionRecord,
        messages: Vec<SessionMessage>,
        max_messages: usize,
    ) -> Self {
        let mut session = Self {
            id: record.id,
            channel: record.channel,
            user_id: record.user_id,
            created_at: record.created_at,
            last_activity_at: record.last_activity_at,
            claude_session_id: record.claude_session_id,
            messages: VecDeque::with_capacity(max_messages.min(messages.len())),
            metadata: record.metadata,
        };
        for message in messages {
            session.push_message(message, max_messages);
        }
        session
    }

    /// The header to persist.
    pub fn record(&self) -> SessionRecord {
        SessionRecord {
            id: self.id.clone(),
            channel: self.channel.clone(),
            user_id: self.user_id.clone(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            claude_session_id: self.claude_session_id.clone(),
            metadata: self.metadata.clone(),
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity_at = now;
    }

    /// Append and drop from the front until at most `max_messages` remain.
    ///
    /// Returns how many messages were dropped.
    pub fn push_message(&mut self, message: SessionMessage, max_messages: usize) -> usize {
        self.messages.push_back(message);
        let overflow = self.messages.len().saturating_sub(max_messages);
        for _ in 0..overflow {
            self.messages.pop_front();
        }
        overflow
    }

    /// The newest `limit` messages, oldest first.
    pub fn recent_messages(&self, limit: usize) -> Vec<SessionMessage> {
        let skip = self.messages.len().saturating_sub(limit);
        self.messages.iter().skip(skip).cloned().collect()
    }

    /// Whether the session has been idle for longer than `ttl` at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now.checked_sub_signed(ttl)
            .is_some_and(|cutoff| self.last_activity_at < cutoff)
    }
}
