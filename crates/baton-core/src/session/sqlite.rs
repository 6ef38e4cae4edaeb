//! `SQLite` implementations of the session repositories.
//!
//! Both repositories may share one pool. Header deletions made by the session
//! repository also remove the matching message rows so the two tables never
//! drift apart.

use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::{Role, SessionMessage, SessionMessageRepository, SessionRecord, SessionRepository};
use crate::{
    db::{chrono_duration, format_timestamp, parse_timestamp},
    Error, Result,
};

type SessionRow = (String, String, String, String, String, Option<String>, String);

fn decode_session(row: SessionRow) -> Result<SessionRecord> {
    let (id, channel, user_id, created_str, activity_str, claude_session_id, metadata_json) = row;
    Ok(SessionRecord {
        id,
        channel,
        user_id,
        created_at: parse_timestamp(&created_str)?,
        last_activity_at: parse_timestamp(&activity_str)?,
        claude_session_id,
        metadata: serde_json::from_str(&metadata_json)?,
    })
}

fn sql_limit(count: usize) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

fn cutoff(ttl: Duration) -> Result<String> {
    Ok(format_timestamp(Utc::now() - chrono_duration(ttl)?))
}

/// Session headers in the `sessions` table.
#[derive(Debug, Clone)]
pub struct SqliteSessionRepository {
    db: SqlitePool,
}

impl SqliteSessionRepository {
    #[must_use]
    pub const fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Initialize the sessions table.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                channel TEXT NOT NULL,
                user_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_activity_at TEXT NOT NULL,
                claude_session_id TEXT,
                metadata TEXT NOT NULL DEFAULT '{}'
            )",
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sessions_last_activity
             ON sessions(last_activity_at)",
        )
        .execute(&self.db)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl SessionRepository for SqliteSessionRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<SessionRecord>> {
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT id, channel, user_id, created_at, last_activity_at, claude_session_id, metadata
             FROM sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        row.map(decode_session).transpose()
    }

    async fn save(&self, record: &SessionRecord) -> Result<()> {
        let metadata = serde_json::to_string(&record.metadata)?;
        sqlx::query(
            "INSERT INTO sessions
                (id, channel, user_id, created_at, last_activity_at, claude_session_id, metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                channel = excluded.channel,
                user_id = excluded.user_id,
                last_activity_at = excluded.last_activity_at,
                claude_session_id = excluded.claude_session_id,
                metadata = excluded.metadata",
        )
        .bind(&record.id)
        .bind(&record.channel)
        .bind(&record.user_id)
        .bind(format_timestamp(record.created_at))
        .bind(format_timestamp(record.last_activity_at))
        .bind(record.claude_session_id.as_deref())
        .bind(metadata)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn update_last_activity(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE sessions SET last_activity_at = ? WHERE id = ?")
            .bind(format_timestamp(at))
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn update_claude_session_id(&self, id: &str, claude_session_id: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET claude_session_id = ? WHERE id = ?")
            .bind(claude_session_id)
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn delete_by_id(&self, id: &str) -> Result<bool> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM session_messages WHERE session_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_expired(&self, ttl: Duration) -> Result<u64> {
        let cutoff = cutoff(ttl)?;
        let mut tx = self.db.begin().await?;
        sqlx::query(
            "DELETE FROM session_messages WHERE session_id IN
                (SELECT id FROM sessions WHERE last_activity_at < ?)",
        )
        .bind(&cutoff)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query("DELETE FROM sessions WHERE last_activity_at < ?")
            .bind(&cutoff)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn delete_oldest(&self, max_count: usize) -> Result<u64> {
        let keep = sql_limit(max_count);
        let mut tx = self.db.begin().await?;
        sqlx::query(
            "DELETE FROM session_messages WHERE session_id IN
                (SELECT id FROM sessions ORDER BY last_activity_at DESC LIMIT -1 OFFSET ?)",
        )
        .bind(keep)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query(
            "DELETE FROM sessions WHERE id IN
                (SELECT id FROM sessions ORDER BY last_activity_at DESC LIMIT -1 OFFSET ?)",
        )
        .bind(keep)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn find_active_sessions(&self, ttl: Duration) -> Result<Vec<SessionRecord>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            "SELECT id, channel, user_id, created_at, last_activity_at, claude_session_id, metadata
             FROM sessions
             WHERE last_activity_at >= ?
             ORDER BY last_activity_at DESC",
        )
        .bind(cutoff(ttl)?)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(decode_session).collect()
    }
}

/// Session messages in the `session_messages` table.
#[derive(Debug, Clone)]
pub struct SqliteMessageRepository {
    db: SqlitePool,
}

impl SqliteMessageRepository {
    #[must_use]
    pub const fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Initialize the session_messages table.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS session_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_session_messages_session
             ON session_messages(session_id, id)",
        )
        .execute(&self.db)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl SessionMessageRepository for SqliteMessageRepository {
    async fn find_by_session_id(&self, session_id: &str) -> Result<Vec<SessionMessage>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT role, content, created_at FROM session_messages
             WHERE session_id = ?
             ORDER BY id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter()
            .map(|(role, content, created_str)| {
                let role = Role::from_str(&role)
                    .map_err(|e| Error::parse(format!("Invalid message role '{role}': {e}")))?;
                Ok(SessionMessage {
                    role,
                    content,
                    timestamp: parse_timestamp(&created_str)?,
                })
            })
            .collect()
    }

    async fn save(&self, session_id: &str, message: &SessionMessage) -> Result<()> {
        sqlx::query(
            "INSERT INTO session_messages (session_id, role, content, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(message.role.as_ref())
        .bind(&message.content)
        .bind(format_timestamp(message.timestamp))
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn delete_old_messages(&self, session_id: &str, keep_count: usize) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM session_messages
             WHERE session_id = ? AND id NOT IN (
                SELECT id FROM session_messages WHERE session_id = ?
                ORDER BY id DESC LIMIT ?
             )",
        )
        .bind(session_id)
        .bind(session_id)
        .bind(sql_limit(keep_count))
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_by_session_id(&self, session_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM session_messages WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }
}
