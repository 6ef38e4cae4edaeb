//! SQLite pool construction and the timestamp encoding shared by every table.
//!
//! Timestamps are stored as fixed-width RFC 3339 strings (UTC, microseconds,
//! `Z` suffix) so that `<` / `>=` in SQL compare chronologically.

use std::{str::FromStr, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};

use crate::{config::DatabaseConfig, Error, Result};

/// Open a pool against the configured database, creating the file if needed.
pub async fn connect(config: &DatabaseConfig) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.url)
        .map_err(|e| Error::invalid_config(format!("Invalid database url '{}': {e}", config.url)))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

    SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await
        .map_err(|e| {
            tracing::error!(url = %config.url, "Failed to open database: {e}");
            Error::database(format!("Failed to open database '{}': {e}", config.url))
        })
}

/// Single-connection in-memory pool.
///
/// Every SQLite `:memory:` connection is its own database, so the pool is
/// pinned to one connection that is never recycled.
pub async fn memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .map_err(|e| Error::database(format!("Failed to open in-memory database: {e}")))
}

/// Encode a timestamp for storage.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a stored timestamp.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::parse(format!("Invalid timestamp '{raw}': {e}")))
}

/// Convert a std duration into a chrono one for timestamp arithmetic.
pub fn chrono_duration(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| Error::invalid_config(format!("Duration {duration:?} out of range: {e}")))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_timestamp_roundtrip_preserves_micros() -> Result<()> {
        let ts = Utc
            .timestamp_opt(1_700_000_000, 123_456_000)
            .single()
            .ok_or_else(|| Error::parse("bad fixture"))?;
        let encoded = format_timestamp(ts);
        assert_eq!(encoded, "2023-11-14T22:13:20.123456Z");
        assert_eq!(parse_timestamp(&encoded)?, ts);
        Ok(())
    }

    #[test]
    fn test_encoded_timestamps_sort_chronologically() -> Result<()> {
        let early = Utc
            .timestamp_opt(1_700_000_000, 0)
            .single()
            .ok_or_else(|| Error::parse("bad fixture"))?;
        let late = early + chrono::Duration::microseconds(1);
        assert!(format_timestamp(early) < format_timestamp(late));
        Ok(())
    }

    #[test]
    fn test_parse_timestamp_rejects_garbage() {
        let result = parse_timestamp("yesterday");
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[tokio::test]
    async fn test_memory_pool_keeps_schema_between_queries() -> Result<()> {
        let pool = memory_pool().await?;
        sqlx::query("CREATE TABLE scratch (id INTEGER PRIMARY KEY)")
            .execute(&pool)
            .await?;
        sqlx::query("INSERT INTO scratch (id) VALUES (1)")
            .execute(&pool)
            .await?;
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM scratch")
            .fetch_one(&pool)
            .await?;
        assert_eq!(count, 1);
        Ok(())
    }
}
