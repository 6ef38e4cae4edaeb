//! Command handlers.
//!
//! Each handler prints its result and reports whether the request was
//! satisfied. A lock that someone else holds, a stale token or a missing
//! session is [`Outcome::Contended`], not an error.

use std::time::Duration;

use anyhow::Result;
use baton_core::{
    config::{load_config, BatonConfig},
    coordination::LockStore,
    db,
    session::{SessionBacking, SessionStore},
    Error,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use sqlx::SqlitePool;

use crate::cli::{Cli, Commands, LockCommand, SessionCommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Contended,
}

impl Outcome {
    const fn from_bool(satisfied: bool) -> Self {
        if satisfied {
            Self::Done
        } else {
            Self::Contended
        }
    }

    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Done => 0,
            Self::Contended => 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Output {
    json: bool,
}

impl Output {
    fn emit<T: Serialize>(self, value: &T, human: impl FnOnce()) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            human();
        }
        Ok(())
    }
}

pub async fn run(cli: Cli) -> Result<Outcome> {
    let config = load_config(cli.config.as_deref()).await?;
    let out = Output { json: cli.json };

    match cli.command {
        Commands::Config => show_config(&config, out),
        Commands::Locks(command) => {
            let pool = db::connect(&config.database).await?;
            let result = locks(&config, &pool, command, out).await;
            pool.close().await;
            result
        }
        Commands::Sessions(command) => {
            if !config.sessions.persist {
                return Err(Error::invalid_config(
                    "sessions.persist is disabled; no sessions are stored in the database",
                )
                .into());
            }
            let pool = db::connect(&config.database).await?;
            let result = sessions(&config, &pool, command, out).await;
            pool.close().await;
            result
        }
    }
}

fn show_config(config: &BatonConfig, out: Output) -> Result<Outcome> {
    if out.json {
        println!("{}", serde_json::to_string_pretty(config)?);
    } else {
        print!("{}", config.to_toml_string()?);
    }
    Ok(Outcome::Done)
}

async fn locks(
    config: &BatonConfig,
    pool: &SqlitePool,
    command: LockCommand,
    out: Output,
) -> Result<Outcome> {
    let store = LockStore::new(pool.clone());
    store.init().await?;
    let ttl_or_default =
        |secs: Option<u64>| secs.map_or_else(|| config.locks.default_ttl(), Duration::from_secs);

    match command {
        LockCommand::List => {
            let active = store.list_active().await?;
            let now = Utc::now();
            out.emit(&active, || {
                if active.is_empty() {
                    println!("No active locks");
                    return;
                }
                println!("{:<40} {:<20} {:>10}", "KEY", "OWNER", "EXPIRES IN");
                for lock in &active {
                    let remaining = lock.remaining(now).map_or(0, |d| d.as_secs());
                    println!(
                        "{:<40} {:<20} {:>9}s",
                        lock.key,
                        lock.owner.as_deref().unwrap_or("-"),
                        remaining
                    );
                }
            })?;
            Ok(Outcome::Done)
        }
        LockCommand::Acquire {
            key,
            owner,
            ttl_secs,
            metadata,
        } => {
            let ttl = ttl_or_default(ttl_secs);
            let handle = store
                .acquire_with_metadata(&key, owner.as_deref(), ttl, metadata.as_deref())
                .await?;
            match handle {
                Some(handle) => {
                    out.emit(&handle, || println!("{}", handle.lock_id))?;
                    Ok(Outcome::Done)
                }
                None => {
                    out.emit(&json!({ "key": key, "acquired": false }), || {
                        eprintln!("Lock '{key}' is held by another owner");
                    })?;
                    Ok(Outcome::Contended)
                }
            }
        }
        LockCommand::Release { key, token } => {
            let released = store.release(&key, &token).await?;
            out.emit(&json!({ "key": key, "released": released }), || {
                if released {
                    println!("Released '{key}'");
                } else {
                    eprintln!("Lock '{key}' is not held under that token");
                }
            })?;
            Ok(Outcome::from_bool(released))
        }
        LockCommand::Refresh {
            key,
            token,
            ttl_secs,
        } => {
            let ttl = ttl_or_default(ttl_secs);
            let refreshed = store.refresh(&key, &token, ttl).await?;
            out.emit(
                &json!({ "key": key, "refreshed": refreshed, "ttl_secs": ttl.as_secs() }),
                || {
                    if refreshed {
                        println!("Refreshed '{key}' for {}s", ttl.as_secs());
                    } else {
                        eprintln!("Lock '{key}' is not held under that token");
                    }
                },
            )?;
            Ok(Outcome::from_bool(refreshed))
        }
        LockCommand::Sweep => {
            let removed = store.cleanup_expired().await?;
            out.emit(&json!({ "removed": removed }), || {
                println!("Removed {removed} expired lock(s)");
            })?;
            Ok(Outcome::Done)
        }
    }
}

async fn sessions(
    config: &BatonConfig,
    pool: &SqlitePool,
    command: SessionCommand,
    out: Output,
) -> Result<Outcome> {
    let backing = SessionBacking::sqlite(pool.clone()).await?;
    let store = SessionStore::new(config.sessions, backing)?;

    match command {
        SessionCommand::Stats => {
            store.init().await?;
            let stats = store.stats().await;
            out.emit(&stats, || {
                println!("Sessions:        {}", stats.total_sessions);
                println!("Active (5 min):  {}", stats.active_sessions);
                println!("Messages:        {}", stats.total_messages);
                println!("Avg per session: {:.1}", stats.avg_messages_per_session);
            })?;
            Ok(Outcome::Done)
        }
        SessionCommand::Show { id, limit } => {
            store.init().await?;
            let Some(session) = store.get(&id).await else {
                out.emit(&json!({ "id": id, "found": false }), || {
                    eprintln!("Session '{id}' not found");
                })?;
                return Ok(Outcome::Contended);
            };
            let messages = session.recent_messages(limit);
            out.emit(&json!({ "session": session.record(), "messages": messages }), || {
                println!("{} ({} / {})", session.id, session.channel, session.user_id);
                println!("  last activity: {}", session.last_activity_at.to_rfc3339());
                if let Some(claude) = &session.claude_session_id {
                    println!("  claude session: {claude}");
                }
                for message in &messages {
                    println!("  [{}] {}: {}", message.timestamp.format("%H:%M:%S"), message.role, message.content);
                }
            })?;
            Ok(Outcome::Done)
        }
        SessionCommand::Prune => {
            let removed = store.prune_backing().await?;
            out.emit(&json!({ "removed": removed }), || {
                println!("Removed {removed} session(s)");
            })?;
            Ok(Outcome::Done)
        }
        SessionCommand::Close { id } => {
            let closed = store.close(&id).await?;
            out.emit(&json!({ "id": id, "closed": closed }), || {
                if closed {
                    println!("Closed '{id}'");
                } else {
                    eprintln!("Session '{id}' not found");
                }
            })?;
            Ok(Outcome::from_bool(closed))
        }
    }
}
