//! Configuration loading and management
//!
//! # Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//! 1. Built-in defaults
//! 2. Global config: `<config dir>/baton/config.toml`
//! 3. Explicit config file (`--config`)
//! 4. Environment variables: `BATON_*`
//!
//! Files may set any subset of keys; tables are merged key by key.
//!
//! # Example Config
//!
//! ```toml
//! [database]
//! url = "sqlite:///var/lib/baton/baton.db"
//!
//! [locks]
//! default_ttl_secs = 120
//!
//! [sessions]
//! ttl_minutes = 30
//! max_messages = 20
//!
//! [events]
//! dispatch_mode = "detached"
//! ```

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{events::DispatchMode, Error, Result};

// ═══════════════════════════════════════════════════════════════════════════
// CONFIGURATION STRUCTURES
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BatonConfig {
    pub database: DatabaseConfig,
    pub locks: LockConfig,
    pub sessions: SessionConfig,
    pub events: EventBusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection url, e.g. `sqlite://baton.db`
    pub url: String,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    /// TTL used by callers that don't pick their own
    pub default_ttl_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    pub ttl_minutes: u64,
    pub max_sessions: usize,
    pub max_messages: usize,
    /// Back the cache with the `sessions` / `session_messages` tables
    pub persist: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EventBusConfig {
    pub channel_capacity: usize,
    pub history_size: usize,
    pub dispatch_mode: DispatchMode,
    pub shutdown_grace_ms: u64,
}

// ═══════════════════════════════════════════════════════════════════════════
// DEFAULTS
// ═══════════════════════════════════════════════════════════════════════════

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://baton.db".to_string(),
            max_connections: 5,
            busy_timeout_ms: 5_000,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: 60,
            max_sessions: 1_000,
            max_messages: 50,
            persist: true,
        }
    }
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1_000,
            history_size: 1_000,
            dispatch_mode: DispatchMode::AwaitAll,
            shutdown_grace_ms: 5_000,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// DERIVED VALUES
// ═══════════════════════════════════════════════════════════════════════════

impl LockConfig {
    pub const fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

impl SessionConfig {
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_minutes.saturating_mul(60))
    }
}

impl EventBusConfig {
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// LOADING
// ═══════════════════════════════════════════════════════════════════════════

/// Load configuration from all sources.
///
/// # Errors
///
/// Returns error if:
/// - The explicit config file is missing or unreadable
/// - Any config file is malformed TOML
/// - An environment override cannot be parsed
/// - The merged values fail validation
pub async fn load_config(explicit: Option<&Path>) -> Result<BatonConfig> {
    let mut layers = Vec::new();

    if let Some(global) = global_config_path().filter(|path| path.exists()) {
        layers.push(global);
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(Error::invalid_config(format!(
                "Config file {} does not exist",
                path.display()
            )));
        }
        layers.push(path.to_path_buf());
    }

    let mut config = load_layers(&layers).await?;
    config.apply_env_vars()?;
    config.validate()?;
    Ok(config)
}

/// Merge the given TOML files over the built-in defaults, in order.
pub async fn load_layers(paths: &[PathBuf]) -> Result<BatonConfig> {
    let mut merged = toml::Table::new();
    for path in paths {
        let layer = load_toml_table(path).await?;
        merge_tables(&mut merged, layer);
    }
    toml::Value::Table(merged).try_into().map_err(Error::from)
}

impl BatonConfig {
    /// Parse a single TOML document over the defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::invalid_config(format!("Failed to render config: {e}")))
    }

    /// Reject values that would make a store unusable.
    pub fn validate(&self) -> Result<()> {
        if self.database.url.trim().is_empty() {
            return Err(Error::invalid_config("database.url cannot be empty"));
        }
        if self.database.max_connections == 0 {
            return Err(Error::invalid_config("database.max_connections must be > 0"));
        }
        if self.locks.default_ttl_secs == 0 {
            return Err(Error::invalid_config("locks.default_ttl_secs must be > 0"));
        }
        if self.sessions.ttl_minutes == 0 {
            return Err(Error::invalid_config("sessions.ttl_minutes must be > 0"));
        }
        if self.sessions.max_sessions == 0 {
            return Err(Error::invalid_config("sessions.max_sessions must be > 0"));
        }
        if self.sessions.max_messages == 0 {
            return Err(Error::invalid_config("sessions.max_messages must be > 0"));
        }
        if self.events.channel_capacity == 0 {
            return Err(Error::invalid_config("events.channel_capacity must be > 0"));
        }
        if self.events.history_size == 0 {
            return Err(Error::invalid_config("events.history_size must be > 0"));
        }
        Ok(())
    }

    /// Apply environment variable overrides
    ///
    /// # Errors
    ///
    /// Returns error if environment variable values are invalid
    fn apply_env_vars(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var("BATON_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = env_parse("BATON_LOCK_TTL_SECS")? {
            self.locks.default_ttl_secs = value;
        }
        if let Some(value) = env_parse("BATON_SESSION_TTL_MINUTES")? {
            self.sessions.ttl_minutes = value;
        }
        if let Some(value) = env_parse("BATON_MAX_SESSIONS")? {
            self.sessions.max_sessions = value;
        }
        if let Some(value) = env_parse("BATON_MAX_MESSAGES")? {
            self.sessions.max_messages = value;
        }
        if let Some(value) = env_parse("BATON_SESSION_PERSIST")? {
            self.sessions.persist = value;
        }
        if let Some(value) = env_parse("BATON_EVENT_CHANNEL_CAPACITY")? {
            self.events.channel_capacity = value;
        }
        if let Some(value) = env_parse("BATON_EVENT_HISTORY_SIZE")? {
            self.events.history_size = value;
        }
        if let Some(value) = env_parse("BATON_EVENT_DISPATCH_MODE")? {
            self.events.dispatch_mode = value;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// HELPER FUNCTIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Get path to global config file
fn global_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "baton")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

async fn load_toml_table(path: &Path) -> Result<toml::Table> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        Error::Io(format!(
            "Failed to read config file {}: {e}",
            path.display()
        ))
    })?;

    content.parse::<toml::Table>().map_err(|e| {
        Error::invalid_config(format!("Failed to parse config: {}: {e}", path.display()))
    })
}

/// Recursively overlay `layer` onto `base`; tables merge, everything else replaces.
fn merge_tables(base: &mut toml::Table, layer: toml::Table) {
    for (key, value) in layer {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::invalid_config(format!("Invalid {name} value '{raw}': {e}"))),
        Err(_) => Ok(None),
    }
}
