//! Error types for Baton.
//!
//! Only infrastructure failures are errors. Contention outcomes (a lock held by
//! someone else, a session key that is not cached, an event nobody listens to)
//! are expressed as `None` / `false` by the stores and never reach this type.
//!
//! - **Store errors**: database unreachable, row decoding failures (exit code 2)
//! - **Configuration errors**: invalid files, values or environment (exit code 1)
//! - **Bus errors**: publishing to a bus that has been shut down (exit code 2)

use thiserror::Error;

/// Top-level error type for every fallible Baton operation.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The relational store rejected or failed a statement
    #[error("Database error: {0}")]
    Database(String),

    /// A persisted value could not be decoded (timestamps, enums)
    #[error("Parse error: {0}")]
    Parse(String),

    /// JSON encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration file or value is invalid
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Filesystem failure while reading configuration
    #[error("IO error: {0}")]
    Io(String),

    /// The event bus processing loop has stopped
    #[error("Event bus is closed")]
    EventBusClosed,
}

impl Error {
    /// Create a database error.
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a parse error.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a configuration error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Stable machine-readable code for this error.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Parse(_) => "PARSE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::Io(_) => "IO_ERROR",
            Self::EventBusClosed => "EVENT_BUS_CLOSED",
        }
    }

    /// Process exit code for this error.
    ///
    /// - 1: configuration problems the operator can fix
    /// - 2: infrastructure failures
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidConfig(_) => 1,
            _ => 2,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::InvalidConfig(format!("Failed to parse config: {err}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
