//! Shared fixtures and relaxed clippy settings for baton-core integration tests

#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::manual_let_else,
    clippy::significant_drop_tightening,
)]

use std::{path::Path, time::Duration};

use baton_core::{
    config::{BatonConfig, DatabaseConfig, EventBusConfig},
    db,
    events::{DispatchMode, EventBus},
    Result,
};
use sqlx::SqlitePool;
use tempfile::TempDir;

/// Open a pool on `<dir>/baton.db`. Separate pools on the same file behave
/// like separate processes sharing the database.
pub async fn file_pool(dir: &Path) -> Result<SqlitePool> {
    let config = DatabaseConfig {
        url: format!("sqlite://{}", dir.join("baton.db").display()),
        ..DatabaseConfig::default()
    };
    db::connect(&config).await
}

pub fn temp_dir() -> Result<TempDir> {
    Ok(tempfile::tempdir()?)
}

/// Configuration with a file database inside `dir`.
pub fn file_config(dir: &Path) -> BatonConfig {
    let mut config = BatonConfig::default();
    config.database.url = format!("sqlite://{}", dir.join("baton.db").display());
    config
}

pub fn bus(dispatch_mode: DispatchMode) -> EventBus {
    EventBus::start(EventBusConfig {
        dispatch_mode,
        ..EventBusConfig::default()
    })
}

/// Poll `check` until it returns true or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}
