//! One owner for the three subsystems.
//!
//! ```rust,no_run
//! # async fn demo() -> baton_core::Result<()> {
//! use baton_core::{config::BatonConfig, coordination::keys, Coordinator};
//!
//! let coordinator = Coordinator::open(BatonConfig::default()).await?;
//! let key = keys::user_summary("u1");
//! let ttl = coordinator.config().locks.default_ttl();
//! coordinator
//!     .locks()
//!     .with_lock(&key, Some("worker-1"), ttl, |_handle| async {
//!         // read and update the session, publish events
//!     })
//!     .await?;
//! coordinator.shutdown().await;
//! # Ok(())
//! # }
//! ```

use sqlx::SqlitePool;
use tracing::info;

use crate::{
    config::BatonConfig,
    coordination::LockStore,
    db,
    events::EventBus,
    session::{SessionBacking, SessionStore},
    Result,
};

/// Lock store, session store and event bus built from one configuration.
#[derive(Debug)]
pub struct Coordinator {
    config: BatonConfig,
    pool: SqlitePool,
    locks: LockStore,
    sessions: SessionStore,
    events: EventBus,
}

impl Coordinator {
    /// Connect to the configured database and bring every subsystem up.
    ///
    /// Creates missing tables and rehydrates persisted sessions.
    pub async fn open(config: BatonConfig) -> Result<Self> {
        config.validate()?;
        let pool = db::connect(&config.database).await?;
        Self::with_pool(config, pool).await
    }

    /// Like [`open`](Self::open) over an existing pool.
    pub async fn with_pool(config: BatonConfig, pool: SqlitePool) -> Result<Self> {
        let locks = LockStore::new(pool.clone());
        locks.init().await?;

        let backing = if config.sessions.persist {
            SessionBacking::sqlite(pool.clone()).await?
        } else {
            SessionBacking::Memory
        };
        let sessions = SessionStore::new(config.sessions, backing)?;
        let restored = sessions.init().await?;

        let events = EventBus::start(config.events);

        info!(
            database = %config.database.url,
            persist_sessions = config.sessions.persist,
            restored,
            "Coordinator ready"
        );

        Ok(Self {
            config,
            pool,
            locks,
            sessions,
            events,
        })
    }

    pub const fn config(&self) -> &BatonConfig {
        &self.config
    }

    pub const fn locks(&self) -> &LockStore {
        &self.locks
    }

    pub const fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Stop the bus, then close the pool.
    pub async fn shutdown(&self) {
        self.events.shutdown().await;
        self.pool.close().await;
        info!("Coordinator shut down");
    }
}
