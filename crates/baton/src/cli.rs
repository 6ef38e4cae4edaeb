use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "baton", version)]
#[command(about = "Inspect and maintain Baton locks and sessions")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file layered over the global config
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Machine-readable output
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Distributed locks
    #[command(subcommand)]
    Locks(LockCommand),
    /// Persisted sessions
    #[command(subcommand)]
    Sessions(SessionCommand),
    /// Print the effective configuration
    Config,
}

#[derive(Debug, Subcommand)]
pub enum LockCommand {
    /// List unexpired locks
    List,
    /// Try once to take a lock and print its token
    Acquire {
        key: String,
        #[arg(long)]
        owner: Option<String>,
        /// Defaults to locks.default_ttl_secs
        #[arg(long)]
        ttl_secs: Option<u64>,
        /// Free-form note stored with the lock
        #[arg(long)]
        metadata: Option<String>,
    },
    /// Release a lock held under TOKEN
    Release { key: String, token: String },
    /// Extend a lock held under TOKEN
    Refresh {
        key: String,
        token: String,
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
    /// Delete expired lock rows
    Sweep,
}

#[derive(Debug, Subcommand)]
pub enum SessionCommand {
    /// Counts over sessions still inside the TTL
    Stats,
    /// Print a session and its most recent messages
    Show {
        id: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Delete expired and over-capacity sessions from the database
    Prune,
    /// Delete a session and its messages
    Close { id: String },
}
