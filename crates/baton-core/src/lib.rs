//! # Baton Core
//!
//! Coordination primitives for workers that share conversational state:
//!
//! - [`coordination::LockStore`]: keyed mutual exclusion over a shared
//!   `SQLite` table, safe across processes.
//! - [`session::SessionStore`]: per-conversation cache with TTL and capacity
//!   eviction and optional write-through persistence.
//! - [`events::EventBus`]: bounded in-process publish/subscribe with
//!   concurrent fan-out per event.
//!
//! [`Coordinator`] wires all three from one [`config::BatonConfig`].
//!
//! ## Laws (Compiler Enforced)
//!
//! - No `unwrap()` / `expect()` / `panic!()` outside tests
//! - No `unsafe`
//!
//! ## Error Handling
//!
//! Losing a race is not an error: stores answer `None` / `false`. Every
//! fallible operation returns [`Result<T, Error>`](Result) for infrastructure
//! failures only.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]
#![forbid(unsafe_code)]

pub mod config;
pub mod coordination;
mod coordinator;
pub mod db;
mod error;
pub mod events;
pub mod session;

pub use coordinator::Coordinator;
pub use error::{Error, Result};
