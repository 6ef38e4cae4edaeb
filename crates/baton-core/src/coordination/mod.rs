//! Cross-process coordination primitives.

pub mod keys;
pub mod locks;

pub use locks::{LockHandle, LockRecord, LockStore, RetryPolicy};
