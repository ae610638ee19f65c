//! Local secure store for offline credential access.
//!
//! This module provides the `LocalStore`, a SQLite database holding three
//! collections that survive process restarts:
//!
//! - `credentials`: the cached credential set
//! - `sync_outbox`: local mutations waiting for the remote
//! - `metadata`: small key/value records (cache stamps, encrypted token, key)
//!
//! Every public store operation runs as a single transaction.

pub mod error;
pub mod store;

pub use error::StoreError;
pub use store::{meta_keys, LocalStore, OutboxStats};
