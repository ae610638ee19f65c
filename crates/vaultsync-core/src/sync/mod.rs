//! Synchronization between the local store and the remote authority.
//!
//! This module contains:
//! - `SyncCoordinator`: full pulls, outbox drains, forced single-credential
//!   pushes and the background drain loop
//! - `merge`: last-write-wins reconciliation of a pull with pending edits

pub mod coordinator;
pub mod merge;

pub use coordinator::{
    ForceSyncOutcome, PushOutcome, SyncCoordinator, SyncReport, SyncStatus, MAX_PUSH_ATTEMPTS,
};
pub use merge::{merge_pull, MergeOutcome};
