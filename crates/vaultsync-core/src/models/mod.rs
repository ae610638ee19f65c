//! Data models for the credential cache.
//!
//! This module contains the data structures shared by the store, the sync
//! coordinator and the message contract:
//!
//! - `CredentialRecord`, `CredentialPayload`: cached credentials and their editable fields
//! - `RemoteCredential`: the credential shape returned by the remote API
//! - `SyncOutboxEntry`, `OutboxAction`, `PendingItem`: queued local mutations
//! - `Settings`: user settings pushed by the options page

pub mod credential;
pub mod outbox;
pub mod settings;

pub use credential::{is_local_id, next_stamp, CredentialPayload, CredentialRecord, RemoteCredential};
pub use outbox::{OutboxAction, PendingItem, SyncOutboxEntry};
pub use settings::Settings;
