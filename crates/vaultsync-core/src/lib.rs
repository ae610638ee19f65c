//! vaultsync core - offline credential cache and sync engine.
//!
//! This crate holds everything a host needs to serve a password-manager
//! extension while disconnected: the encrypted local store, the session
//! token vault, the auto-lock guard, the remote API client, the sync
//! coordinator, and the message dispatch running against one `Engine`.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod messages;
pub mod models;
pub mod sync;
pub mod utils;

pub use config::Config;
pub use engine::{open_store, Engine};
pub use error::{Result, VaultError};
pub use messages::{Request, Response, ResponseBody};
