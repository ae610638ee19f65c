//! REST API client module for the remote credential service.
//!
//! This module provides the `CredentialRemote` trait the sync coordinator
//! talks to, and `ApiClient`, its HTTP implementation.
//!
//! Every credential call carries the session's bearer token; a `401` means
//! the session expired and must not be retried.

pub mod client;
pub mod error;
pub mod remote;

pub use client::ApiClient;
pub use error::ApiError;
pub use remote::{CredentialRemote, LoginGrant};

#[cfg(test)]
pub(crate) mod fake;
