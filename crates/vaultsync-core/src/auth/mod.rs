//! Session protection for the bearer token.
//!
//! This module provides:
//! - `TokenVault`: at-rest encryption of the session token with a locally generated key
//! - `SessionGuard`: the auto-lock state machine that decides when the token may be used
//!
//! The token is only ever persisted encrypted. Locking purges both the
//! ciphertext and the key, so a locked session requires a fresh login.

pub mod guard;
pub mod vault;

pub use guard::{LockEvent, LockReason, LockState, SessionGuard};
pub use vault::{SessionToken, TokenLookup, TokenVault};
