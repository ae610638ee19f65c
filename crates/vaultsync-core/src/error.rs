use thiserror::Error;

use crate::api::ApiError;
use crate::cache::StoreError;

/// Errors surfaced by the engine.
///
/// The variants mirror how callers must react: `Network` and `Offline` are
/// retried later, `AuthExpired` needs a new login, `RemoteConflict` is a
/// resolved outcome rather than a failure, and `MalformedResponse` leaves the
/// affected outbox entry pending.
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Local store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Encryption key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("Network failure: {0}")]
    Network(String),

    #[error("Session expired - login required")]
    AuthExpired,

    #[error("Remote record already gone: {0}")]
    RemoteConflict(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Remote rejected the request: {0}")]
    Rejected(String),

    #[error("Offline - remote is unreachable")]
    Offline,

    #[error("Session is locked")]
    Locked,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VaultError {
    /// Failures that should be retried on the next cycle without counting
    /// against an outbox entry.
    pub fn is_transient(&self) -> bool {
        matches!(self, VaultError::Network(_) | VaultError::Offline)
    }

    /// Stable identifier the UI can branch on.
    pub fn code(&self) -> &'static str {
        match self {
            VaultError::StoreUnavailable(_) | VaultError::Store(_) => "storeUnavailable",
            VaultError::KeyUnavailable(_) => "keyUnavailable",
            VaultError::Network(_) => "network",
            VaultError::AuthExpired => "authExpired",
            VaultError::RemoteConflict(_) => "remoteConflict",
            VaultError::MalformedResponse(_) | VaultError::Serialization(_) => "malformedResponse",
            VaultError::Rejected(_) => "rejected",
            VaultError::Offline => "offline",
            VaultError::Locked => "locked",
            VaultError::InvalidRequest(_) => "invalidRequest",
        }
    }
}

impl From<ApiError> for VaultError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Unauthorized => VaultError::AuthExpired,
            ApiError::Gone(body) => VaultError::RemoteConflict(body),
            ApiError::AccessDenied(body) | ApiError::Rejected(body) => VaultError::Rejected(body),
            ApiError::RateLimited => VaultError::Network("rate limited".to_string()),
            ApiError::ServerError(body) => VaultError::Network(format!("server error: {}", body)),
            ApiError::Network(msg) => VaultError::Network(msg),
            ApiError::InvalidResponse(msg) => VaultError::MalformedResponse(msg),
        }
    }
}

impl From<StoreError> for VaultError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => VaultError::StoreUnavailable(msg),
            other => VaultError::Store(other),
        }
    }
}

pub type Result<T, E = VaultError> = std::result::Result<T, E>;
