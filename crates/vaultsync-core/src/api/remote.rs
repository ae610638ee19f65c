use async_trait::async_trait;

use super::ApiError;
use crate::models::{CredentialPayload, RemoteCredential};

/// Tokens issued by `POST /login`.
#[derive(Debug, Clone)]
pub struct LoginGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

/// The remote credential authority.
///
/// `ApiClient` is the production implementation; tests substitute an
/// in-memory fake.
#[async_trait]
pub trait CredentialRemote: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> Result<LoginGrant, ApiError>;

    /// Check that a token is still accepted.
    async fn verify(&self, token: &str) -> Result<(), ApiError>;

    /// Invalidate the token server-side.
    async fn logout(&self, token: &str) -> Result<(), ApiError>;

    async fn fetch_credentials(&self, token: &str) -> Result<Vec<RemoteCredential>, ApiError>;

    /// Create a credential, returning the id the remote assigned.
    async fn create_credential(&self, token: &str, payload: &CredentialPayload) -> Result<String, ApiError>;

    async fn update_credential(&self, token: &str, id: &str, payload: &CredentialPayload) -> Result<(), ApiError>;

    async fn delete_credential(&self, token: &str, id: &str) -> Result<(), ApiError>;
}
