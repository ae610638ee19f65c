//! API client for communicating with the credential REST API.
//!
//! This module provides the `ApiClient` struct, the HTTP implementation of
//! `CredentialRemote`. Responses use the server's standard envelope:
//! `{ "success": bool, "message": string, "data": ... }`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize};
use tracing::{debug, warn};

use super::remote::{CredentialRemote, LoginGrant};
use super::ApiError;
use crate::models::{CredentialPayload, RemoteCredential};
use crate::utils::truncate;

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 500;

/// How much of an unparseable body to keep in the error message.
const MALFORMED_BODY_PREVIEW: usize = 200;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TokenData {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CreatedCredential {
    id: String,
}

/// Decode an envelope body, treating `success: false` as a rejection.
fn parse_envelope<T: DeserializeOwned>(body: &str) -> Result<Envelope<T>, ApiError> {
    let envelope: Envelope<T> = serde_json::from_str(body).map_err(|e| {
        ApiError::InvalidResponse(format!("{}: {}", e, truncate(body, MALFORMED_BODY_PREVIEW)))
    })?;
    if envelope.success == Some(false) {
        return Err(ApiError::Rejected(
            envelope.message.unwrap_or_else(|| "request unsuccessful".to_string()),
        ));
    }
    Ok(envelope)
}

/// Like `parse_envelope`, but `data` must be present.
fn parse_data<T: DeserializeOwned>(body: &str) -> Result<T, ApiError> {
    parse_envelope::<T>(body)?
        .data
        .ok_or_else(|| ApiError::InvalidResponse("response envelope has no data".to_string()))
}

/// HTTP client for the credential API.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    /// Create a client for `base_url`. Every request is bounded by `timeout`
    /// so a hung call cannot stall the engine.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Send a request, backing off and retrying while rate limited.
    /// `make` rebuilds the request for each attempt.
    async fn send<F>(&self, what: &str, make: F) -> Result<String, ApiError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = make().send().await?;
            match Self::check_response(response).await {
                Ok(response) => {
                    debug!(request = what, "Request succeeded");
                    return Ok(response.text().await?);
                }
                Err(ApiError::RateLimited) if retries < MAX_RATE_LIMIT_RETRIES => {
                    retries += 1;
                    warn!(request = what, retry = retries, backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl CredentialRemote for ApiClient {
    async fn login(&self, username: &str, password: &str) -> Result<LoginGrant, ApiError> {
        let url = self.url("/login");
        let body = serde_json::json!({ "username": username, "password": password });
        let text = self
            .send("login", || self.client.post(&url).json(&body))
            .await?;
        let data: TokenData = parse_data(&text)?;
        Ok(LoginGrant {
            access_token: data.access_token,
            refresh_token: data.refresh_token,
            expires_in: data.expires_in,
        })
    }

    async fn verify(&self, token: &str) -> Result<(), ApiError> {
        let url = self.url("/auth/verify");
        self.send("verify", || self.client.get(&url).bearer_auth(token))
            .await?;
        Ok(())
    }

    async fn logout(&self, token: &str) -> Result<(), ApiError> {
        let url = self.url("/auth/logout");
        self.send("logout", || self.client.post(&url).bearer_auth(token))
            .await?;
        Ok(())
    }

    async fn fetch_credentials(&self, token: &str) -> Result<Vec<RemoteCredential>, ApiError> {
        let url = self.url("/passwords");
        let text = self
            .send("fetch_credentials", || self.client.get(&url).bearer_auth(token))
            .await?;
        parse_data(&text)
    }

    async fn create_credential(&self, token: &str, payload: &CredentialPayload) -> Result<String, ApiError> {
        let url = self.url("/passwords");
        let text = self
            .send("create_credential", || {
                self.client.post(&url).bearer_auth(token).json(payload)
            })
            .await?;
        let created: CreatedCredential = parse_data(&text)?;
        Ok(created.id)
    }

    async fn update_credential(&self, token: &str, id: &str, payload: &CredentialPayload) -> Result<(), ApiError> {
        let url = self.url(&format!("/passwords/{}", id));
        let text = self
            .send("update_credential", || {
                self.client.put(&url).bearer_auth(token).json(payload)
            })
            .await?;
        parse_envelope::<serde_json::Value>(&text)?;
        Ok(())
    }

    async fn delete_credential(&self, token: &str, id: &str) -> Result<(), ApiError> {
        let url = self.url(&format!("/passwords/{}", id));
        let text = self
            .send("delete_credential", || self.client.delete(&url).bearer_auth(token))
            .await?;
        parse_envelope::<serde_json::Value>(&text)?;
        Ok(())
    }
}
