//! In-memory `CredentialRemote` used by coordinator and engine tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use super::remote::{CredentialRemote, LoginGrant};
use super::ApiError;
use crate::models::{CredentialPayload, RemoteCredential};

pub const FAKE_USER: &str = "alice";
pub const FAKE_PASSWORD: &str = "correct horse";
pub const FAKE_TOKEN: &str = "token-1";

#[derive(Default)]
struct FakeState {
    records: BTreeMap<String, RemoteCredential>,
    failures: VecDeque<ApiError>,
    calls: Vec<String>,
    next_id: u32,
    revoked: bool,
}

#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<FakeState>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<RemoteCredential>) -> Self {
        let fake = Self::new();
        {
            let mut state = fake.state.lock().unwrap();
            for record in records {
                state.records.insert(record.id.clone(), record);
            }
        }
        fake
    }

    /// Make the next remote call fail with `err`.
    pub fn fail_next(&self, err: ApiError) {
        self.state.lock().unwrap().failures.push_back(err);
    }

    /// Reject every token from now on.
    pub fn revoke_tokens(&self) {
        self.state.lock().unwrap().revoked = true;
    }

    pub fn put(&self, record: RemoteCredential) {
        self.state.lock().unwrap().records.insert(record.id.clone(), record);
    }

    pub fn record(&self, id: &str) -> Option<RemoteCredential> {
        self.state.lock().unwrap().records.get(id).cloned()
    }

    pub fn records(&self) -> Vec<RemoteCredential> {
        self.state.lock().unwrap().records.values().cloned().collect()
    }

    /// Mutating calls seen so far, as `"<verb> <id>"`.
    pub fn calls(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.as_str() != "fetch")
            .cloned()
            .collect()
    }

    pub fn fetch_count(&self) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|c| c.as_str() == "fetch").count()
    }

    fn begin(&self, token: Option<&str>) -> Result<std::sync::MutexGuard<'_, FakeState>, ApiError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        if let Some(token) = token {
            if state.revoked || token != FAKE_TOKEN {
                return Err(ApiError::Unauthorized);
            }
        }
        Ok(state)
    }
}

pub fn remote_credential(id: &str, website: &str, username: &str) -> RemoteCredential {
    RemoteCredential {
        id: id.to_string(),
        website: website.to_string(),
        username: username.to_string(),
        password: format!("{}-secret", username),
        notes: None,
        otp_secret: None,
        folder_id: None,
        updated_at: None,
    }
}

fn apply(id: &str, payload: &CredentialPayload) -> RemoteCredential {
    RemoteCredential {
        id: id.to_string(),
        website: payload.website.clone(),
        username: payload.username.clone(),
        password: payload.password.clone(),
        notes: payload.notes.clone(),
        otp_secret: payload.otp_secret.clone(),
        folder_id: payload.folder_id.clone(),
        updated_at: None,
    }
}

#[async_trait]
impl CredentialRemote for FakeRemote {
    async fn login(&self, username: &str, password: &str) -> Result<LoginGrant, ApiError> {
        let mut state = self.begin(None)?;
        if username != FAKE_USER || password != FAKE_PASSWORD {
            return Err(ApiError::Unauthorized);
        }
        state.revoked = false;
        Ok(LoginGrant {
            access_token: FAKE_TOKEN.to_string(),
            refresh_token: None,
            expires_in: Some(900),
        })
    }

    async fn verify(&self, token: &str) -> Result<(), ApiError> {
        self.begin(Some(token)).map(|_| ())
    }

    async fn logout(&self, token: &str) -> Result<(), ApiError> {
        let mut state = self.begin(Some(token))?;
        state.revoked = true;
        Ok(())
    }

    async fn fetch_credentials(&self, token: &str) -> Result<Vec<RemoteCredential>, ApiError> {
        // Yield once so concurrent callers observe a pull in flight.
        tokio::task::yield_now().await;
        let mut state = self.begin(Some(token))?;
        state.calls.push("fetch".to_string());
        Ok(state.records.values().cloned().collect())
    }

    async fn create_credential(&self, token: &str, payload: &CredentialPayload) -> Result<String, ApiError> {
        let mut state = self.begin(Some(token))?;
        state.next_id += 1;
        let id = format!("srv-{}", state.next_id);
        state.records.insert(id.clone(), apply(&id, payload));
        state.calls.push(format!("create {}", id));
        Ok(id)
    }

    async fn update_credential(&self, token: &str, id: &str, payload: &CredentialPayload) -> Result<(), ApiError> {
        let mut state = self.begin(Some(token))?;
        if !state.records.contains_key(id) {
            return Err(ApiError::Gone(format!("Password {} not found", id)));
        }
        state.records.insert(id.to_string(), apply(id, payload));
        state.calls.push(format!("update {}", id));
        Ok(())
    }

    async fn delete_credential(&self, token: &str, id: &str) -> Result<(), ApiError> {
        let mut state = self.begin(Some(token))?;
        if state.records.remove(id).is_none() {
            return Err(ApiError::Gone(format!("Password {} not found", id)));
        }
        state.calls.push(format!("delete {}", id));
        Ok(())
    }
}
