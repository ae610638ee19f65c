use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::{contains_ignore_case, host_matches};

/// Prefix for ids assigned to credentials created while offline.
/// The remote assigns the real id when the create is pushed.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// True for ids the remote has never acknowledged.
pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

/// Next `last_modified` stamp for a record.
///
/// Stamps never move backwards, even if the wall clock does: the result is
/// `now`, or one millisecond past `previous` when `now` is not later.
pub fn next_stamp(previous: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    match previous {
        Some(prev) if now <= prev => prev + Duration::milliseconds(1),
        _ => now,
    }
}

/// A credential as held in the local cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct CredentialRecord {
    pub id: String,
    pub website: String,
    pub username: String,
    pub password: String,
    pub notes: Option<String>,
    pub otp_secret: Option<String>,
    pub folder_id: Option<String>,
    pub last_modified: DateTime<Utc>,
    pub cached_at: DateTime<Utc>,
}

impl CredentialRecord {
    /// Build a fresh record from a payload (local create).
    pub fn from_payload(id: String, payload: &CredentialPayload, now: DateTime<Utc>) -> Self {
        Self {
            id,
            website: payload.website.clone(),
            username: payload.username.clone(),
            password: payload.password.clone(),
            notes: payload.notes.clone(),
            otp_secret: payload.otp_secret.clone(),
            folder_id: payload.folder_id.clone(),
            last_modified: now,
            cached_at: now,
        }
    }

    /// Build a record from a remote credential pulled at `now`.
    /// The remote modification time is kept when the server reports one.
    pub fn from_remote(remote: RemoteCredential, now: DateTime<Utc>) -> Self {
        let last_modified = remote.updated_at.unwrap_or(now);
        Self {
            id: remote.id,
            website: remote.website,
            username: remote.username,
            password: remote.password,
            notes: remote.notes,
            otp_secret: remote.otp_secret,
            folder_id: remote.folder_id,
            last_modified,
            cached_at: now,
        }
    }

    /// Overwrite the editable fields with `payload`, bumping `last_modified`.
    pub fn apply_payload(&mut self, payload: &CredentialPayload, now: DateTime<Utc>) {
        self.website = payload.website.clone();
        self.username = payload.username.clone();
        self.password = payload.password.clone();
        self.notes = payload.notes.clone();
        self.otp_secret = payload.otp_secret.clone();
        self.folder_id = payload.folder_id.clone();
        self.last_modified = next_stamp(Some(self.last_modified), now);
    }

    /// Snapshot of the editable fields, as queued in the outbox.
    pub fn payload(&self) -> CredentialPayload {
        CredentialPayload {
            website: self.website.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            notes: self.notes.clone(),
            otp_secret: self.otp_secret.clone(),
            folder_id: self.folder_id.clone(),
        }
    }

    /// Search across website, username and notes, ignoring case.
    pub fn matches_term(&self, term: &str) -> bool {
        contains_ignore_case(&self.website, term)
            || contains_ignore_case(&self.username, term)
            || self
                .notes
                .as_deref()
                .map(|n| contains_ignore_case(n, term))
                .unwrap_or(false)
    }

    /// True if the record's website belongs to `domain`.
    pub fn matches_domain(&self, domain: &str) -> bool {
        host_matches(&self.website, domain)
    }
}

/// The editable fields of a credential.
///
/// This is the body of `POST`/`PUT /passwords` and the snapshot stored with
/// outbox entries. The extension UI sends camelCase, the server snake_case;
/// both are accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct CredentialPayload {
    pub website: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default, alias = "otpSecret")]
    pub otp_secret: Option<String>,
    #[serde(default, alias = "folderId")]
    pub folder_id: Option<String>,
}

/// Credential shape returned by `GET /passwords`.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteCredential {
    pub id: String,
    pub website: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub otp_secret: Option<String>,
    #[serde(default)]
    pub folder_id: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}
