//! Message contract between the UI surfaces and the engine.
//!
//! Requests are a closed set tagged by `type`. Every request produces exactly
//! one `Response`, which always carries `success`; the rest of its fields
//! depend on the request.

use serde::{Deserialize, Serialize};

use crate::error::VaultError;
use crate::models::{CredentialPayload, CredentialRecord, OutboxAction, Settings};
use crate::sync::{ForceSyncOutcome, SyncReport, SyncStatus};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum Request {
    #[serde(rename = "checkLoginStatus")]
    CheckLoginStatus,

    #[serde(rename = "login")]
    Login { username: String, password: String },

    #[serde(rename = "logout")]
    Logout,

    #[serde(rename = "findCredentials")]
    FindCredentials { domain: String },

    #[serde(rename = "autofillCredentials", rename_all = "camelCase")]
    AutofillCredentials {
        tab_id: i64,
        credential: AutofillCredential,
    },

    #[serde(rename = "SYNC_NOW")]
    SyncNow,

    #[serde(rename = "SYNC_STATUS")]
    SyncStatus,

    #[serde(rename = "FORCE_SYNC_CREDENTIAL", rename_all = "camelCase")]
    ForceSyncCredential {
        #[serde(default)]
        credential_id: Option<String>,
        operation: OutboxAction,
        #[serde(default)]
        data: Option<CredentialPayload>,
    },

    #[serde(rename = "SETTINGS_UPDATED")]
    SettingsUpdated { settings: Settings },

    #[serde(rename = "lock")]
    Lock,

    #[serde(rename = "clearCache")]
    ClearCache,

    #[serde(rename = "CONNECTIVITY_CHANGED")]
    ConnectivityChanged { online: bool },
}

impl Request {
    /// Name as it appears on the wire, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::CheckLoginStatus => "checkLoginStatus",
            Request::Login { .. } => "login",
            Request::Logout => "logout",
            Request::FindCredentials { .. } => "findCredentials",
            Request::AutofillCredentials { .. } => "autofillCredentials",
            Request::SyncNow => "SYNC_NOW",
            Request::SyncStatus => "SYNC_STATUS",
            Request::ForceSyncCredential { .. } => "FORCE_SYNC_CREDENTIAL",
            Request::SettingsUpdated { .. } => "SETTINGS_UPDATED",
            Request::Lock => "lock",
            Request::ClearCache => "clearCache",
            Request::ConnectivityChanged { .. } => "CONNECTIVITY_CHANGED",
        }
    }

    /// Requests that need an unlocked session. Handling one counts as
    /// user activity.
    pub fn requires_session(&self) -> bool {
        matches!(
            self,
            Request::FindCredentials { .. }
                | Request::AutofillCredentials { .. }
                | Request::SyncNow
                | Request::ForceSyncCredential { .. }
        )
    }
}

/// Credential chosen for autofill, echoed back to the content script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct AutofillCredential {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    pub username: String,
    pub password: String,
}

/// Reply to one `Request`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub body: Option<ResponseBody>,
}

/// Request-specific fields, flattened into the response object.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ResponseBody {
    #[serde(rename_all = "camelCase")]
    LoginStatus {
        is_logged_in: bool,
        username: Option<String>,
        is_online: bool,
    },
    #[serde(rename_all = "camelCase")]
    Credentials {
        credentials: Vec<CredentialRecord>,
        /// True when served from the local cache without a fresh pull.
        from_cache: bool,
    },
    #[serde(rename_all = "camelCase")]
    Autofill {
        tab_id: i64,
        credential: AutofillCredential,
    },
    Report(SyncReport),
    Status(SyncStatus),
    ForceSync(ForceSyncOutcome),
    Settings { settings: Settings },
}

impl Response {
    pub fn ok(body: ResponseBody) -> Self {
        Self {
            success: true,
            error: None,
            code: None,
            body: Some(body),
        }
    }

    /// Success with nothing else to report.
    pub fn ack() -> Self {
        Self {
            success: true,
            error: None,
            code: None,
            body: None,
        }
    }

    pub fn failure(err: &VaultError) -> Self {
        Self {
            success: false,
            error: Some(err.to_string()),
            code: Some(err.code()),
            body: None,
        }
    }

    /// Failure for input that never parsed into a `Request`.
    pub fn unparseable(detail: impl std::fmt::Display) -> Self {
        Self::failure(&VaultError::InvalidRequest(detail.to_string()))
    }
}
