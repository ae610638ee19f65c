use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::CredentialPayload;

/// Kind of mutation queued in the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum OutboxAction {
    Create,
    Update,
    Delete,
}

impl OutboxAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxAction::Create => "create",
            OutboxAction::Update => "update",
            OutboxAction::Delete => "delete",
        }
    }
}

impl fmt::Display for OutboxAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(OutboxAction::Create),
            "update" => Ok(OutboxAction::Update),
            "delete" => Ok(OutboxAction::Delete),
            other => Err(format!("unknown outbox action: {}", other)),
        }
    }
}

/// A local mutation waiting for (or acknowledged by) the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOutboxEntry {
    pub id: i64,
    pub action: OutboxAction,
    pub credential_id: String,
    pub payload: Option<CredentialPayload>,
    pub timestamp: DateTime<Utc>,
    pub synced: bool,
    pub synced_at: Option<DateTime<Utc>>,
    /// Non-transient failures seen so far (rejections, malformed replies).
    pub attempts: u32,
    /// Parked after exhausting its attempts; no longer drained.
    pub dead_letter: bool,
}

impl SyncOutboxEntry {
    pub fn pending_item(&self) -> PendingItem {
        PendingItem {
            id: self.id,
            action: self.action,
            credential_id: self.credential_id.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Outbox entry summary exposed in the sync status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct PendingItem {
    pub id: i64,
    pub action: OutboxAction,
    pub credential_id: String,
    pub timestamp: DateTime<Utc>,
}
