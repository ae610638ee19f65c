//! Reconciling a full remote pull with mutations still waiting in the outbox.
//!
//! Last-write-wins by modification time:
//! - no pending entries: the remote copy is taken as-is
//! - pending delete: the record stays absent
//! - pending create/update: the local copy is kept, unless the remote copy
//!   carries a timestamp strictly newer than every pending entry, in which
//!   case the remote wins and the entries are superseded
//! - local records the remote no longer has survive only while they have
//!   pending non-delete entries

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::models::{CredentialRecord, OutboxAction, RemoteCredential, SyncOutboxEntry};

/// Result of merging one pull.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// The collection to store.
    pub records: Vec<CredentialRecord>,
    /// Outbox entries overtaken by a newer remote copy; mark them synced.
    pub superseded: Vec<i64>,
    /// Credentials where the remote copy overrode a pending local edit.
    pub conflicts: usize,
}

pub fn merge_pull(
    remote: Vec<RemoteCredential>,
    local: &[CredentialRecord],
    pending: &[SyncOutboxEntry],
    now: DateTime<Utc>,
) -> MergeOutcome {
    let mut by_credential: HashMap<&str, Vec<&SyncOutboxEntry>> = HashMap::new();
    for entry in pending {
        by_credential.entry(entry.credential_id.as_str()).or_default().push(entry);
    }
    let local_by_id: HashMap<&str, &CredentialRecord> =
        local.iter().map(|r| (r.id.as_str(), r)).collect();

    let mut outcome = MergeOutcome::default();
    let mut seen: HashSet<String> = HashSet::new();

    for remote in remote {
        seen.insert(remote.id.clone());
        let Some(entries) = by_credential.get(remote.id.as_str()) else {
            outcome.records.push(CredentialRecord::from_remote(remote, now));
            continue;
        };

        if entries.iter().any(|e| e.action == OutboxAction::Delete) {
            continue;
        }

        let remote_newer = remote
            .updated_at
            .map(|at| entries.iter().all(|e| at > e.timestamp))
            .unwrap_or(false);

        match local_by_id.get(remote.id.as_str()) {
            Some(record) if !remote_newer => outcome.records.push((*record).clone()),
            _ => {
                if remote_newer {
                    warn!(
                        credential_id = %remote.id,
                        superseded = entries.len(),
                        "Remote copy is newer than pending local edits, taking remote"
                    );
                    outcome.superseded.extend(entries.iter().map(|e| e.id));
                    outcome.conflicts += 1;
                }
                outcome.records.push(CredentialRecord::from_remote(remote, now));
            }
        }
    }

    for record in local {
        if seen.contains(&record.id) {
            continue;
        }
        let keep = by_credential
            .get(record.id.as_str())
            .map(|entries| entries.iter().all(|e| e.action != OutboxAction::Delete))
            .unwrap_or(false);
        if keep {
            outcome.records.push(record.clone());
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn remote(id: &str, username: &str, updated_at: Option<DateTime<Utc>>) -> RemoteCredential {
        RemoteCredential {
            id: id.to_string(),
            website: "github.com".to_string(),
            username: username.to_string(),
            password: "pw".to_string(),
            notes: None,
            otp_secret: None,
            folder_id: None,
            updated_at,
        }
    }

    fn local(id: &str, username: &str, at: DateTime<Utc>) -> CredentialRecord {
        CredentialRecord::from_remote(remote(id, username, Some(at)), at)
    }

    fn entry(id: i64, action: OutboxAction, credential_id: &str, at: DateTime<Utc>) -> SyncOutboxEntry {
        SyncOutboxEntry {
            id,
            action,
            credential_id: credential_id.to_string(),
            payload: None,
            timestamp: at,
            synced: false,
            synced_at: None,
            attempts: 0,
            dead_letter: false,
        }
    }

    fn usernames(outcome: &MergeOutcome) -> Vec<(String, String)> {
        let mut out: Vec<_> = outcome
            .records
            .iter()
            .map(|r| (r.id.clone(), r.username.clone()))
            .collect();
        out.sort();
        out
    }

    #[test]
    fn test_no_pending_takes_remote() {
        let now = Utc::now();
        let outcome = merge_pull(
            vec![remote("1", "server", None)],
            &[local("1", "stale", now), local("2", "deleted-remotely", now)],
            &[],
            now,
        );
        assert_eq!(usernames(&outcome), vec![("1".into(), "server".into())]);
        assert_eq!(outcome.conflicts, 0);
    }

    #[test]
    fn test_pending_update_keeps_local_when_remote_not_newer() {
        let edited = Utc::now();
        let outcome = merge_pull(
            vec![remote("1", "server", Some(edited - Duration::minutes(5))), remote("2", "other", None)],
            &[local("1", "mine", edited)],
            &[entry(10, OutboxAction::Update, "1", edited)],
            edited,
        );
        assert_eq!(
            usernames(&outcome),
            vec![("1".into(), "mine".into()), ("2".into(), "other".into())]
        );
        assert!(outcome.superseded.is_empty());
    }

    #[test]
    fn test_untimestamped_remote_never_beats_pending_edit() {
        let now = Utc::now();
        let outcome = merge_pull(
            vec![remote("1", "server", None)],
            &[local("1", "mine", now)],
            &[entry(10, OutboxAction::Update, "1", now)],
            now,
        );
        assert_eq!(usernames(&outcome), vec![("1".into(), "mine".into())]);
    }

    #[test]
    fn test_strictly_newer_remote_supersedes_pending() {
        let edited = Utc::now();
        let outcome = merge_pull(
            vec![remote("1", "server", Some(edited + Duration::seconds(1)))],
            &[local("1", "mine", edited)],
            &[
                entry(10, OutboxAction::Update, "1", edited - Duration::seconds(1)),
                entry(11, OutboxAction::Update, "1", edited),
            ],
            edited,
        );
        assert_eq!(usernames(&outcome), vec![("1".into(), "server".into())]);
        assert_eq!(outcome.superseded, vec![10, 11]);
        assert_eq!(outcome.conflicts, 1);
    }

    #[test]
    fn test_pending_delete_keeps_record_absent() {
        let now = Utc::now();
        let outcome = merge_pull(
            vec![remote("1", "server", Some(now + Duration::hours(1)))],
            &[],
            &[
                entry(10, OutboxAction::Update, "1", now),
                entry(11, OutboxAction::Delete, "1", now),
            ],
            now,
        );
        assert!(outcome.records.is_empty());
        assert!(outcome.superseded.is_empty());
    }

    #[test]
    fn test_pending_create_survives_pull() {
        let now = Utc::now();
        let outcome = merge_pull(
            vec![],
            &[local("local-abc", "new", now)],
            &[entry(10, OutboxAction::Create, "local-abc", now)],
            now,
        );
        assert_eq!(usernames(&outcome), vec![("local-abc".into(), "new".into())]);
    }
}
