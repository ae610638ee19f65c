use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::merge::merge_pull;
use crate::api::{ApiError, CredentialRemote};
use crate::auth::{LockReason, SessionGuard, SessionToken};
use crate::cache::{meta_keys, LocalStore};
use crate::error::{Result, VaultError};
use crate::models::credential::LOCAL_ID_PREFIX;
use crate::models::{is_local_id, CredentialPayload, CredentialRecord, OutboxAction, PendingItem, SyncOutboxEntry};
use crate::utils::{Clock, SystemClock};

// ============================================================================
// Constants
// ============================================================================

/// Non-transient failures an outbox entry may accumulate before it is
/// parked as a dead letter. Transient failures never count.
pub const MAX_PUSH_ATTEMPTS: u32 = 5;

/// How long acknowledged outbox entries are kept before pruning.
const SYNCED_RETENTION_DAYS: i64 = 7;

// ============================================================================
// Reports
// ============================================================================

/// Counts from one sync or drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SyncReport {
    /// Credentials stored by the pull (0 for a drain-only pass).
    pub pulled: usize,
    /// Outbox entries acknowledged by the remote.
    pub pushed: usize,
    /// Outbox entries that failed this pass and stay pending.
    pub failed: usize,
    /// Local edits overridden by a newer remote copy, or updates whose
    /// remote record was already gone.
    pub conflicts: usize,
}

/// Aggregate state for the popup.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub pending_items: Vec<PendingItem>,
    pub dead_letter_count: usize,
}

/// How the remote settled one outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Acknowledged,
    /// An update targeted a record the remote no longer has. Treated as
    /// final: the local copy is dropped.
    RemoteGone,
}

/// Result of a forced single-credential sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct ForceSyncOutcome {
    /// Id of the credential after the push; a create may have re-keyed it.
    pub credential_id: String,
    /// False if the edit is still waiting in the outbox.
    pub synced: bool,
}

struct FullSyncGate {
    /// Highest request ticket covered by a successful run.
    completed: u64,
    last_report: Option<SyncReport>,
}

/// Marks a pass as running for `SyncStatus::is_syncing`.
struct PassFlag<'a>(&'a AtomicUsize);

impl<'a> PassFlag<'a> {
    fn raise(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PassFlag<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Reconciles the local store with the remote authority.
///
/// - `full_sync` pulls everything, merges it with pending local edits, then
///   drains the outbox. Concurrent calls coalesce.
/// - `drain_outbox` pushes pending entries in order.
/// - `force_sync_credential` applies a local edit and pushes it right away
///   when possible.
///
/// Store writes and outbox drains are serialized by `outbox_lock`, so a
/// background drain never interleaves with a manual one.
pub struct SyncCoordinator {
    store: Arc<LocalStore>,
    remote: Arc<dyn CredentialRemote>,
    guard: SessionGuard,
    clock: Arc<dyn Clock>,
    online: AtomicBool,
    passes: AtomicUsize,
    requested: AtomicU64,
    full_sync_gate: Mutex<FullSyncGate>,
    outbox_lock: Mutex<()>,
}

impl SyncCoordinator {
    pub fn new(store: Arc<LocalStore>, remote: Arc<dyn CredentialRemote>, guard: SessionGuard) -> Self {
        Self {
            store,
            remote,
            guard,
            clock: Arc::new(SystemClock),
            online: AtomicBool::new(true),
            passes: AtomicUsize::new(0),
            requested: AtomicU64::new(0),
            full_sync_gate: Mutex::new(FullSyncGate {
                completed: 0,
                last_report: None,
            }),
            outbox_lock: Mutex::new(()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn is_syncing(&self) -> bool {
        self.passes.load(Ordering::SeqCst) > 0
    }

    /// Record a connectivity change. Coming back online starts a drain in the
    /// background; its handle is returned so callers may await it.
    pub fn set_online(self: &Arc<Self>, online: bool) -> Option<JoinHandle<()>> {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        match (was_online, online) {
            (false, true) => {
                info!("Connectivity restored, draining outbox");
                let this = Arc::clone(self);
                Some(tokio::spawn(async move {
                    match this.drain_outbox().await {
                        Ok(report) => info!(pushed = report.pushed, failed = report.failed, "Reconnect drain finished"),
                        Err(VaultError::Locked) => debug!("Session locked, reconnect drain skipped"),
                        Err(e) => warn!(error = %e, "Reconnect drain failed"),
                    }
                }))
            }
            (true, false) => {
                info!("Connectivity lost, queueing changes locally");
                None
            }
            _ => None,
        }
    }

    /// Lock the session when the remote reports the token expired.
    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(VaultError::AuthExpired) = &result {
            self.guard.lock_now(LockReason::AuthExpired);
        }
        result
    }

    fn session_token(&self) -> Result<SessionToken> {
        self.guard.token().ok_or(VaultError::Locked)
    }

    // ===== Full sync =====

    /// Pull the remote set, merge it with pending edits and drain the outbox.
    ///
    /// Fails with `Offline` without touching the cache or outbox when there is
    /// no connectivity. Calls that arrive while a run is in flight share one
    /// follow-up run; a caller whose request was covered by a completed run
    /// gets that run's report.
    pub async fn full_sync(&self) -> Result<SyncReport> {
        if !self.is_online() {
            return Err(VaultError::Offline);
        }

        let ticket = self.requested.fetch_add(1, Ordering::SeqCst) + 1;
        let _pass = PassFlag::raise(&self.passes);
        let mut gate = self.full_sync_gate.lock().await;
        if gate.completed >= ticket {
            if let Some(report) = gate.last_report.clone() {
                debug!(ticket, completed = gate.completed, "Full sync coalesced into a completed run");
                return Ok(report);
            }
        }

        let covers = self.requested.load(Ordering::SeqCst);
        let result = self.run_full_sync().await;
        if let Ok(report) = &result {
            gate.completed = covers;
            gate.last_report = Some(report.clone());
        }
        self.observe(result)
    }

    async fn run_full_sync(&self) -> Result<SyncReport> {
        let _outbox = self.outbox_lock.lock().await;
        if !self.is_online() {
            return Err(VaultError::Offline);
        }
        let token = self.session_token()?;

        info!("Starting full sync");
        let remote = self.remote.fetch_credentials(token.expose()).await?;
        let now = self.clock.now();
        let local = self.store.list_credentials()?;
        // Dead letters count too: a credential parked behind one must survive the pull.
        let pending = self.store.list_unsynced_outbox()?;
        debug!(remote = remote.len(), local = local.len(), pending = pending.len(), "Merging pull");

        let merged = merge_pull(remote, &local, &pending, now);
        for entry_id in &merged.superseded {
            self.store.mark_outbox_synced(*entry_id, now)?;
        }
        let pulled = self.store.replace_all_credentials(&merged.records, now)?;

        let mut report = self.drain_locked(&token).await?;
        report.pulled = pulled;
        report.conflicts += merged.conflicts;
        self.finish_pass();

        info!(
            pulled = report.pulled,
            pushed = report.pushed,
            failed = report.failed,
            conflicts = report.conflicts,
            "Full sync complete"
        );
        Ok(report)
    }

    // ===== Outbox =====

    /// Push every pending entry in order.
    ///
    /// The pass stops at the first transient failure or when the token
    /// expires. After a non-transient failure, later entries for the same
    /// credential are skipped until the next pass. A dead letter holds back
    /// its credential's later entries until it is pushed with `push_one`.
    pub async fn drain_outbox(&self) -> Result<SyncReport> {
        if !self.is_online() {
            return Err(VaultError::Offline);
        }
        let _pass = PassFlag::raise(&self.passes);
        let _outbox = self.outbox_lock.lock().await;
        let result: Result<SyncReport> = async {
            let token = self.session_token()?;
            let report = self.drain_locked(&token).await?;
            self.finish_pass();
            Ok(report)
        }
        .await;
        self.observe(result)
    }

    async fn drain_locked(&self, token: &SessionToken) -> Result<SyncReport> {
        let (parked, pending): (Vec<_>, Vec<_>) = self
            .store
            .list_unsynced_outbox()?
            .into_iter()
            .partition(|entry| entry.dead_letter);
        let mut report = SyncReport::default();
        if pending.is_empty() {
            debug!(dead_letters = parked.len(), "Outbox empty");
            return Ok(report);
        }

        let mut blocked: HashSet<String> = parked.into_iter().map(|entry| entry.credential_id).collect();
        for queued in pending {
            if !self.is_online() {
                info!("Went offline during drain, stopping");
                break;
            }
            // Re-read: an earlier create in this pass may have re-keyed it.
            let Some(entry) = self.store.get_outbox_entry(queued.id)? else {
                continue;
            };
            if entry.synced || entry.dead_letter {
                continue;
            }
            if blocked.contains(&entry.credential_id) {
                debug!(entry_id = entry.id, credential_id = %entry.credential_id, "Skipping entry behind a failed one");
                continue;
            }
            if entry.action != OutboxAction::Create && is_local_id(&entry.credential_id) {
                warn!(entry_id = entry.id, credential_id = %entry.credential_id, "Credential was never created remotely, holding entry");
                blocked.insert(entry.credential_id.clone());
                continue;
            }

            match self.push_entry(token, &entry).await {
                Ok(PushOutcome::Acknowledged) => report.pushed += 1,
                Ok(PushOutcome::RemoteGone) => {
                    report.pushed += 1;
                    report.conflicts += 1;
                }
                Err(VaultError::AuthExpired) => {
                    warn!(entry_id = entry.id, "Token rejected, ending drain");
                    return Err(VaultError::AuthExpired);
                }
                Err(e) if e.is_transient() => {
                    report.failed += 1;
                    info!(entry_id = entry.id, error = %e, "Transient push failure, ending drain");
                    break;
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(entry_id = entry.id, credential_id = %entry.credential_id, error = %e, "Push failed");
                    blocked.insert(entry.credential_id.clone());
                }
            }
        }

        debug!(pushed = report.pushed, failed = report.failed, "Drain pass finished");
        Ok(report)
    }

    /// Send one outbox entry to the remote. An already synced entry is a
    /// no-op; a dead-lettered one is retried.
    ///
    /// Only the oldest unsynced entry of a credential may be pushed; anything
    /// queued behind another entry fails with `InvalidRequest`.
    pub async fn push_one(&self, entry_id: i64) -> Result<PushOutcome> {
        let _outbox = self.outbox_lock.lock().await;
        let result: Result<PushOutcome> = async {
            let entry = self
                .store
                .get_outbox_entry(entry_id)?
                .ok_or_else(|| VaultError::InvalidRequest(format!("no outbox entry {}", entry_id)))?;
            if entry.synced {
                return Ok(PushOutcome::Acknowledged);
            }
            let head = self
                .store
                .list_unsynced_outbox()?
                .into_iter()
                .find(|queued| queued.credential_id == entry.credential_id);
            if let Some(head) = head.filter(|head| head.id != entry.id) {
                return Err(VaultError::InvalidRequest(format!(
                    "outbox entry {} is queued behind entry {} for credential {}",
                    entry.id, head.id, entry.credential_id
                )));
            }
            if entry.action != OutboxAction::Create && is_local_id(&entry.credential_id) {
                return Err(VaultError::InvalidRequest(format!(
                    "credential {} has not been created remotely",
                    entry.credential_id
                )));
            }
            if !self.is_online() {
                return Err(VaultError::Offline);
            }
            let token = self.session_token()?;
            self.push_entry(&token, &entry).await
        }
        .await;
        self.observe(result)
    }

    async fn push_entry(&self, token: &SessionToken, entry: &SyncOutboxEntry) -> Result<PushOutcome> {
        match self.send_entry(token.expose(), entry).await {
            Ok(outcome) => {
                self.store.mark_outbox_synced(entry.id, self.clock.now())?;
                debug!(entry_id = entry.id, action = %entry.action, ?outcome, "Outbox entry synced");
                Ok(outcome)
            }
            Err(e) if e.is_transient() || matches!(e, VaultError::AuthExpired) => Err(e),
            Err(e) => {
                let parked = self.store.record_outbox_failure(entry.id, MAX_PUSH_ATTEMPTS)?;
                if parked {
                    error!(
                        entry_id = entry.id,
                        credential_id = %entry.credential_id,
                        max_attempts = MAX_PUSH_ATTEMPTS,
                        error = %e,
                        "Outbox entry dead-lettered"
                    );
                }
                Err(e)
            }
        }
    }

    async fn send_entry(&self, token: &str, entry: &SyncOutboxEntry) -> Result<PushOutcome> {
        let id = entry.credential_id.as_str();
        match entry.action {
            OutboxAction::Create => {
                let payload = entry_payload(entry)?;
                let assigned = self.remote.create_credential(token, payload).await?;
                if assigned != id {
                    self.store.reassign_credential_id(id, &assigned)?;
                }
                Ok(PushOutcome::Acknowledged)
            }
            OutboxAction::Update => {
                let payload = entry_payload(entry)?;
                match self.remote.update_credential(token, id, payload).await {
                    Ok(()) => Ok(PushOutcome::Acknowledged),
                    Err(ApiError::Gone(_)) => {
                        warn!(credential_id = id, "Remote record deleted, dropping local update");
                        self.store.delete_credential(id)?;
                        Ok(PushOutcome::RemoteGone)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            OutboxAction::Delete => match self.remote.delete_credential(token, id).await {
                Ok(()) => Ok(PushOutcome::Acknowledged),
                Err(ApiError::Gone(_)) => {
                    debug!(credential_id = id, "Remote record already deleted");
                    Ok(PushOutcome::Acknowledged)
                }
                Err(e) => Err(e.into()),
            },
        }
    }

    fn finish_pass(&self) {
        let now = self.clock.now();
        if let Err(e) = self.store.set_metadata(meta_keys::LAST_SYNC_TIME, &now) {
            warn!(error = %e, "Failed to record last sync time");
        }
        let cutoff = now - chrono::Duration::days(SYNCED_RETENTION_DAYS);
        match self.store.prune_synced_outbox(cutoff) {
            Ok(0) => {}
            Ok(pruned) => debug!(pruned, "Pruned acknowledged outbox entries"),
            Err(e) => warn!(error = %e, "Failed to prune outbox"),
        }
    }

    // ===== Local edits =====

    /// Apply a local edit, queue it, and push it immediately when online.
    ///
    /// Offline (or on a transient failure) the edit simply stays pending.
    /// Earlier pending entries are pushed first so per-credential order holds.
    pub async fn force_sync_credential(
        &self,
        credential_id: Option<&str>,
        action: OutboxAction,
        payload: Option<CredentialPayload>,
    ) -> Result<ForceSyncOutcome> {
        let _outbox = self.outbox_lock.lock().await;
        let (credential_id, entry_id) = self.apply_local(credential_id, action, payload.as_ref())?;

        let Some(entry_id) = entry_id else {
            return Ok(ForceSyncOutcome {
                credential_id,
                synced: true,
            });
        };
        let pending = ForceSyncOutcome {
            credential_id: credential_id.clone(),
            synced: false,
        };
        if !self.is_online() {
            info!(%credential_id, %action, "Offline, edit queued");
            return Ok(pending);
        }
        let Some(token) = self.guard.token() else {
            debug!(%credential_id, "Session locked, edit queued");
            return Ok(pending);
        };

        let _pass = PassFlag::raise(&self.passes);
        let drained = self.drain_locked(&token).await;
        self.observe(drained)?;
        self.finish_pass();

        Ok(match self.store.get_outbox_entry(entry_id)? {
            Some(entry) => ForceSyncOutcome {
                credential_id: entry.credential_id,
                synced: entry.synced,
            },
            None => pending,
        })
    }

    /// Write the edit to the cache and append its outbox entry.
    /// Returns the credential id and the entry id, if one was queued.
    fn apply_local(
        &self,
        credential_id: Option<&str>,
        action: OutboxAction,
        payload: Option<&CredentialPayload>,
    ) -> Result<(String, Option<i64>)> {
        let now = self.clock.now();
        match action {
            OutboxAction::Create => {
                let payload = require_payload(action, payload)?;
                let id = match credential_id {
                    Some(id) if !id.trim().is_empty() => id.to_string(),
                    _ => format!("{}{}", LOCAL_ID_PREFIX, Uuid::new_v4()),
                };
                let stored = self
                    .store
                    .upsert_credential(&CredentialRecord::from_payload(id.clone(), payload, now))?;
                let entry_id = self
                    .store
                    .append_outbox_entry(action, &id, Some(payload), stored.last_modified)?;
                Ok((id, Some(entry_id)))
            }
            OutboxAction::Update => {
                let id = require_id(action, credential_id)?;
                let payload = require_payload(action, payload)?;
                let record = match self.store.get_credential(id)? {
                    Some(mut record) => {
                        record.apply_payload(payload, now);
                        record
                    }
                    None => CredentialRecord::from_payload(id.to_string(), payload, now),
                };
                let stored = self.store.upsert_credential(&record)?;
                let entry_id = self
                    .store
                    .append_outbox_entry(action, id, Some(payload), stored.last_modified)?;
                Ok((id.to_string(), Some(entry_id)))
            }
            OutboxAction::Delete => {
                let id = require_id(action, credential_id)?;
                self.store.delete_credential(id)?;
                if is_local_id(id) {
                    // Never reached the remote: cancel its queued entries.
                    for entry in self.store.list_unsynced_outbox()? {
                        if entry.credential_id == id {
                            self.store.mark_outbox_synced(entry.id, now)?;
                        }
                    }
                    debug!(credential_id = id, "Cancelled unsent local credential");
                    return Ok((id.to_string(), None));
                }
                let entry_id = self.store.append_outbox_entry(action, id, None, now)?;
                Ok((id.to_string(), Some(entry_id)))
            }
        }
    }

    // ===== Status =====

    /// Snapshot for the popup. Store failures degrade to empty values.
    pub fn status(&self) -> SyncStatus {
        let pending_items = self
            .store
            .list_pending_outbox()
            .map(|entries| entries.iter().map(SyncOutboxEntry::pending_item).collect())
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to read outbox for status");
                Vec::new()
            });
        let dead_letter_count = self
            .store
            .outbox_stats()
            .map(|stats| stats.dead_letter)
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to read outbox stats");
                0
            });
        let last_sync_time = self
            .store
            .get_metadata(meta_keys::LAST_SYNC_TIME)
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to read last sync time");
                None
            });

        SyncStatus {
            is_online: self.is_online(),
            is_syncing: self.is_syncing(),
            last_sync_time,
            pending_items,
            dead_letter_count,
        }
    }

    // ===== Background =====

    /// Drain on a fixed interval while online and unlocked.
    /// The task ends once the coordinator is dropped.
    pub fn spawn_periodic(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(this) = weak.upgrade() else {
                    debug!("Coordinator dropped, stopping periodic drain");
                    break;
                };
                if !this.is_online() || !this.guard.is_unlocked() {
                    continue;
                }
                match this.drain_outbox().await {
                    Ok(report) if report.pushed > 0 || report.failed > 0 => {
                        info!(pushed = report.pushed, failed = report.failed, "Periodic drain");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Periodic drain failed"),
                }
            }
        })
    }
}

fn require_id(action: OutboxAction, id: Option<&str>) -> Result<&str> {
    id.filter(|id| !id.trim().is_empty())
        .ok_or_else(|| VaultError::InvalidRequest(format!("{} requires a credential id", action)))
}

fn require_payload(action: OutboxAction, payload: Option<&CredentialPayload>) -> Result<&CredentialPayload> {
    payload.ok_or_else(|| VaultError::InvalidRequest(format!("{} requires credential data", action)))
}

fn entry_payload(entry: &SyncOutboxEntry) -> Result<&CredentialPayload> {
    entry.payload.as_ref().ok_or_else(|| {
        VaultError::InvalidRequest(format!("outbox entry {} has no payload", entry.id))
    })
}
