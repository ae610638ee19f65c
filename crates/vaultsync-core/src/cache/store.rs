use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use super::StoreError;
use crate::models::{next_stamp, CredentialPayload, CredentialRecord, OutboxAction, SyncOutboxEntry};

/// Well-known metadata keys.
pub mod meta_keys {
    /// When the credential collection was last repopulated from a full pull.
    pub const LAST_CACHE_UPDATE: &str = "last_cache_update";
    /// Number of credentials written by the last full pull.
    pub const CACHED_COUNT: &str = "cached_count";
    /// When the coordinator last completed a sync pass.
    pub const LAST_SYNC_TIME: &str = "last_sync_time";
    /// Encrypted session token (base64 nonce || ciphertext).
    pub const SESSION_TOKEN: &str = "session_token";
    /// Symmetric key protecting the session token.
    pub const TOKEN_KEY: &str = "token_key";
    /// Settings last pushed by the options page.
    pub const SETTINGS: &str = "settings";
    /// Username of the signed-in account.
    pub const USERNAME: &str = "username";
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS credentials (
        id            TEXT PRIMARY KEY,
        website       TEXT NOT NULL,
        username      TEXT NOT NULL,
        password      TEXT NOT NULL,
        notes         TEXT,
        otp_secret    TEXT,
        folder_id     TEXT,
        last_modified INTEGER NOT NULL,
        cached_at     INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_credentials_website ON credentials(website);
    CREATE INDEX IF NOT EXISTS idx_credentials_username ON credentials(username);
    CREATE INDEX IF NOT EXISTS idx_credentials_last_modified ON credentials(last_modified);

    CREATE TABLE IF NOT EXISTS sync_outbox (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        action        TEXT NOT NULL,
        credential_id TEXT NOT NULL,
        payload       TEXT,
        timestamp     INTEGER NOT NULL,
        synced        INTEGER NOT NULL DEFAULT 0,
        synced_at     INTEGER,
        attempts      INTEGER NOT NULL DEFAULT 0,
        dead_letter   INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_outbox_action ON sync_outbox(action);
    CREATE INDEX IF NOT EXISTS idx_outbox_timestamp ON sync_outbox(timestamp);
    CREATE INDEX IF NOT EXISTS idx_outbox_synced ON sync_outbox(synced);

    CREATE TABLE IF NOT EXISTS metadata (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

const CREDENTIAL_COLS: &str =
    "id, website, username, password, notes, otp_secret, folder_id, last_modified, cached_at";

const OUTBOX_COLS: &str =
    "id, action, credential_id, payload, timestamp, synced, synced_at, attempts, dead_letter";

/// Counts of outbox entries by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxStats {
    pub pending: usize,
    pub dead_letter: usize,
    pub synced: usize,
}

/// Durable storage for cached credentials, the sync outbox and metadata.
///
/// A single SQLite connection sits behind a mutex, so every public method is
/// one atomic unit with respect to every other caller.
pub struct LocalStore {
    conn: Mutex<Connection>,
    persistent: bool,
}

impl LocalStore {
    /// Open (or create) the database at `path`.
    ///
    /// Fails with `StoreError::Unavailable` when the file cannot be created or
    /// opened; callers degrade to an ephemeral store in that case.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Unavailable(format!("cannot open {}: {}", path.display(), e)))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        info!(path = %path.display(), "Opened local store");
        Self::initialize(conn, true)
    }

    /// Open a store that lives only as long as the process.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::initialize(conn, false)
    }

    fn initialize(conn: Connection, persistent: bool) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::Unavailable(format!("schema setup failed: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
            persistent,
        })
    }

    /// False for the in-memory fallback store.
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Run `f` inside one transaction, committing on success.
    fn with_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    // ===== Credentials =====

    /// Atomically replace the whole credential collection (after a full pull).
    ///
    /// `cached_at` is stamped with `now`. `last_modified` never moves backwards
    /// relative to the record being replaced, and strictly advances when the
    /// content changed.
    pub fn replace_all_credentials(
        &self,
        records: &[CredentialRecord],
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        self.with_tx(|tx| {
            let previous: HashMap<String, CredentialRecord> = query_credentials(tx, "", [])?
                .into_iter()
                .map(|r| (r.id.clone(), r))
                .collect();

            tx.execute("DELETE FROM credentials", [])?;

            for record in records {
                let mut stamped = record.clone();
                stamped.cached_at = now;
                if let Some(prev) = previous.get(&record.id) {
                    stamped.last_modified = if prev.payload() == record.payload() {
                        record.last_modified.max(prev.last_modified)
                    } else {
                        next_stamp(Some(prev.last_modified), record.last_modified)
                    };
                }
                insert_credential(tx, &stamped)?;
            }

            put_meta(tx, meta_keys::LAST_CACHE_UPDATE, &now)?;
            put_meta(tx, meta_keys::CACHED_COUNT, &records.len())?;
            Ok(records.len())
        })
        .inspect(|count| debug!(count, "Replaced cached credentials"))
    }

    /// Insert or update one credential, returning the record as stored.
    pub fn upsert_credential(&self, record: &CredentialRecord) -> Result<CredentialRecord, StoreError> {
        self.with_tx(|tx| {
            let mut stored = record.clone();
            let existing = query_credentials(tx, "WHERE id = ?1", [&record.id])?.pop();
            if let Some(prev) = existing {
                if stored.last_modified <= prev.last_modified {
                    stored.last_modified = next_stamp(Some(prev.last_modified), stored.last_modified);
                }
            }
            tx.execute("DELETE FROM credentials WHERE id = ?1", [&stored.id])?;
            insert_credential(tx, &stored)?;
            Ok(stored)
        })
    }

    pub fn get_credential(&self, id: &str) -> Result<Option<CredentialRecord>, StoreError> {
        self.with_tx(|tx| Ok(query_credentials(tx, "WHERE id = ?1", [id])?.pop()))
    }

    /// Remove a credential. Returns false if it was not cached.
    pub fn delete_credential(&self, id: &str) -> Result<bool, StoreError> {
        self.with_tx(|tx| Ok(tx.execute("DELETE FROM credentials WHERE id = ?1", [id])? > 0))
    }

    /// All cached credentials, ordered by website then username.
    pub fn list_credentials(&self) -> Result<Vec<CredentialRecord>, StoreError> {
        self.with_tx(|tx| {
            query_credentials(
                tx,
                "ORDER BY website COLLATE NOCASE, username COLLATE NOCASE",
                [],
            )
        })
    }

    /// Credentials whose website, username or notes contain `term`, ignoring
    /// case. An empty term returns the full set.
    pub fn search_credentials(&self, term: &str) -> Result<Vec<CredentialRecord>, StoreError> {
        let term = term.trim();
        Ok(self
            .list_credentials()?
            .into_iter()
            .filter(|record| record.matches_term(term))
            .collect())
    }

    /// Give a credential and all of its outbox entries a new id, e.g. when the
    /// remote assigns a real id to a record created offline.
    pub fn reassign_credential_id(&self, old_id: &str, new_id: &str) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            tx.execute("DELETE FROM credentials WHERE id = ?1", [new_id])?;
            tx.execute(
                "UPDATE credentials SET id = ?2 WHERE id = ?1",
                params![old_id, new_id],
            )?;
            tx.execute(
                "UPDATE sync_outbox SET credential_id = ?2 WHERE credential_id = ?1",
                params![old_id, new_id],
            )?;
            Ok(())
        })
        .inspect(|_| debug!(old_id, new_id, "Reassigned credential id"))
    }

    // ===== Outbox =====

    /// Queue a mutation. Returns the new entry id; the entry starts unsynced.
    ///
    /// The stored timestamp is clamped so it never sorts before an earlier
    /// entry for the same credential, even if the wall clock stepped back.
    pub fn append_outbox_entry(
        &self,
        action: OutboxAction,
        credential_id: &str,
        payload: Option<&CredentialPayload>,
        timestamp: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let payload_json = payload.map(serde_json::to_string).transpose()?;
        self.with_tx(|tx| {
            let latest: Option<i64> = tx.query_row(
                "SELECT MAX(timestamp) FROM sync_outbox WHERE credential_id = ?1",
                [credential_id],
                |row| row.get(0),
            )?;
            let timestamp = match latest.and_then(DateTime::from_timestamp_millis) {
                Some(latest) if latest > timestamp => latest,
                _ => timestamp,
            };
            tx.execute(
                "INSERT INTO sync_outbox (action, credential_id, payload, timestamp, synced)
                 VALUES (?1, ?2, ?3, ?4, 0)",
                params![
                    action.as_str(),
                    credential_id,
                    payload_json,
                    timestamp.timestamp_millis()
                ],
            )?;
            Ok(tx.last_insert_rowid())
        })
        .inspect(|id| debug!(entry_id = id, %action, credential_id, "Appended outbox entry"))
    }

    /// Unsynced, live entries in the order they must be applied.
    pub fn list_pending_outbox(&self) -> Result<Vec<SyncOutboxEntry>, StoreError> {
        self.with_tx(|tx| {
            query_outbox(
                tx,
                "WHERE synced = 0 AND dead_letter = 0 ORDER BY timestamp ASC, id ASC",
                [],
            )
        })
    }

    /// Every unacknowledged entry, dead letters included, in apply order.
    /// A dead letter still holds back later entries for its credential.
    pub fn list_unsynced_outbox(&self) -> Result<Vec<SyncOutboxEntry>, StoreError> {
        self.with_tx(|tx| query_outbox(tx, "WHERE synced = 0 ORDER BY timestamp ASC, id ASC", []))
    }

    pub fn get_outbox_entry(&self, entry_id: i64) -> Result<Option<SyncOutboxEntry>, StoreError> {
        self.with_tx(|tx| Ok(query_outbox(tx, "WHERE id = ?1", [entry_id])?.pop()))
    }

    /// Mark an entry as acknowledged. Idempotent: returns false when the entry
    /// was already synced (or does not exist) and nothing changed.
    pub fn mark_outbox_synced(&self, entry_id: i64, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE sync_outbox SET synced = 1, synced_at = ?2 WHERE id = ?1 AND synced = 0",
                params![entry_id, now.timestamp_millis()],
            )?;
            Ok(changed > 0)
        })
    }

    /// Count a non-transient failure against an entry. Once `max_attempts`
    /// is reached the entry is parked as a dead letter. Returns true if this
    /// call parked it.
    pub fn record_outbox_failure(&self, entry_id: i64, max_attempts: u32) -> Result<bool, StoreError> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE sync_outbox
                 SET attempts = attempts + 1,
                     dead_letter = CASE WHEN attempts + 1 >= ?2 THEN 1 ELSE 0 END
                 WHERE id = ?1 AND synced = 0 AND dead_letter = 0",
                params![entry_id, max_attempts],
            )?;
            let dead: Option<bool> = tx
                .query_row(
                    "SELECT dead_letter FROM sync_outbox WHERE id = ?1",
                    [entry_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(dead.unwrap_or(false))
        })
    }

    pub fn outbox_stats(&self) -> Result<OutboxStats, StoreError> {
        self.with_tx(|tx| {
            let count = |clause: &str| -> Result<usize, StoreError> {
                let n: i64 = tx.query_row(
                    &format!("SELECT COUNT(*) FROM sync_outbox WHERE {}", clause),
                    [],
                    |row| row.get(0),
                )?;
                Ok(n as usize)
            };
            Ok(OutboxStats {
                pending: count("synced = 0 AND dead_letter = 0")?,
                dead_letter: count("synced = 0 AND dead_letter = 1")?,
                synced: count("synced = 1")?,
            })
        })
    }

    /// Delete acknowledged entries synced before `cutoff`.
    pub fn prune_synced_outbox(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.with_tx(|tx| {
            Ok(tx.execute(
                "DELETE FROM sync_outbox WHERE synced = 1 AND synced_at < ?1",
                [cutoff.timestamp_millis()],
            )?)
        })
    }

    // ===== Metadata =====

    pub fn get_metadata<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        self.with_tx(|tx| {
            let raw: Option<String> = tx
                .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| row.get(0))
                .optional()?;
            match raw {
                Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
                None => Ok(None),
            }
        })
    }

    pub fn set_metadata<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.with_tx(|tx| put_meta(tx, key, value))
    }

    /// Returns false if the key was not present.
    pub fn remove_metadata(&self, key: &str) -> Result<bool, StoreError> {
        self.with_tx(|tx| Ok(tx.execute("DELETE FROM metadata WHERE key = ?1", [key])? > 0))
    }

    // ===== Maintenance =====

    /// Wipe every collection. Only for explicit cache clear and logout.
    pub fn clear_all(&self) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            tx.execute_batch(
                "DELETE FROM credentials; DELETE FROM sync_outbox; DELETE FROM metadata;",
            )?;
            Ok(())
        })
        .inspect(|_| info!("Cleared local store"))
    }
}

// ============================================================================
// Row helpers
// ============================================================================

fn millis_to_datetime(col: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(col, ms))
}

fn credential_from_row(row: &Row<'_>) -> rusqlite::Result<CredentialRecord> {
    Ok(CredentialRecord {
        id: row.get(0)?,
        website: row.get(1)?,
        username: row.get(2)?,
        password: row.get(3)?,
        notes: row.get(4)?,
        otp_secret: row.get(5)?,
        folder_id: row.get(6)?,
        last_modified: millis_to_datetime(7, row.get(7)?)?,
        cached_at: millis_to_datetime(8, row.get(8)?)?,
    })
}

fn query_credentials<P: rusqlite::Params>(
    conn: &Connection,
    clause: &str,
    params: P,
) -> Result<Vec<CredentialRecord>, StoreError> {
    let sql = format!("SELECT {} FROM credentials {}", CREDENTIAL_COLS, clause);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, credential_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn insert_credential(conn: &Connection, record: &CredentialRecord) -> Result<(), StoreError> {
    conn.execute(
        &format!(
            "INSERT INTO credentials ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            CREDENTIAL_COLS
        ),
        params![
            record.id,
            record.website,
            record.username,
            record.password,
            record.notes,
            record.otp_secret,
            record.folder_id,
            record.last_modified.timestamp_millis(),
            record.cached_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

/// Raw outbox row before the action and payload columns are decoded.
struct OutboxRow {
    id: i64,
    action: String,
    credential_id: String,
    payload: Option<String>,
    timestamp: DateTime<Utc>,
    synced: bool,
    synced_at: Option<DateTime<Utc>>,
    attempts: u32,
    dead_letter: bool,
}

fn query_outbox<P: rusqlite::Params>(
    conn: &Connection,
    clause: &str,
    params: P,
) -> Result<Vec<SyncOutboxEntry>, StoreError> {
    let sql = format!("SELECT {} FROM sync_outbox {}", OUTBOX_COLS, clause);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params, |row| {
            let synced_at: Option<i64> = row.get(6)?;
            Ok(OutboxRow {
                id: row.get(0)?,
                action: row.get(1)?,
                credential_id: row.get(2)?,
                payload: row.get(3)?,
                timestamp: millis_to_datetime(4, row.get(4)?)?,
                synced: row.get(5)?,
                synced_at: synced_at.map(|ms| millis_to_datetime(6, ms)).transpose()?,
                attempts: row.get(7)?,
                dead_letter: row.get(8)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|row| {
            let action = row
                .action
                .parse::<OutboxAction>()
                .map_err(|detail| StoreError::Corrupt { table: "sync_outbox", detail })?;
            let payload = row
                .payload
                .as_deref()
                .map(serde_json::from_str::<CredentialPayload>)
                .transpose()?;
            Ok(SyncOutboxEntry {
                id: row.id,
                action,
                credential_id: row.credential_id,
                payload,
                timestamp: row.timestamp,
                synced: row.synced,
                synced_at: row.synced_at,
                attempts: row.attempts,
                dead_letter: row.dead_letter,
            })
        })
        .collect()
}

fn put_meta<T: Serialize + ?Sized>(conn: &Connection, key: &str, value: &T) -> Result<(), StoreError> {
    let raw = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO metadata (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, raw],
    )?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(id: &str, website: &str, username: &str, now: DateTime<Utc>) -> CredentialRecord {
        CredentialRecord {
            id: id.to_string(),
            website: website.to_string(),
            username: username.to_string(),
            password: "secret".to_string(),
            notes: None,
            otp_secret: None,
            folder_id: None,
            last_modified: now,
            cached_at: now,
        }
    }

    fn seeded_store() -> LocalStore {
        let store = LocalStore::open_in_memory().unwrap();
        let now = Utc::now();
        let mut bank = record("3", "mybank.com", "carol", now);
        bank.notes = Some("Joint ACCOUNT".to_string());
        store
            .replace_all_credentials(
                &[
                    record("1", "github.com", "alice", now),
                    record("2", "gitlab.com", "bob", now),
                    bank,
                ],
                now,
            )
            .unwrap();
        store
    }

    #[test]
    fn test_replace_all_records_metadata() {
        let store = seeded_store();
        assert_eq!(store.list_credentials().unwrap().len(), 3);
        let count: Option<usize> = store.get_metadata(meta_keys::CACHED_COUNT).unwrap();
        assert_eq!(count, Some(3));
        let stamp: Option<DateTime<Utc>> = store.get_metadata(meta_keys::LAST_CACHE_UPDATE).unwrap();
        assert!(stamp.is_some());
    }

    #[test]
    fn test_replace_all_never_moves_last_modified_backwards() {
        let store = LocalStore::open_in_memory().unwrap();
        let now = Utc::now();
        let mut edited = record("1", "github.com", "alice", now);
        edited.last_modified = now + Duration::minutes(10);
        store.upsert_credential(&edited).unwrap();

        let mut stale = record("1", "github.com", "alice-old", now);
        stale.last_modified = now;
        store.replace_all_credentials(&[stale], now).unwrap();

        let stored = store.get_credential("1").unwrap().unwrap();
        assert_eq!(stored.username, "alice-old");
        assert!(stored.last_modified > now + Duration::minutes(10));
    }

    #[test]
    fn test_search_is_case_insensitive_and_covers_notes() {
        let store = seeded_store();
        assert_eq!(store.search_credentials("GIT").unwrap().len(), 2);
        assert_eq!(store.search_credentials("account").unwrap().len(), 1);
        assert_eq!(store.search_credentials("BOB").unwrap()[0].id, "2");
    }

    #[test]
    fn test_search_empty_and_missing_terms() {
        let store = seeded_store();
        assert_eq!(store.search_credentials("").unwrap().len(), 3);
        assert!(store.search_credentials("nothing-matches").unwrap().is_empty());
    }

    #[test]
    fn test_upsert_bumps_stale_last_modified() {
        let store = seeded_store();
        let mut existing = store.get_credential("1").unwrap().unwrap();
        let before = existing.last_modified;
        existing.username = "alice2".to_string();
        let stored = store.upsert_credential(&existing).unwrap();
        assert!(stored.last_modified > before);
        assert_eq!(store.get_credential("1").unwrap().unwrap().username, "alice2");
    }

    #[test]
    fn test_delete_credential() {
        let store = seeded_store();
        assert!(store.delete_credential("2").unwrap());
        assert!(!store.delete_credential("2").unwrap());
        assert!(store.get_credential("2").unwrap().is_none());
    }

    #[test]
    fn test_pending_outbox_is_ordered_by_timestamp() {
        let store = LocalStore::open_in_memory().unwrap();
        let now = Utc::now();
        let later = store
            .append_outbox_entry(OutboxAction::Delete, "1", None, now + Duration::seconds(5))
            .unwrap();
        let payload = CredentialPayload {
            website: "github.com".into(),
            username: "alice".into(),
            ..Default::default()
        };
        let earlier = store
            .append_outbox_entry(OutboxAction::Update, "1", Some(&payload), now)
            .unwrap();

        let pending = store.list_pending_outbox().unwrap();
        let ids: Vec<i64> = pending.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![earlier, later]);
        assert_eq!(pending[0].payload.as_ref(), Some(&payload));
        assert!(pending[1].payload.is_none());
        assert!(pending.iter().all(|e| !e.synced));
    }

    #[test]
    fn test_mark_outbox_synced_is_idempotent() {
        let store = LocalStore::open_in_memory().unwrap();
        let now = Utc::now();
        let id = store.append_outbox_entry(OutboxAction::Delete, "1", None, now).unwrap();

        assert!(store.mark_outbox_synced(id, now).unwrap());
        let first = store.get_outbox_entry(id).unwrap().unwrap();

        assert!(!store.mark_outbox_synced(id, now + Duration::seconds(30)).unwrap());
        let second = store.get_outbox_entry(id).unwrap().unwrap();

        assert_eq!(first, second);
        assert!(second.synced);
        assert!(store.list_pending_outbox().unwrap().is_empty());
    }

    #[test]
    fn test_failures_dead_letter_after_bound() {
        let store = LocalStore::open_in_memory().unwrap();
        let id = store.append_outbox_entry(OutboxAction::Delete, "1", None, Utc::now()).unwrap();

        assert!(!store.record_outbox_failure(id, 3).unwrap());
        assert!(!store.record_outbox_failure(id, 3).unwrap());
        assert!(store.record_outbox_failure(id, 3).unwrap());

        assert!(store.list_pending_outbox().unwrap().is_empty());
        let stats = store.outbox_stats().unwrap();
        assert_eq!(stats.dead_letter, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(store.get_outbox_entry(id).unwrap().unwrap().attempts, 3);

        let later = store.append_outbox_entry(OutboxAction::Delete, "2", None, Utc::now()).unwrap();
        let unsynced: Vec<i64> = store.list_unsynced_outbox().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(unsynced, vec![id, later]);
    }

    #[test]
    fn test_reassign_credential_id_moves_outbox_entries() {
        let store = LocalStore::open_in_memory().unwrap();
        let now = Utc::now();
        store.upsert_credential(&record("local-abc", "a.com", "u", now)).unwrap();
        store.append_outbox_entry(OutboxAction::Update, "local-abc", None, now).unwrap();

        store.reassign_credential_id("local-abc", "42").unwrap();

        assert!(store.get_credential("local-abc").unwrap().is_none());
        assert!(store.get_credential("42").unwrap().is_some());
        assert_eq!(store.list_pending_outbox().unwrap()[0].credential_id, "42");
    }

    #[test]
    fn test_prune_synced_outbox() {
        let store = LocalStore::open_in_memory().unwrap();
        let now = Utc::now();
        let old = store.append_outbox_entry(OutboxAction::Delete, "1", None, now).unwrap();
        let pending = store.append_outbox_entry(OutboxAction::Delete, "2", None, now).unwrap();
        store.mark_outbox_synced(old, now - Duration::days(2)).unwrap();

        assert_eq!(store.prune_synced_outbox(now - Duration::days(1)).unwrap(), 1);
        assert!(store.get_outbox_entry(old).unwrap().is_none());
        assert!(store.get_outbox_entry(pending).unwrap().is_some());
    }

    #[test]
    fn test_metadata_round_trip_and_remove() {
        let store = LocalStore::open_in_memory().unwrap();
        store.set_metadata("k", "v1").unwrap();
        store.set_metadata("k", "v2").unwrap();
        let value: Option<String> = store.get_metadata("k").unwrap();
        assert_eq!(value.as_deref(), Some("v2"));
        assert!(store.remove_metadata("k").unwrap());
        assert!(!store.remove_metadata("k").unwrap());
        assert!(store.get_metadata::<String>("k").unwrap().is_none());
    }

    #[test]
    fn test_clear_all_wipes_every_collection() {
        let store = seeded_store();
        store.append_outbox_entry(OutboxAction::Delete, "1", None, Utc::now()).unwrap();
        store.clear_all().unwrap();
        assert!(store.list_credentials().unwrap().is_empty());
        assert!(store.list_pending_outbox().unwrap().is_empty());
        assert!(store.get_metadata::<usize>(meta_keys::CACHED_COUNT).unwrap().is_none());
    }

    #[test]
    fn test_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("vault.db");
        let now = Utc::now();
        {
            let store = LocalStore::open(&path).unwrap();
            assert!(store.is_persistent());
            store.upsert_credential(&record("1", "github.com", "alice", now)).unwrap();
            store.append_outbox_entry(OutboxAction::Delete, "1", None, now).unwrap();
        }
        let reopened = LocalStore::open(&path).unwrap();
        assert_eq!(reopened.list_credentials().unwrap().len(), 1);
        assert_eq!(reopened.list_pending_outbox().unwrap().len(), 1);
    }

    #[test]
    fn test_open_fails_when_path_is_unusable() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let result = LocalStore::open(&blocker.join("vault.db"));
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
