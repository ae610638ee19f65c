//! The engine context: one instance of each component, plus the dispatch
//! table that answers UI messages against them.
//!
//! Constructed once by the host and shared behind an `Arc`. Nothing here is
//! global; the store and remote are injected.

use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{ApiError, CredentialRemote};
use crate::auth::{LockReason, LockState, SessionGuard, TokenVault};
use crate::cache::{meta_keys, LocalStore};
use crate::error::{Result, VaultError};
use crate::messages::{AutofillCredential, Request, Response, ResponseBody};
use crate::models::Settings;
use crate::sync::SyncCoordinator;
use crate::utils::host_of;

/// Open the store at `path`, falling back to an ephemeral in-memory store
/// when the file cannot be used. Reads then prefer the remote.
pub fn open_store(path: &Path) -> Result<Arc<LocalStore>> {
    match LocalStore::open(path) {
        Ok(store) => Ok(Arc::new(store)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Local store unavailable, using ephemeral store");
            Ok(Arc::new(LocalStore::open_in_memory()?))
        }
    }
}

pub struct Engine {
    store: Arc<LocalStore>,
    remote: Arc<dyn CredentialRemote>,
    vault: Arc<TokenVault>,
    guard: SessionGuard,
    sync: Arc<SyncCoordinator>,
    settings: RwLock<Settings>,
    periodic: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Build the engine. Settings persisted by an earlier run take precedence
    /// over `defaults`.
    pub fn new(store: Arc<LocalStore>, remote: Arc<dyn CredentialRemote>, defaults: Settings) -> Arc<Self> {
        let settings = match store.get_metadata::<Settings>(meta_keys::SETTINGS) {
            Ok(Some(saved)) => saved,
            Ok(None) => defaults,
            Err(e) => {
                warn!(error = %e, "Failed to read saved settings, using defaults");
                defaults
            }
        };
        let vault = Arc::new(TokenVault::new(store.clone()));
        let guard = SessionGuard::new(vault.clone(), settings.auto_lock_timeout());
        let sync = Arc::new(SyncCoordinator::new(store.clone(), remote.clone(), guard.clone()));
        Arc::new(Self {
            store,
            remote,
            vault,
            guard,
            sync,
            settings: RwLock::new(settings),
            periodic: Mutex::new(None),
        })
    }

    /// Restore the session from persisted token material and start the
    /// background drain. Must run inside a tokio runtime.
    pub fn start(&self) -> LockState {
        let state = self.guard.restore();
        let interval = self.settings().sync_interval();
        self.restart_periodic(interval);
        info!(?state, persistent = self.store.is_persistent(), "Engine started");
        state
    }

    /// Stop background work. The session state is left as is.
    pub fn shutdown(&self) {
        self.restart_periodic(None);
        self.guard.disarm();
    }

    pub fn guard(&self) -> &SessionGuard {
        &self.guard
    }

    pub fn sync(&self) -> &Arc<SyncCoordinator> {
        &self.sync
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn restart_periodic(&self, interval: Option<std::time::Duration>) {
        let mut periodic = self.periodic.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = periodic.take() {
            handle.abort();
        }
        if let Some(interval) = interval {
            debug!(interval_secs = interval.as_secs(), "Starting periodic drain");
            *periodic = Some(self.sync.spawn_periodic(interval));
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Parse one JSON message and answer it.
    pub async fn handle_json(self: &Arc<Self>, raw: &str) -> Response {
        match serde_json::from_str::<Request>(raw) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                debug!(error = %e, "Unparseable request");
                Response::unparseable(e)
            }
        }
    }

    /// Answer one request. Always yields exactly one response.
    pub async fn handle(self: &Arc<Self>, request: Request) -> Response {
        let kind = request.kind();
        if request.requires_session() {
            if !self.guard.is_unlocked() {
                return Response::failure(&VaultError::Locked);
            }
            self.guard.on_activity();
        }

        match self.dispatch(request).await {
            Ok(response) => {
                debug!(request = kind, "Request handled");
                response
            }
            Err(e) => {
                if matches!(e, VaultError::AuthExpired) {
                    self.guard.lock_now(LockReason::AuthExpired);
                }
                if e.is_transient() || matches!(e, VaultError::Locked) {
                    debug!(request = kind, error = %e, "Request failed");
                } else {
                    warn!(request = kind, error = %e, "Request failed");
                }
                Response::failure(&e)
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, request: Request) -> Result<Response> {
        match request {
            Request::CheckLoginStatus => self.check_login_status().await,
            Request::Login { username, password } => self.login(&username, &password).await,
            Request::Logout => self.logout().await,
            Request::FindCredentials { domain } => self.find_credentials(&domain).await,
            Request::AutofillCredentials { tab_id, credential } => autofill(tab_id, credential),
            Request::SyncNow => {
                let report = self.sync.full_sync().await?;
                Ok(Response::ok(ResponseBody::Report(report)))
            }
            Request::SyncStatus => Ok(Response::ok(ResponseBody::Status(self.sync.status()))),
            Request::ForceSyncCredential {
                credential_id,
                operation,
                data,
            } => {
                let outcome = self
                    .sync
                    .force_sync_credential(credential_id.as_deref(), operation, data)
                    .await?;
                Ok(Response::ok(ResponseBody::ForceSync(outcome)))
            }
            Request::SettingsUpdated { settings } => self.update_settings(settings),
            Request::Lock => {
                self.guard.lock_now(LockReason::Manual);
                Ok(Response::ack())
            }
            Request::ClearCache => self.clear_cache(),
            Request::ConnectivityChanged { online } => {
                self.sync.set_online(online);
                Ok(Response::ack())
            }
        }
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    fn login_status(&self) -> Response {
        let username = self
            .store
            .get_metadata::<String>(meta_keys::USERNAME)
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to read username");
                None
            });
        Response::ok(ResponseBody::LoginStatus {
            is_logged_in: self.guard.is_unlocked(),
            username,
            is_online: self.sync.is_online(),
        })
    }

    /// Report the session state, confirming the token with the remote when
    /// reachable. An unreachable remote leaves the session as is.
    async fn check_login_status(&self) -> Result<Response> {
        if let Some(token) = self.guard.token() {
            if self.sync.is_online() {
                match self.remote.verify(token.expose()).await {
                    Ok(()) => {}
                    Err(ApiError::Unauthorized) => {
                        info!("Stored token no longer accepted");
                        self.guard.lock_now(LockReason::AuthExpired);
                    }
                    Err(e) => debug!(error = %e, "Token check skipped"),
                }
            }
        }
        Ok(self.login_status())
    }

    async fn login(self: &Arc<Self>, username: &str, password: &str) -> Result<Response> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(VaultError::InvalidRequest("username and password are required".to_string()));
        }
        if !self.sync.is_online() {
            return Err(VaultError::Offline);
        }

        let grant = match self.remote.login(username, password).await {
            Ok(grant) => grant,
            Err(ApiError::Unauthorized) => {
                return Err(VaultError::Rejected("Invalid username or password".to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        self.guard.unlock(&grant.access_token)?;
        if let Err(e) = self.store.set_metadata(meta_keys::USERNAME, username) {
            warn!(error = %e, "Failed to remember username");
        }
        info!(username, "Logged in");

        if self.settings().sync_on_unlock {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                match engine.sync.full_sync().await {
                    Ok(report) => debug!(pulled = report.pulled, pushed = report.pushed, "Sync after login"),
                    Err(e) => warn!(error = %e, "Sync after login failed"),
                }
            });
        }
        Ok(self.login_status())
    }

    /// Sign out: best-effort remote logout, lock, and wipe local state.
    async fn logout(&self) -> Result<Response> {
        if let Some(token) = self.guard.token() {
            if self.sync.is_online() {
                if let Err(e) = self.remote.logout(token.expose()).await {
                    warn!(error = %e, "Remote logout failed");
                }
            }
        }
        self.guard.lock_now(LockReason::Logout);
        self.store.clear_all()?;
        self.persist_settings(&self.settings())?;
        info!("Logged out");
        Ok(Response::ack())
    }

    /// Credentials for `domain` only. The ephemeral store is refreshed from
    /// the remote first; otherwise the cache answers directly.
    async fn find_credentials(&self, domain: &str) -> Result<Response> {
        let host = host_of(domain);
        if host.is_empty() {
            return Err(VaultError::InvalidRequest("domain is required".to_string()));
        }

        let mut from_cache = true;
        if !self.store.is_persistent() && self.sync.is_online() {
            match self.sync.full_sync().await {
                Ok(_) => from_cache = false,
                Err(VaultError::AuthExpired) => return Err(VaultError::AuthExpired),
                Err(e) => warn!(error = %e, "Remote read failed, answering from memory"),
            }
        }

        let credentials = self
            .store
            .list_credentials()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to read cached credentials");
                Vec::new()
            })
            .into_iter()
            .filter(|record| record.matches_domain(&host))
            .collect::<Vec<_>>();
        debug!(domain = %host, matches = credentials.len(), "Found credentials");
        Ok(Response::ok(ResponseBody::Credentials {
            credentials,
            from_cache,
        }))
    }

    fn update_settings(&self, settings: Settings) -> Result<Response> {
        self.persist_settings(&settings)?;
        let previous = {
            let mut current = self.settings.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *current, settings.clone())
        };

        if previous.auto_lock_timeout_ms != settings.auto_lock_timeout_ms {
            self.guard.apply_timeout(settings.auto_lock_timeout());
        }
        if previous.sync_interval_secs != settings.sync_interval_secs {
            self.restart_periodic(settings.sync_interval());
        }
        info!(
            auto_lock_timeout_ms = settings.auto_lock_timeout_ms,
            sync_interval_secs = settings.sync_interval_secs,
            "Settings updated"
        );
        Ok(Response::ok(ResponseBody::Settings { settings }))
    }

    fn persist_settings(&self, settings: &Settings) -> Result<()> {
        self.store.set_metadata(meta_keys::SETTINGS, settings)?;
        Ok(())
    }

    /// Wipe cached credentials and the outbox. The session survives: the
    /// token is re-encrypted under a fresh key.
    fn clear_cache(&self) -> Result<Response> {
        let token = self.guard.token();
        self.store.clear_all()?;
        self.vault.purge()?;
        if let Some(token) = token {
            self.vault.store_token(token.expose())?;
        }
        self.persist_settings(&self.settings())?;
        info!("Cache cleared");
        Ok(Response::ack())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(handle) = self.periodic.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

/// Validate and echo the credential picked for a tab.
fn autofill(tab_id: i64, credential: AutofillCredential) -> Result<Response> {
    if tab_id < 0 {
        return Err(VaultError::InvalidRequest(format!("invalid tab id {}", tab_id)));
    }
    if credential.username.is_empty() || credential.password.is_empty() {
        return Err(VaultError::InvalidRequest(
            "credential needs a username and password".to_string(),
        ));
    }
    Ok(Response::ok(ResponseBody::Autofill { tab_id, credential }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Value};

    use super::*;
    use crate::api::fake::{remote_credential, FakeRemote, FAKE_PASSWORD, FAKE_USER};

    fn quiet_settings() -> Settings {
        Settings {
            sync_on_unlock: false,
            sync_interval_secs: 0,
            ..Settings::default()
        }
    }

    fn remote() -> Arc<FakeRemote> {
        Arc::new(FakeRemote::with_records(vec![
            remote_credential("1", "https://github.com", "alice"),
            remote_credential("2", "accounts.google.com", "alice@gmail.com"),
            remote_credential("3", "example.org", "bob"),
        ]))
    }

    fn engine_with(store: Arc<LocalStore>, remote: Arc<FakeRemote>) -> Arc<Engine> {
        let engine = Engine::new(store, remote, quiet_settings());
        engine.start();
        engine
    }

    fn engine(remote: Arc<FakeRemote>) -> Arc<Engine> {
        engine_with(Arc::new(LocalStore::open_in_memory().unwrap()), remote)
    }

    async fn call(engine: &Arc<Engine>, request: Value) -> Value {
        let response = engine.handle_json(&request.to_string()).await;
        serde_json::to_value(response).unwrap()
    }

    async fn login(engine: &Arc<Engine>) -> Value {
        call(
            engine,
            json!({"type": "login", "username": FAKE_USER, "password": FAKE_PASSWORD}),
        )
        .await
    }

    #[tokio::test]
    async fn test_session_requests_need_login() {
        let engine = engine(remote());
        let reply = call(&engine, json!({"type": "findCredentials", "domain": "github.com"})).await;
        assert_eq!(reply["success"], json!(false));
        assert_eq!(reply["code"], json!("locked"));

        let reply = call(&engine, json!({"type": "SYNC_NOW"})).await;
        assert_eq!(reply["code"], json!("locked"));

        let reply = call(&engine, json!({"type": "checkLoginStatus"})).await;
        assert_eq!(reply["success"], json!(true));
        assert_eq!(reply["isLoggedIn"], json!(false));
    }

    #[tokio::test]
    async fn test_bad_password_is_rejected() {
        let engine = engine(remote());
        let reply = call(&engine, json!({"type": "login", "username": FAKE_USER, "password": "nope"})).await;
        assert_eq!(reply["success"], json!(false));
        assert_eq!(reply["code"], json!("rejected"));
        assert!(!engine.guard().is_unlocked());
    }

    #[tokio::test]
    async fn test_login_sync_and_find() {
        let engine = engine(remote());
        let reply = login(&engine).await;
        assert_eq!(reply["isLoggedIn"], json!(true));
        assert_eq!(reply["username"], json!(FAKE_USER));

        let reply = call(&engine, json!({"type": "SYNC_NOW"})).await;
        assert_eq!(reply["success"], json!(true));
        assert_eq!(reply["pulled"], json!(3));

        let reply = call(&engine, json!({"type": "findCredentials", "domain": "https://www.github.com/login"})).await;
        let found = reply["credentials"].as_array().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["username"], json!("alice"));

        let reply = call(&engine, json!({"type": "findCredentials", "domain": "google.com"})).await;
        assert_eq!(reply["credentials"].as_array().unwrap().len(), 1);

        let reply = call(&engine, json!({"type": "findCredentials", "domain": "evil-github.com"})).await;
        assert!(reply["credentials"].as_array().unwrap().is_empty());

        let reply = call(&engine, json!({"type": "SYNC_STATUS"})).await;
        assert_eq!(reply["isOnline"], json!(true));
        assert_eq!(reply["pendingItems"], json!([]));
        assert!(reply["lastSyncTime"].is_string());
    }

    #[tokio::test]
    async fn test_offline_edit_reaches_remote_after_reconnect() {
        let remote = remote();
        let engine = engine(remote.clone());
        login(&engine).await;
        call(&engine, json!({"type": "SYNC_NOW"})).await;

        call(&engine, json!({"type": "CONNECTIVITY_CHANGED", "online": false})).await;
        let reply = call(
            &engine,
            json!({"type": "FORCE_SYNC_CREDENTIAL", "credentialId": "3", "operation": "update",
                   "data": {"website": "example.org", "username": "robert", "password": "pw"}}),
        )
        .await;
        assert_eq!(reply["success"], json!(true));
        assert_eq!(reply["synced"], json!(false));

        let reply = call(&engine, json!({"type": "SYNC_NOW"})).await;
        assert_eq!(reply["code"], json!("offline"));

        call(&engine, json!({"type": "CONNECTIVITY_CHANGED", "online": true})).await;
        let reply = call(&engine, json!({"type": "SYNC_NOW"})).await;
        assert_eq!(reply["success"], json!(true));
        assert_eq!(remote.record("3").unwrap().username, "robert");
        let reply = call(&engine, json!({"type": "SYNC_STATUS"})).await;
        assert_eq!(reply["pendingItems"], json!([]));
    }

    #[tokio::test]
    async fn test_expired_token_locks_session() {
        let remote = remote();
        let engine = engine(remote.clone());
        login(&engine).await;
        remote.revoke_tokens();

        let reply = call(&engine, json!({"type": "SYNC_NOW"})).await;
        assert_eq!(reply["code"], json!("authExpired"));
        assert!(!engine.guard().is_unlocked());
    }

    #[tokio::test]
    async fn test_login_status_detects_revoked_token() {
        let remote = remote();
        let engine = engine(remote.clone());
        login(&engine).await;
        remote.revoke_tokens();
        let reply = call(&engine, json!({"type": "checkLoginStatus"})).await;
        assert_eq!(reply["isLoggedIn"], json!(false));
    }

    #[tokio::test]
    async fn test_autofill_validates_and_echoes() {
        let engine = engine(remote());
        login(&engine).await;
        let reply = call(
            &engine,
            json!({"type": "autofillCredentials", "tabId": 4, "credential": {"username": "alice", "password": "pw"}}),
        )
        .await;
        assert_eq!(reply["success"], json!(true));
        assert_eq!(reply["tabId"], json!(4));
        assert_eq!(reply["credential"]["username"], json!("alice"));

        let reply = call(
            &engine,
            json!({"type": "autofillCredentials", "tabId": 4, "credential": {"username": "alice", "password": ""}}),
        )
        .await;
        assert_eq!(reply["code"], json!("invalidRequest"));
    }

    #[tokio::test]
    async fn test_unknown_message_gets_failure_reply() {
        let engine = engine(remote());
        let reply = call(&engine, json!({"type": "openPopup"})).await;
        assert_eq!(reply["success"], json!(false));
        assert_eq!(reply["code"], json!("invalidRequest"));
        let response = engine.handle_json("not json").await;
        assert!(!response.success);
    }

    #[tokio::test]
    async fn test_settings_persist_across_restart() {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let engine = engine_with(store.clone(), remote());
        let reply = call(
            &engine,
            json!({"type": "SETTINGS_UPDATED", "settings": {"autoLockTimeoutMs": 60000, "syncOnUnlock": false, "syncIntervalSecs": 0}}),
        )
        .await;
        assert_eq!(reply["settings"]["autoLockTimeoutMs"], json!(60000));
        drop(engine);

        let engine = Engine::new(store, remote(), Settings::default());
        assert_eq!(engine.settings().auto_lock_timeout_ms, 60000);
        assert_eq!(engine.guard().timeout(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shorter_timeout_locks_idle_session() {
        let engine = engine(remote());
        login(&engine).await;
        tokio::time::sleep(Duration::from_secs(10 * 60)).await;
        assert!(engine.guard().is_unlocked());

        call(
            &engine,
            json!({"type": "SETTINGS_UPDATED", "settings": {"autoLockTimeoutMs": 300000, "syncOnUnlock": false, "syncIntervalSecs": 0}}),
        )
        .await;
        assert!(!engine.guard().is_unlocked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_count_as_activity() {
        let engine = engine(remote());
        login(&engine).await;
        tokio::time::sleep(Duration::from_secs(14 * 60)).await;
        call(&engine, json!({"type": "findCredentials", "domain": "github.com"})).await;
        tokio::time::sleep(Duration::from_secs(14 * 60)).await;
        assert!(engine.guard().is_unlocked());
        tokio::time::sleep(Duration::from_secs(2 * 60)).await;
        assert!(!engine.guard().is_unlocked());
    }

    #[tokio::test]
    async fn test_lock_keeps_cache() {
        let engine = engine(remote());
        login(&engine).await;
        call(&engine, json!({"type": "SYNC_NOW"})).await;
        let reply = call(&engine, json!({"type": "lock"})).await;
        assert_eq!(reply, json!({"success": true}));
        assert!(engine.guard().token().is_none());
        assert_eq!(engine.store().list_credentials().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_clear_cache_keeps_session() {
        let engine = engine(remote());
        login(&engine).await;
        call(&engine, json!({"type": "SYNC_NOW"})).await;
        call(&engine, json!({"type": "clearCache"})).await;
        assert!(engine.store().list_credentials().unwrap().is_empty());
        assert!(engine.guard().token().is_some());
    }

    #[tokio::test]
    async fn test_logout_wipes_local_state() {
        let engine = engine(remote());
        login(&engine).await;
        call(&engine, json!({"type": "SYNC_NOW"})).await;
        let reply = call(&engine, json!({"type": "logout"})).await;
        assert_eq!(reply["success"], json!(true));
        assert!(!engine.guard().is_unlocked());
        assert!(engine.store().list_credentials().unwrap().is_empty());
        let reply = call(&engine, json!({"type": "checkLoginStatus"})).await;
        assert_eq!(reply["username"], Value::Null);
    }

    #[tokio::test]
    async fn test_ephemeral_store_reads_remote_first() {
        let engine = engine(remote());
        assert!(!engine.store().is_persistent());
        login(&engine).await;
        let reply = call(&engine, json!({"type": "findCredentials", "domain": "example.org"})).await;
        assert_eq!(reply["fromCache"], json!(false));
        assert_eq!(reply["credentials"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unusable_path_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let store = open_store(&blocker.join("vault.db")).unwrap();
        assert!(!store.is_persistent());

        let store = open_store(&dir.path().join("vault.db")).unwrap();
        assert!(store.is_persistent());
    }
}
