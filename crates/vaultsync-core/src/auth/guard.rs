use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::vault::{SessionToken, TokenLookup, TokenVault};
use crate::error::Result;

/// Capacity of the lock notification channel.
/// Subscribers only care about the latest few transitions.
const LOCK_EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LockState {
    Locked,
    Unlocked,
}

/// Why the session locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LockReason {
    Timeout,
    Manual,
    Logout,
    AuthExpired,
    SettingsChanged,
    CorruptToken,
}

/// Broadcast to dependent surfaces whenever the session locks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockEvent {
    pub reason: LockReason,
    pub at: DateTime<Utc>,
}

struct GuardState {
    lock: LockState,
    timeout: Duration,
    /// Bumped whenever the countdown is replaced; a countdown that wakes with
    /// a stale generation does nothing.
    generation: u64,
    timer: Option<JoinHandle<()>>,
    last_activity: Instant,
}

struct GuardInner {
    vault: Arc<TokenVault>,
    state: Mutex<GuardState>,
    events: broadcast::Sender<LockEvent>,
}

/// Auto-lock state machine.
///
/// `Unlocked -> Locked` on countdown expiry, explicit lock, auth expiry or a
/// settings change that shortens the timeout below the idle time.
/// `Locked -> Unlocked` only through `unlock` after a successful login.
/// At most one countdown task exists at a time. Clone is cheap.
#[derive(Clone)]
pub struct SessionGuard {
    inner: Arc<GuardInner>,
}

impl SessionGuard {
    /// Create a locked guard. A zero timeout disables auto-lock.
    pub fn new(vault: Arc<TokenVault>, timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(LOCK_EVENT_CAPACITY);
        Self {
            inner: Arc::new(GuardInner {
                vault,
                state: Mutex::new(GuardState {
                    lock: LockState::Locked,
                    timeout,
                    generation: 0,
                    timer: None,
                    last_activity: Instant::now(),
                }),
                events,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, GuardState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pick the initial state from persisted material: unlocked only if an
    /// encrypted token exists and decrypts.
    pub fn restore(&self) -> LockState {
        match self.inner.vault.retrieve_token() {
            TokenLookup::Present(_) => {
                let mut state = self.state();
                state.lock = LockState::Unlocked;
                state.last_activity = Instant::now();
                let timeout = state.timeout;
                self.restart_countdown(&mut state, timeout);
                info!("Restored unlocked session");
                LockState::Unlocked
            }
            TokenLookup::Corrupt => {
                warn!("Stored session token is corrupt, discarding");
                if let Err(e) = self.inner.vault.purge() {
                    warn!(error = %e, "Failed to purge corrupt token");
                }
                LockState::Locked
            }
            TokenLookup::Absent => LockState::Locked,
        }
    }

    /// Persist a freshly issued token and unlock.
    ///
    /// The token is written under the state lock, so a concurrent `lock_now`
    /// either purges it before the unlock or not at all.
    pub fn unlock(&self, token: &str) -> Result<()> {
        let mut state = self.state();
        self.inner.vault.store_token(token)?;
        state.lock = LockState::Unlocked;
        state.last_activity = Instant::now();
        let timeout = state.timeout;
        self.restart_countdown(&mut state, timeout);
        info!(timeout_ms = timeout.as_millis() as u64, "Session unlocked");
        Ok(())
    }

    pub fn lock_state(&self) -> LockState {
        self.state().lock
    }

    pub fn is_unlocked(&self) -> bool {
        self.lock_state() == LockState::Unlocked
    }

    pub fn timeout(&self) -> Duration {
        self.state().timeout
    }

    /// (Re)start the countdown with `timeout`, superseding any prior one.
    /// While locked only the timeout is recorded.
    pub fn arm(&self, timeout: Duration) {
        let mut state = self.state();
        state.timeout = timeout;
        if state.lock == LockState::Unlocked {
            state.last_activity = Instant::now();
            self.restart_countdown(&mut state, timeout);
        }
    }

    /// Cancel the countdown without locking.
    pub fn disarm(&self) {
        let mut state = self.state();
        Self::cancel_countdown(&mut state);
    }

    /// Reset the countdown to zero elapsed. Ignored while locked.
    pub fn on_activity(&self) {
        let mut state = self.state();
        if state.lock != LockState::Unlocked {
            return;
        }
        state.last_activity = Instant::now();
        let timeout = state.timeout;
        self.restart_countdown(&mut state, timeout);
    }

    /// Apply a new timeout from settings, counting the idle time already
    /// spent. Locks immediately if the new timeout has already elapsed.
    pub fn apply_timeout(&self, timeout: Duration) {
        let mut state = self.state();
        state.timeout = timeout;
        if state.lock != LockState::Unlocked {
            return;
        }
        if timeout.is_zero() {
            Self::cancel_countdown(&mut state);
            return;
        }
        let idle = state.last_activity.elapsed();
        match timeout.checked_sub(idle) {
            Some(remaining) if !remaining.is_zero() => self.restart_countdown(&mut state, remaining),
            _ => {
                drop(state);
                self.lock_now(LockReason::SettingsChanged);
            }
        }
    }

    /// Time left before auto-lock, if unlocked with auto-lock enabled.
    pub fn time_until_lock(&self) -> Option<Duration> {
        let state = self.state();
        if state.lock != LockState::Unlocked || state.timeout.is_zero() {
            return None;
        }
        Some(state.timeout.saturating_sub(state.last_activity.elapsed()))
    }

    /// Lock the session: purge the cached key, delete the encrypted token and
    /// key material, and notify subscribers. The credential cache and outbox
    /// are left alone. Returns false if the session was already locked.
    pub fn lock_now(&self, reason: LockReason) -> bool {
        {
            let mut state = self.state();
            if state.lock == LockState::Locked {
                return false;
            }
            state.lock = LockState::Locked;
            Self::cancel_countdown(&mut state);
            if let Err(e) = self.inner.vault.purge() {
                warn!(error = %e, "Failed to purge token material on lock");
            }
        }

        info!(?reason, "Session locked");
        let event = LockEvent {
            reason,
            at: Utc::now(),
        };
        if self.inner.events.send(event).is_err() {
            debug!("No lock subscribers");
        }
        true
    }

    /// Subscribe to lock notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.inner.events.subscribe()
    }

    /// Decrypt the session token for one call. `None` while locked.
    pub fn token(&self) -> Option<SessionToken> {
        if !self.is_unlocked() {
            return None;
        }
        match self.inner.vault.retrieve_token() {
            TokenLookup::Present(token) => Some(token),
            TokenLookup::Absent => None,
            TokenLookup::Corrupt => {
                self.lock_now(LockReason::CorruptToken);
                None
            }
        }
    }

    fn cancel_countdown(state: &mut GuardState) {
        state.generation += 1;
        if let Some(handle) = state.timer.take() {
            handle.abort();
        }
    }

    fn restart_countdown(&self, state: &mut GuardState, after: Duration) {
        Self::cancel_countdown(state);
        if after.is_zero() {
            return;
        }
        let generation = state.generation;
        let weak: Weak<GuardInner> = Arc::downgrade(&self.inner);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(inner) = weak.upgrade() {
                SessionGuard { inner }.expire(generation);
            }
        }));
    }

    fn expire(&self, generation: u64) {
        let current = self.state().generation;
        if current == generation {
            self.lock_now(LockReason::Timeout);
        } else {
            debug!(generation, current, "Stale countdown ignored");
        }
    }
}
