use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default auto-lock timeout: 15 minutes.
const DEFAULT_AUTO_LOCK_TIMEOUT_MS: u64 = 15 * 60 * 1000;

/// Default interval between background outbox drains.
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;

/// User settings pushed by the options page via `SETTINGS_UPDATED`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Settings {
    /// Inactivity timeout before the session locks. 0 disables auto-lock.
    pub auto_lock_timeout_ms: u64,
    /// Run a full sync right after a successful login.
    pub sync_on_unlock: bool,
    /// Background drain interval. 0 disables the periodic drain.
    pub sync_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_lock_timeout_ms: DEFAULT_AUTO_LOCK_TIMEOUT_MS,
            sync_on_unlock: true,
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
        }
    }
}

impl Settings {
    pub fn auto_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.auto_lock_timeout_ms)
    }

    pub fn sync_interval(&self) -> Option<Duration> {
        (self.sync_interval_secs > 0).then(|| Duration::from_secs(self.sync_interval_secs))
    }
}
