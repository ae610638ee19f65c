//! Remembered login passwords in the OS keychain.

use anyhow::{Context, Result};
use keyring::Entry;

use vaultsync_core::config::APP_NAME;

pub struct RememberedLogin;

impl RememberedLogin {
    /// Store the password for `username` in the OS keychain
    pub fn store(username: &str, password: &str) -> Result<()> {
        let entry = Entry::new(APP_NAME, username).context("Failed to create keyring entry")?;
        entry
            .set_password(password)
            .context("Failed to store password in keychain")?;
        Ok(())
    }

    /// Remembered password for `username`, if any
    pub fn get_password(username: &str) -> Option<String> {
        Entry::new(APP_NAME, username)
            .and_then(|entry| entry.get_password())
            .ok()
    }

    /// Forget the password for `username`
    pub fn delete(username: &str) -> Result<()> {
        let entry = Entry::new(APP_NAME, username).context("Failed to create keyring entry")?;
        entry
            .delete_credential()
            .context("Failed to delete credential from keychain")?;
        Ok(())
    }
}
