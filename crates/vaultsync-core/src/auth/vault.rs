use std::fmt;
use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng},
    XChaCha20Poly1305, XNonce,
};
use rand::{rngs::OsRng, RngCore};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::cache::{meta_keys, LocalStore};
use crate::error::{Result, VaultError};

/// XChaCha20-Poly1305 nonce length in bytes.
const NONCE_LEN: usize = 24;

/// Symmetric key length in bytes.
const KEY_LEN: usize = 32;

type TokenKey = Zeroizing<[u8; KEY_LEN]>;

/// A decrypted bearer token. Zeroized on drop and redacted in `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(Zeroizing<String>);

impl SessionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Zeroizing::new(token.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(<redacted>)")
    }
}

/// Outcome of reading or decrypting the stored token.
///
/// `Absent` and `Corrupt` both mean "no session" to callers, but stay
/// distinct so diagnostics can tell a logged-out user from a tampered or
/// undecryptable ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenLookup {
    Present(SessionToken),
    Absent,
    Corrupt,
}

impl TokenLookup {
    pub fn into_token(self) -> Option<SessionToken> {
        match self {
            TokenLookup::Present(token) => Some(token),
            TokenLookup::Absent | TokenLookup::Corrupt => None,
        }
    }
}

/// Encrypts the session token at rest.
///
/// The key is generated from the OS RNG on first use and persisted in the
/// store's metadata; a copy is cached in memory until `purge`.
pub struct TokenVault {
    store: Arc<LocalStore>,
    key: Mutex<Option<TokenKey>>,
}

impl TokenVault {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self {
            store,
            key: Mutex::new(None),
        }
    }

    fn cached_key(&self) -> Option<TokenKey> {
        self.key.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn cache_key(&self, key: &TokenKey) {
        *self.key.lock().unwrap_or_else(|e| e.into_inner()) = Some(key.clone());
    }

    /// Load the persisted key without creating one.
    fn load_key(&self) -> Result<Option<TokenKey>> {
        if let Some(key) = self.cached_key() {
            return Ok(Some(key));
        }
        let encoded: Option<String> = self.store.get_metadata(meta_keys::TOKEN_KEY)?;
        let Some(encoded) = encoded else {
            return Ok(None);
        };
        let bytes = Zeroizing::new(
            STANDARD
                .decode(encoded.as_bytes())
                .map_err(|e| VaultError::KeyUnavailable(format!("persisted key is not base64: {}", e)))?,
        );
        if bytes.len() != KEY_LEN {
            return Err(VaultError::KeyUnavailable(format!(
                "persisted key has length {}",
                bytes.len()
            )));
        }
        let mut key: TokenKey = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&bytes);
        self.cache_key(&key);
        Ok(Some(key))
    }

    /// Return the persistent key, generating and persisting one on first use.
    pub fn get_or_create_key(&self) -> Result<TokenKey> {
        if let Some(key) = self.load_key()? {
            return Ok(key);
        }
        let mut key: TokenKey = Zeroizing::new([0u8; KEY_LEN]);
        OsRng
            .try_fill_bytes(&mut key[..])
            .map_err(|e| VaultError::KeyUnavailable(format!("system RNG failed: {}", e)))?;
        let encoded = Zeroizing::new(STANDARD.encode(&key[..]));
        self.store.set_metadata(meta_keys::TOKEN_KEY, encoded.as_str())?;
        self.cache_key(&key);
        debug!("Generated new token key");
        Ok(key)
    }

    /// Encrypt `token` as base64(nonce || ciphertext+tag). Every call uses a
    /// fresh random nonce, so equal tokens never produce equal output.
    pub fn encrypt_token(&self, token: &str) -> Result<String> {
        let key = self.get_or_create_key()?;
        let cipher = XChaCha20Poly1305::new_from_slice(&key[..])
            .map_err(|_| VaultError::KeyUnavailable("invalid key length".to_string()))?;
        let nonce = XChaCha20Poly1305::generate_nonce(&mut AeadOsRng);
        let ciphertext = cipher
            .encrypt(&nonce, token.as_bytes())
            .map_err(|_| VaultError::KeyUnavailable("encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    /// Decrypt a value produced by `encrypt_token`. Never fails loudly:
    /// tampering, truncation or a missing key all yield `Corrupt`.
    pub fn decrypt_token(&self, ciphertext: &str) -> TokenLookup {
        let key = match self.load_key() {
            Ok(Some(key)) => key,
            Ok(None) => {
                warn!("Encrypted token present but no key to decrypt it");
                return TokenLookup::Corrupt;
            }
            Err(e) => {
                warn!(error = %e, "Token key unavailable");
                return TokenLookup::Corrupt;
            }
        };

        let Ok(data) = STANDARD.decode(ciphertext.as_bytes()) else {
            warn!("Stored token is not valid base64");
            return TokenLookup::Corrupt;
        };
        if data.len() <= NONCE_LEN {
            warn!(len = data.len(), "Stored token too short");
            return TokenLookup::Corrupt;
        }
        let (nonce, sealed) = data.split_at(NONCE_LEN);

        let Ok(cipher) = XChaCha20Poly1305::new_from_slice(&key[..]) else {
            return TokenLookup::Corrupt;
        };
        let plaintext = match cipher.decrypt(XNonce::from_slice(nonce), sealed) {
            Ok(plaintext) => Zeroizing::new(plaintext),
            Err(_) => {
                warn!("Stored token failed authentication");
                return TokenLookup::Corrupt;
            }
        };
        match std::str::from_utf8(&plaintext) {
            Ok(token) => TokenLookup::Present(SessionToken::new(token)),
            Err(_) => TokenLookup::Corrupt,
        }
    }

    /// Encrypt and persist the token.
    pub fn store_token(&self, token: &str) -> Result<()> {
        let sealed = self.encrypt_token(token)?;
        self.store.set_metadata(meta_keys::SESSION_TOKEN, &sealed)?;
        Ok(())
    }

    /// Read and decrypt the persisted token. Store failures degrade to
    /// `Absent` with a warning.
    pub fn retrieve_token(&self) -> TokenLookup {
        match self.store.get_metadata::<String>(meta_keys::SESSION_TOKEN) {
            Ok(Some(sealed)) => self.decrypt_token(&sealed),
            Ok(None) => TokenLookup::Absent,
            Err(e) => {
                warn!(error = %e, "Failed to read stored token");
                TokenLookup::Absent
            }
        }
    }

    pub fn remove_token(&self) -> Result<()> {
        self.store.remove_metadata(meta_keys::SESSION_TOKEN)?;
        Ok(())
    }

    /// Forget the in-memory key and delete the token and key material.
    pub fn purge(&self) -> Result<()> {
        *self.key.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.store.remove_metadata(meta_keys::SESSION_TOKEN)?;
        self.store.remove_metadata(meta_keys::TOKEN_KEY)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> (Arc<LocalStore>, TokenVault) {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        (store.clone(), TokenVault::new(store))
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let (_, vault) = vault();
        for token in ["eyJhbGciOiJIUzI1NiJ9.payload.sig", "", "ünïcödé-tøken"] {
            let sealed = vault.encrypt_token(token).unwrap();
            assert_eq!(vault.decrypt_token(&sealed), TokenLookup::Present(SessionToken::new(token)));
        }
    }

    #[test]
    fn test_encryption_uses_fresh_nonce() {
        let (_, vault) = vault();
        let a = vault.encrypt_token("same-token").unwrap();
        let b = vault.encrypt_token("same-token").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_is_persisted_and_reused() {
        let (store, vault) = vault();
        let sealed = vault.encrypt_token("abc").unwrap();
        let key = vault.get_or_create_key().unwrap();

        // A second vault over the same store must read the same key.
        let other = TokenVault::new(store);
        assert_eq!(other.get_or_create_key().unwrap(), key);
        assert_eq!(other.decrypt_token(&sealed).into_token().unwrap().expose(), "abc");
    }

    #[test]
    fn test_tampered_ciphertext_is_corrupt() {
        let (_, vault) = vault();
        let sealed = vault.encrypt_token("abc").unwrap();
        let mut bytes = STANDARD.decode(&sealed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert_eq!(vault.decrypt_token(&STANDARD.encode(bytes)), TokenLookup::Corrupt);
        assert_eq!(vault.decrypt_token("%%% not base64"), TokenLookup::Corrupt);
        assert_eq!(vault.decrypt_token(&STANDARD.encode([0u8; 8])), TokenLookup::Corrupt);
    }

    #[test]
    fn test_wrong_key_is_corrupt() {
        let (_, vault) = vault();
        let sealed = vault.encrypt_token("abc").unwrap();
        let (_, other) = self::vault();
        other.get_or_create_key().unwrap();
        assert_eq!(other.decrypt_token(&sealed), TokenLookup::Corrupt);
    }

    #[test]
    fn test_store_retrieve_remove() {
        let (_, vault) = vault();
        assert_eq!(vault.retrieve_token(), TokenLookup::Absent);
        vault.store_token("bearer-1").unwrap();
        assert_eq!(vault.retrieve_token().into_token().unwrap().expose(), "bearer-1");
        vault.remove_token().unwrap();
        assert_eq!(vault.retrieve_token(), TokenLookup::Absent);
    }

    #[test]
    fn test_purge_removes_key_material() {
        let (store, vault) = vault();
        vault.store_token("bearer-1").unwrap();
        vault.purge().unwrap();
        assert_eq!(vault.retrieve_token(), TokenLookup::Absent);
        assert!(store.get_metadata::<String>(meta_keys::TOKEN_KEY).unwrap().is_none());
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let token = SessionToken::new("super-secret");
        assert!(!format!("{:?}", token).contains("super-secret"));
    }
}
