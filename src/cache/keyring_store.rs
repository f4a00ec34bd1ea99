//! Keyring backend
//!
//! Uses the platform keyring through the `keyring` crate. The crate talks to
//! the keyring of the calling user, so this backend only works when the
//! service already runs as the desktop user.

use super::{CacheError, CacheKey, SecretStore};
use crate::session::{Identity, SessionEnv};
use keyring::Entry;
use tracing::debug;
use zeroize::Zeroizing;

const SERVICE_NAME: &str = "vpn-sso";

pub struct KeyringStore;

impl KeyringStore {
    pub fn new() -> Self {
        Self
    }

    fn entry(&self, user: &Identity, key: &CacheKey) -> Result<Entry, CacheError> {
        if !user.is_current_user() {
            return Err(CacheError::Unsupported("access to another user's keyring"));
        }
        Entry::new(SERVICE_NAME, &key.digest()).map_err(backend)
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

fn backend(e: keyring::Error) -> CacheError {
    CacheError::Backend(e.to_string())
}

impl SecretStore for KeyringStore {
    fn name(&self) -> &'static str {
        "keyring"
    }

    fn store(&self, user: &Identity, _session: &SessionEnv, key: &CacheKey, payload: &str) -> Result<(), CacheError> {
        self.entry(user, key)?.set_password(payload).map_err(backend)
    }

    fn lookup(&self, user: &Identity, _session: &SessionEnv, key: &CacheKey) -> Result<Option<Zeroizing<String>>, CacheError> {
        match self.entry(user, key)?.get_password() {
            Ok(secret) => Ok(Some(Zeroizing::new(secret))),
            Err(keyring::Error::NoEntry) => {
                debug!("Keyring has no entry for {}", key);
                Ok(None)
            }
            Err(e) => Err(backend(e)),
        }
    }

    fn clear(&self, user: &Identity, _session: &SessionEnv, key: &CacheKey) -> Result<(), CacheError> {
        match self.entry(user, key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(backend(e)),
        }
    }

    fn clear_all(&self, _user: &Identity, _session: &SessionEnv) -> Result<(), CacheError> {
        Err(CacheError::Unsupported("clearing every entry"))
    }
}
