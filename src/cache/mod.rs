//! Credential cache
//!
//! SSO cookies are cached per (gateway, protocol) so a reconnect can skip
//! the browser login. Records are JSON and live in the desktop user's
//! secret store, not root's, so every operation runs against the identity
//! resolved from the [`SessionEnv`].
//!
//! # Backends
//!
//! | Backend | Storage | Privileged access |
//! |---------|---------|-------------------|
//! | `secret-tool` | Secret Service via `secret-tool` | `runuser -u <user> --` |
//! | `file` | `~/.cache/vpn-sso/credentials/<sha256>.json`, mode 0600 | chown to the user |
//! | `keyring` | `keyring` crate | unsupported |
//!
//! Lookups check expiry and delete expired records. Clear operations are
//! best effort: the only error they report is a missing identity.

pub mod file;
pub mod keyring_store;
pub mod secret_tool;
pub mod worker;

use crate::auth::CredentialBundle;
use crate::config::CacheBackendKind;
use crate::protocol::Protocol;
use crate::session::{Identity, SessionEnv};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

pub use worker::CacheClient;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("No desktop user identity available for the credential cache")]
    NoIdentity,
    #[error("Secret store failed: {0}")]
    Backend(String),
    #[error("Credential cache I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to encode credential: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Secret store does not support {0}")]
    Unsupported(&'static str),
    #[error("Refusing to cache an empty cookie")]
    EmptyCookie,
}

/// What a cached record is keyed by
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub gateway: String,
    pub protocol: Protocol,
}

impl CacheKey {
    pub fn new(gateway: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            gateway: gateway.into(),
            protocol,
        }
    }

    /// Stable hex digest of gateway and protocol
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.gateway.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.protocol.as_str().as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.gateway, self.protocol)
    }
}

/// A cached SSO credential. The cookie is wiped from memory on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedCredential {
    pub gateway: String,
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub cookie: Zeroizing<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usergroup: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
}

impl CachedCredential {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at > 0 && now >= self.expires_at
    }

    pub fn has_cookie(&self) -> bool {
        !self.cookie.is_empty()
    }

    pub fn key(&self) -> CacheKey {
        CacheKey::new(self.gateway.clone(), self.protocol)
    }
}

impl fmt::Debug for CachedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedCredential")
            .field("gateway", &self.gateway)
            .field("protocol", &self.protocol)
            .field("username", &self.username)
            .field("cookie", &"<redacted>")
            .field("fingerprint", &self.fingerprint)
            .field("usergroup", &self.usergroup)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Time source in unix seconds
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

/// Persistent storage for serialized records, addressed by [`CacheKey`]
pub trait SecretStore: Send + Sync {
    fn name(&self) -> &'static str;
    fn store(&self, user: &Identity, session: &SessionEnv, key: &CacheKey, payload: &str) -> Result<(), CacheError>;
    /// `Ok(None)` when nothing is stored under `key`
    fn lookup(&self, user: &Identity, session: &SessionEnv, key: &CacheKey) -> Result<Option<Zeroizing<String>>, CacheError>;
    fn clear(&self, user: &Identity, session: &SessionEnv, key: &CacheKey) -> Result<(), CacheError>;
    fn clear_all(&self, user: &Identity, session: &SessionEnv) -> Result<(), CacheError>;
}

/// Open the configured backend
pub fn open_store(kind: CacheBackendKind) -> Box<dyn SecretStore> {
    match kind {
        CacheBackendKind::SecretTool => Box::new(secret_tool::SecretToolStore::new()),
        CacheBackendKind::File => Box::new(file::FileStore::new()),
        CacheBackendKind::Keyring => Box::new(keyring_store::KeyringStore::new()),
    }
}

/// TTL-aware cache on top of a [`SecretStore`]. All methods block.
pub struct CredentialCache {
    store: Box<dyn SecretStore>,
    clock: Arc<dyn Clock>,
    default_hours: u32,
}

impl CredentialCache {
    pub fn new(store: Box<dyn SecretStore>, clock: Arc<dyn Clock>, default_hours: u32) -> Self {
        Self {
            store,
            clock,
            default_hours,
        }
    }

    pub fn lookup(&self, session: &SessionEnv, key: &CacheKey) -> Result<Option<CachedCredential>, CacheError> {
        let user = session.identity().ok_or(CacheError::NoIdentity)?;
        let Some(payload) = self.store.lookup(&user, session, key)? else {
            debug!("No cached credential for {}", key);
            return Ok(None);
        };

        let record: CachedCredential = match serde_json::from_str(&payload) {
            Ok(record) => record,
            Err(e) => {
                warn!("Ignoring unreadable cached credential for {}: {}", key, e);
                return Ok(None);
            }
        };
        if record.key() != *key {
            warn!("Cached credential for {} is stored under {}", record.key(), key);
            return Ok(None);
        }

        if record.is_expired(self.clock.now()) {
            info!("Cached credential for {} has expired", key);
            if let Err(e) = self.store.clear(&user, session, key) {
                warn!("Failed to remove expired credential for {}: {}", key, e);
            }
            return Ok(None);
        }

        debug!("Found cached credential for {}", key);
        Ok(Some(record))
    }

    pub fn store(
        &self,
        session: &SessionEnv,
        key: &CacheKey,
        bundle: &CredentialBundle,
        ttl_hours: u32,
    ) -> Result<CachedCredential, CacheError> {
        let user = session.identity().ok_or(CacheError::NoIdentity)?;
        if bundle.cookie.is_empty() {
            return Err(CacheError::EmptyCookie);
        }

        let hours = if ttl_hours > 0 { ttl_hours } else { self.default_hours };
        let created_at = self.clock.now();
        let record = CachedCredential {
            gateway: key.gateway.clone(),
            protocol: key.protocol,
            username: bundle.username.clone(),
            cookie: bundle.cookie.clone(),
            fingerprint: bundle.fingerprint.clone(),
            usergroup: bundle.usergroup.clone(),
            created_at,
            expires_at: created_at + i64::from(hours) * 3600,
        };

        let payload = Zeroizing::new(serde_json::to_string(&record)?);
        self.store.store(&user, session, key, &payload)?;
        info!("Cached credential for {} ({} hours)", key, hours);
        Ok(record)
    }

    pub fn clear(&self, session: &SessionEnv, key: &CacheKey) -> Result<(), CacheError> {
        let user = session.identity().ok_or(CacheError::NoIdentity)?;
        match self.store.clear(&user, session, key) {
            Ok(()) => info!("Cleared cached credential for {}", key),
            Err(e) => warn!("Failed to clear cached credential for {}: {}", key, e),
        }
        Ok(())
    }

    pub fn clear_all(&self, session: &SessionEnv) -> Result<(), CacheError> {
        let user = session.identity().ok_or(CacheError::NoIdentity)?;
        match self.store.clear_all(&user, session) {
            Ok(()) => info!("Cleared all cached credentials ({})", self.store.name()),
            Err(e) => warn!("Failed to clear cached credentials: {}", e),
        }
        Ok(())
    }
}
