//! File backend
//!
//! One JSON file per key under the desktop user's cache directory. The
//! directory is 0700 and each file 0600. When the service runs as root,
//! every filesystem call is made with the user's filesystem uid and gid,
//! so whatever gets created belongs to the user and the user's own
//! permissions decide what may be touched.

use super::{CacheError, CacheKey, SecretStore};
use crate::process::running_privileged;
use crate::session::{Identity, SessionEnv};
use nix::unistd::{Gid, Uid, setfsgid, setfsuid};
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;
use tracing::debug;
use zeroize::Zeroizing;

const CACHE_SUBDIR: &str = ".cache/vpn-sso/credentials";

pub struct FileStore {
    root: Option<PathBuf>,
}

impl FileStore {
    /// Store under each user's home directory
    pub fn new() -> Self {
        Self { root: None }
    }

    /// Store under a fixed directory regardless of user
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn dir(&self, user: &Identity) -> Result<PathBuf, CacheError> {
        if let Some(root) = &self.root {
            return Ok(root.clone());
        }
        user.home
            .as_ref()
            .map(|home| home.join(CACHE_SUBDIR))
            .ok_or_else(|| CacheError::Backend(format!("{} has no home directory", user.username)))
    }

    fn path(&self, user: &Identity, key: &CacheKey) -> Result<PathBuf, CacheError> {
        Ok(self.dir(user)?.join(format!("{}.json", key.digest())))
    }

    fn prepare_dir(&self, user: &Identity) -> Result<PathBuf, CacheError> {
        let dir = self.dir(user)?;
        fs::DirBuilder::new().recursive(true).mode(0o700).create(&dir)?;
        if fs::symlink_metadata(&dir)?.file_type().is_symlink() {
            return Err(CacheError::Backend(format!("{} is a symlink", dir.display())));
        }
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        Ok(dir)
    }
}

impl Default for FileStore {
    fn default() -> Self {
        Self::new()
    }
}

/// The calling thread's filesystem uid/gid switched to another user.
/// Linux keeps these per thread, so other threads are unaffected, and the
/// previous values come back on drop.
struct FsIdentity {
    uid: Uid,
    gid: Gid,
}

impl FsIdentity {
    fn assume(user: &Identity) -> Option<Self> {
        if !running_privileged() || user.is_current_user() {
            return None;
        }
        let gid = setfsgid(Gid::from_raw(user.gid));
        let uid = setfsuid(Uid::from_raw(user.uid));
        Some(Self { uid, gid })
    }
}

impl Drop for FsIdentity {
    fn drop(&mut self) {
        setfsuid(self.uid);
        setfsgid(self.gid);
    }
}

impl SecretStore for FileStore {
    fn name(&self) -> &'static str {
        "file"
    }

    fn store(&self, user: &Identity, _session: &SessionEnv, key: &CacheKey, payload: &str) -> Result<(), CacheError> {
        let _fs = FsIdentity::assume(user);
        let dir = self.prepare_dir(user)?;
        let path = dir.join(format!("{}.json", key.digest()));
        let tmp = dir.join(format!(".{}.tmp", key.digest()));

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .custom_flags(nix::libc::O_NOFOLLOW)
            .open(&tmp)?;
        file.write_all(payload.as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &path)?;
        debug!("Wrote {}", path.display());
        Ok(())
    }

    fn lookup(&self, user: &Identity, _session: &SessionEnv, key: &CacheKey) -> Result<Option<Zeroizing<String>>, CacheError> {
        let path = self.path(user, key)?;
        let _fs = FsIdentity::assume(user);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(Zeroizing::new(content))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn clear(&self, user: &Identity, _session: &SessionEnv, key: &CacheKey) -> Result<(), CacheError> {
        let path = self.path(user, key)?;
        let _fs = FsIdentity::assume(user);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn clear_all(&self, user: &Identity, _session: &SessionEnv) -> Result<(), CacheError> {
        let dir = self.dir(user)?;
        let _fs = FsIdentity::assume(user);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}
