//! Child process supervision primitives
//!
//! Both the SSO authenticator and the tunnel run as supervised children: a
//! background task owns the `tokio::process::Child`, and the rest of the
//! service holds a [`ChildControl`] to ask for it to stop.
//!
//! | Stop mode | Signal | Used for |
//! |-----------|--------|----------|
//! | `Terminate` | SIGTERM | SSO children and final logout |
//! | `PreserveSession` | SIGHUP | Tunnel teardown that keeps the remote session (and cookie) valid |
//! | `Kill` | SIGKILL | Cancellation |
//!
//! Every mode is followed by a grace period, after which the child is
//! force-killed.

use crate::session::Identity;
use nix::sys::signal::{Signal, kill};
use nix::unistd::{Gid, Pid, Uid, chdir, geteuid, setgid, setgroups, setuid};
use std::ffi::{CStr, CString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Error, Debug)]
#[error("Failed to start {program}: {source}")]
pub struct SpawnError {
    pub program: String,
    #[source]
    pub source: io::Error,
}

impl SpawnError {
    pub fn new(program: impl Into<String>, source: io::Error) -> Self {
        Self {
            program: program.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    Terminate,
    PreserveSession,
    Kill,
}

impl StopMode {
    pub fn signal(self) -> Signal {
        match self {
            StopMode::Terminate => Signal::SIGTERM,
            StopMode::PreserveSession => Signal::SIGHUP,
            StopMode::Kill => Signal::SIGKILL,
        }
    }
}

/// Handle used to stop a supervised child
pub trait ChildControl: Send {
    fn stop(&mut self, mode: StopMode);
}

/// Control half of a supervised child
pub struct SupervisedChild {
    pid: Option<u32>,
    requests: mpsc::UnboundedSender<StopMode>,
    cancel: CancellationToken,
}

/// Supervisor half: stop requests plus the cancellation flag that turns
/// pending output handling into a no-op
pub struct StopRequests {
    pub requests: mpsc::UnboundedReceiver<StopMode>,
    pub cancel: CancellationToken,
}

impl SupervisedChild {
    pub fn new(pid: Option<u32>) -> (Self, StopRequests) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        (
            Self {
                pid,
                requests: tx,
                cancel: cancel.clone(),
            },
            StopRequests {
                requests: rx,
                cancel,
            },
        )
    }
}

impl ChildControl for SupervisedChild {
    fn stop(&mut self, mode: StopMode) {
        debug!("Stopping child {:?} with {:?}", self.pid, mode);
        self.cancel.cancel();
        let _ = self.requests.send(mode);
    }
}

impl StopRequests {
    /// Next stop request. A dropped control counts as a kill.
    pub async fn next(&mut self) -> StopMode {
        self.requests.recv().await.unwrap_or(StopMode::Kill)
    }
}

/// Signal the child, wait out the grace period, then force-kill
pub async fn stop_child(child: &mut Child, mode: StopMode, grace: Duration) -> Option<ExitStatus> {
    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), mode.signal()) {
            debug!("Failed to signal pid {}: {}", pid, e);
        }
    }

    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            warn!("Failed to wait for child: {}", e);
            None
        }
        Err(_) => {
            warn!("Child ignored {:?} for {:?}, killing it", mode, grace);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill child: {}", e);
            }
            child.try_wait().ok().flatten()
        }
    }
}

pub fn running_privileged() -> bool {
    geteuid().is_root()
}

/// Target of a privilege drop, prepared before fork
#[derive(Debug, Clone)]
pub struct SpawnIdentity {
    pub uid: Uid,
    pub gid: Gid,
    pub home: Option<CString>,
}

impl From<&Identity> for SpawnIdentity {
    fn from(identity: &Identity) -> Self {
        Self {
            uid: Uid::from_raw(identity.uid),
            gid: Gid::from_raw(identity.gid),
            home: identity
                .home
                .as_ref()
                .and_then(|h| CString::new(h.as_os_str().as_bytes()).ok()),
        }
    }
}

/// The syscalls a privilege drop needs
pub trait PrivilegeOps {
    fn clear_groups(&self) -> nix::Result<()>;
    fn set_gid(&self, gid: Gid) -> nix::Result<()>;
    fn set_uid(&self, uid: Uid) -> nix::Result<()>;
    fn change_dir(&self, dir: &CStr) -> nix::Result<()>;
}

pub struct NixPrivilegeOps;

impl PrivilegeOps for NixPrivilegeOps {
    fn clear_groups(&self) -> nix::Result<()> {
        setgroups(&[])
    }

    fn set_gid(&self, gid: Gid) -> nix::Result<()> {
        setgid(gid)
    }

    fn set_uid(&self, uid: Uid) -> nix::Result<()> {
        setuid(uid)
    }

    fn change_dir(&self, dir: &CStr) -> nix::Result<()> {
        chdir(dir)
    }
}

/// Assume `target` in the current process.
///
/// Order matters: supplementary groups, then group, then user, then home.
/// Only the group and user changes are fatal. Runs between fork and exec,
/// so it must not allocate or log.
pub fn assume_identity<O: PrivilegeOps>(ops: &O, target: &SpawnIdentity) -> nix::Result<()> {
    let _ = ops.clear_groups();
    ops.set_gid(target.gid)?;
    ops.set_uid(target.uid)?;
    if let Some(home) = target.home.as_deref() {
        let _ = ops.change_dir(home);
    }
    Ok(())
}

/// Make `cmd` run as `identity` when this process is privileged
pub fn run_as(cmd: &mut Command, identity: &Identity) {
    if !running_privileged() {
        return;
    }
    debug!("Child will run as {} ({})", identity.username, identity.uid);
    let target = SpawnIdentity::from(identity);
    // SAFETY: the hook only issues raw syscalls on data prepared before fork.
    unsafe {
        cmd.pre_exec(move || assume_identity(&NixPrivilegeOps, &target).map_err(io::Error::from));
    }
}
