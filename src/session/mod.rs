//! Desktop session context
//!
//! The service usually runs as root, but the SSO authenticators need a
//! graphical session and the credential cache lives in a desktop user's
//! secret store. This module works out who that user is and which display,
//! compositor and message bus belong to them.
//!
//! # Resolution order
//!
//! 1. Unprivileged caller with `DISPLAY` set: use our own environment
//! 2. `loginctl`: first x11/wayland session
//! 3. Desktop processes (`Xorg`, `Xwayland`, `gnome-shell`, ...) owned by an interactive uid
//! 4. `SUDO_UID` / `PKEXEC_UID`
//! 5. Numeric entries under `/run/user`
//!
//! Per-session variables then come from the session leader's
//! `/proc/<pid>/environ`, with socket and dotfile fallbacks. Every field of
//! the result is optional.

pub mod discovery;

use nix::unistd::{Uid, User, getegid, geteuid};
use serde::Serialize;
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const PRIVILEGE_HINTS: &[&str] = &["SUDO_UID", "PKEXEC_UID"];

/// Resolved snapshot of an interactive desktop session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionEnv {
    pub display: Option<String>,
    pub wayland_display: Option<String>,
    pub dbus_address: Option<String>,
    pub xauthority: Option<String>,
    pub xdg_runtime_dir: Option<String>,
    pub home: Option<PathBuf>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub username: Option<String>,
}

/// The user a privileged operation should act as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    pub username: String,
    pub home: Option<PathBuf>,
}

impl Identity {
    /// True when this process already runs as the identity
    pub fn is_current_user(&self) -> bool {
        geteuid().as_raw() == self.uid
    }
}

impl SessionEnv {
    /// Identity for privileged operations; needs both a uid and a username
    pub fn identity(&self) -> Option<Identity> {
        let uid = self.uid?;
        let username = self.username.clone().filter(|u| !u.is_empty())?;
        Some(Identity {
            uid,
            gid: self.gid.unwrap_or(uid),
            username,
            home: self.home.clone(),
        })
    }

    pub fn has_display(&self) -> bool {
        self.display.is_some() || self.wayland_display.is_some()
    }

    /// Environment for GUI-capable children.
    ///
    /// `tool_dir` is prepended to the inherited `PATH`. Toolkits are pinned to
    /// X11 so embedded browsers work through Xwayland.
    pub fn spawn_environment(
        &self,
        tool_dir: &Path,
        inherited_path: Option<&str>,
    ) -> Vec<(String, String)> {
        let mut vars = Vec::new();
        let mut push = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                vars.push((key.to_string(), value));
            }
        };

        push("DISPLAY", self.display.clone());
        push("WAYLAND_DISPLAY", self.wayland_display.clone());
        push("XDG_RUNTIME_DIR", self.xdg_runtime_dir.clone());
        push("XAUTHORITY", self.xauthority.clone());
        push("DBUS_SESSION_BUS_ADDRESS", self.dbus_address.clone());
        push("HOME", self.home.as_ref().map(|h| h.display().to_string()));
        push("USER", self.username.clone());

        let base = inherited_path
            .filter(|p| !p.is_empty())
            .unwrap_or("/usr/local/bin:/usr/bin:/bin");
        push("PATH", Some(format!("{}:{}", tool_dir.display(), base)));
        push("QT_QPA_PLATFORM", Some("xcb".to_string()));
        push("GDK_BACKEND", Some("x11".to_string()));
        vars
    }
}

/// Source of session snapshots
pub trait SessionResolver: Send + Sync {
    fn resolve(&self) -> SessionEnv;
}

/// Filesystem roots consulted during resolution
#[derive(Debug, Clone)]
pub struct SystemPaths {
    pub proc_root: PathBuf,
    pub run_user: PathBuf,
    pub x11_sockets: PathBuf,
}

impl Default for SystemPaths {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            run_user: PathBuf::from("/run/user"),
            x11_sockets: PathBuf::from("/tmp/.X11-unix"),
        }
    }
}

/// Resolver backed by loginctl, ps, pgrep and procfs
pub struct SystemSessionResolver {
    uid_threshold: u32,
    paths: SystemPaths,
}

impl SystemSessionResolver {
    pub fn new(uid_threshold: u32) -> Self {
        Self {
            uid_threshold,
            paths: SystemPaths::default(),
        }
    }

    pub fn with_paths(uid_threshold: u32, paths: SystemPaths) -> Self {
        Self {
            uid_threshold,
            paths,
        }
    }

    fn from_own_environment(&self) -> SessionEnv {
        let uid = geteuid();
        let user = lookup_user(uid);
        SessionEnv {
            display: env_var("DISPLAY"),
            wayland_display: env_var("WAYLAND_DISPLAY"),
            dbus_address: env_var("DBUS_SESSION_BUS_ADDRESS"),
            xauthority: env_var("XAUTHORITY"),
            xdg_runtime_dir: env_var("XDG_RUNTIME_DIR"),
            home: env_var("HOME")
                .map(PathBuf::from)
                .or_else(|| user.as_ref().map(|u| u.dir.clone())),
            uid: Some(uid.as_raw()),
            gid: Some(getegid().as_raw()),
            username: user.map(|u| u.name),
        }
    }

    fn find_session_uid(&self) -> Option<u32> {
        if let Some(uid) = discovery::graphical_session_uid(self.uid_threshold) {
            debug!("Graphical session owner from loginctl: {}", uid);
            return Some(uid);
        }
        if let Some(uid) = discovery::desktop_process_uid(self.uid_threshold) {
            debug!("Graphical session owner from process list: {}", uid);
            return Some(uid);
        }
        if let Some(uid) = PRIVILEGE_HINTS
            .iter()
            .find_map(|var| env_var(var).and_then(|v| v.parse().ok()))
        {
            debug!("Graphical session owner from privilege hint: {}", uid);
            return Some(uid);
        }
        discovery::scan_runtime_dirs(&self.paths.run_user, self.uid_threshold)
    }

    fn from_session_uid(&self, uid: u32) -> SessionEnv {
        let user = lookup_user(Uid::from_raw(uid));
        let mut session = SessionEnv {
            uid: Some(uid),
            gid: Some(user.as_ref().map_or(uid, |u| u.gid.as_raw())),
            username: user.as_ref().map(|u| u.name.clone()),
            home: user.as_ref().map(|u| u.dir.clone()),
            ..SessionEnv::default()
        };

        let runtime_dir = self.paths.run_user.join(uid.to_string());
        if runtime_dir.is_dir() {
            session.xdg_runtime_dir = Some(runtime_dir.display().to_string());
        }

        match discovery::session_leader(uid)
            .and_then(|pid| discovery::read_environ(&self.paths.proc_root, pid))
        {
            Some(vars) => {
                session.display = vars.get("DISPLAY").cloned();
                session.wayland_display = vars.get("WAYLAND_DISPLAY").cloned();
                session.dbus_address = vars.get("DBUS_SESSION_BUS_ADDRESS").cloned();
                session.xauthority = vars.get("XAUTHORITY").cloned();
                if session.xdg_runtime_dir.is_none() {
                    session.xdg_runtime_dir = vars.get("XDG_RUNTIME_DIR").cloned();
                }
            }
            None => debug!("No session leader environment for uid {}", uid),
        }

        self.apply_fallbacks(uid, &mut session);
        session
    }

    fn apply_fallbacks(&self, uid: u32, session: &mut SessionEnv) {
        if session.display.is_none() {
            session.display = discovery::display_from_sockets(&self.paths.x11_sockets);
        }

        if session.xauthority.is_none() {
            session.xauthority = discovery::xwayland_pid(uid)
                .and_then(|pid| discovery::read_environ(&self.paths.proc_root, pid))
                .and_then(|vars| vars.get("XAUTHORITY").cloned());
        }
        if session.xauthority.is_none() {
            session.xauthority = session
                .xdg_runtime_dir
                .as_deref()
                .and_then(|dir| discovery::find_mutter_xauth(Path::new(dir)))
                .map(|p| p.display().to_string());
        }
        if session.xauthority.is_none() {
            session.xauthority = session
                .home
                .as_ref()
                .map(|home| home.join(".Xauthority"))
                .filter(|p| p.exists())
                .map(|p| p.display().to_string());
        }

        if session.dbus_address.is_none() {
            session.dbus_address = session
                .xdg_runtime_dir
                .as_deref()
                .map(|dir| Path::new(dir).join("bus"))
                .filter(|bus| bus.exists())
                .map(|bus| format!("unix:path={}", bus.display()));
        }
    }
}

impl SessionResolver for SystemSessionResolver {
    fn resolve(&self) -> SessionEnv {
        if !geteuid().is_root() && env_var("DISPLAY").is_some() {
            debug!("Using the current process environment as the session");
            return self.from_own_environment();
        }

        let Some(uid) = self.find_session_uid() else {
            warn!("No graphical desktop session found");
            return SessionEnv::default();
        };
        if uid < self.uid_threshold {
            warn!(
                "Session uid {} is below the interactive threshold {}",
                uid, self.uid_threshold
            );
            return SessionEnv::default();
        }

        let session = self.from_session_uid(uid);
        info!(
            "Resolved desktop session: user={} display={} wayland={}",
            session.username.as_deref().unwrap_or("?"),
            session.display.as_deref().unwrap_or("-"),
            session.wayland_display.as_deref().unwrap_or("-"),
        );
        session
    }
}

fn lookup_user(uid: Uid) -> Option<User> {
    match User::from_uid(uid) {
        Ok(user) => user,
        Err(e) => {
            debug!("passwd lookup for uid {} failed: {}", uid, e);
            None
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}
