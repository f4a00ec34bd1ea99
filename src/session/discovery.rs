//! Desktop session discovery helpers
//!
//! Each helper answers one question about the running system. Parsing is
//! kept separate from command execution so it can be tested directly.

use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Process names that only run inside a graphical desktop session
const DESKTOP_PROCESSES: &[&str] = &["Xorg", "Xwayland", "gnome-shell", "gnome-session", "kwin"];

/// Candidates for the session leader when loginctl cannot name one
pub const SESSION_LEADERS: &[&str] = &[
    "gnome-session-binary",
    "gnome-session",
    "gnome-shell",
    "plasmashell",
    "xfce4-session",
];

/// Run a command and return its stdout when it exits successfully
pub fn run(program: &str, args: &[&str]) -> Option<String> {
    match Command::new(program).args(args).output() {
        Ok(output) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(output) => {
            debug!("{} {:?} exited with {}", program, args, output.status);
            None
        }
        Err(e) => {
            debug!("{} unavailable: {}", program, e);
            None
        }
    }
}

/// `loginctl list-sessions --no-legend` rows as (session id, uid)
pub fn parse_session_rows(output: &str) -> Vec<(String, u32)> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let session = fields.next()?;
            let uid = fields.next()?.parse().ok()?;
            Some((session.to_string(), uid))
        })
        .collect()
}

pub fn is_graphical_session_type(kind: &str) -> bool {
    matches!(kind.trim(), "x11" | "wayland")
}

/// Sessions owned by regular users; greeters such as gdm run below `threshold`
pub fn user_session_rows(output: &str, threshold: u32) -> Vec<(String, u32)> {
    parse_session_rows(output)
        .into_iter()
        .filter(|(_, uid)| *uid >= threshold)
        .collect()
}

/// First graphical session of a regular user according to loginctl
pub fn graphical_session_uid(threshold: u32) -> Option<u32> {
    let rows = run("loginctl", &["list-sessions", "--no-legend"])?;
    user_session_rows(&rows, threshold).into_iter().find_map(|(session, uid)| {
        let kind = run("loginctl", &["show-session", &session, "-p", "Type", "--value"])?;
        is_graphical_session_type(&kind).then_some(uid)
    })
}

/// Owner of the first desktop process in `ps -eo uid,comm` output
pub fn parse_desktop_process_uid(output: &str, threshold: u32) -> Option<u32> {
    output.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let uid: u32 = fields.next()?.parse().ok()?;
        let comm = fields.next()?;
        let is_desktop = DESKTOP_PROCESSES.iter().any(|name| comm.starts_with(name));
        (is_desktop && uid >= threshold).then_some(uid)
    })
}

pub fn desktop_process_uid(threshold: u32) -> Option<u32> {
    let output = run("ps", &["-eo", "uid,comm", "--no-headers"])?;
    parse_desktop_process_uid(&output, threshold)
}

/// Lowest numeric entry under a per-user runtime root that passes the threshold
pub fn scan_runtime_dirs(root: &Path, threshold: u32) -> Option<u32> {
    let entries = fs::read_dir(root).ok()?;
    entries
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter(|uid| *uid >= threshold)
        .min()
}

/// `leader` pid of the loginctl JSON session entry owned by `uid`.
///
/// Entries without a `uid` field are accepted for any user.
pub fn parse_session_leader(json: &str, uid: u32) -> Option<u32> {
    let sessions: Vec<Value> = serde_json::from_str(json).ok()?;
    sessions
        .iter()
        .filter(|entry| entry.get("uid").and_then(as_u32).is_none_or(|owner| owner == uid))
        .find_map(|entry| entry.get("leader").and_then(as_u32))
}

fn as_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub fn session_leader(uid: u32) -> Option<u32> {
    if let Some(json) = run("loginctl", &["list-sessions", "--no-legend", "-o", "json"]) {
        if let Some(pid) = parse_session_leader(&json, uid) {
            return Some(pid);
        }
    }

    let uid = uid.to_string();
    SESSION_LEADERS
        .iter()
        .find_map(|name| run("pgrep", &["-u", &uid, "-x", name]).and_then(|out| first_pid(&out)))
}

/// Pid of the user's Xwayland process, if any
pub fn xwayland_pid(uid: u32) -> Option<u32> {
    run("pgrep", &["-u", &uid.to_string(), "Xwayland"]).and_then(|out| first_pid(&out))
}

pub fn first_pid(output: &str) -> Option<u32> {
    output.lines().find_map(|line| line.trim().parse().ok())
}

/// Parse a NUL-separated `environ` table
pub fn parse_environ(raw: &[u8]) -> HashMap<String, String> {
    raw.split(|b| *b == 0)
        .filter_map(|entry| {
            let entry = std::str::from_utf8(entry).ok()?;
            let (key, value) = entry.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

pub fn read_environ(proc_root: &Path, pid: u32) -> Option<HashMap<String, String>> {
    let path = proc_root.join(pid.to_string()).join("environ");
    match fs::read(&path) {
        Ok(raw) => Some(parse_environ(&raw)),
        Err(e) => {
            debug!("Cannot read {}: {}", path.display(), e);
            None
        }
    }
}

/// `:0` or `:1` when the matching X11 socket exists
pub fn display_from_sockets(socket_dir: &Path) -> Option<String> {
    ["0", "1"]
        .iter()
        .find(|n| socket_dir.join(format!("X{}", n)).exists())
        .map(|n| format!(":{}", n))
}

/// Auth file mutter writes for its Xwayland server
pub fn find_mutter_xauth(runtime_dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(runtime_dir).ok()?;
    entries.filter_map(Result::ok).map(|e| e.path()).find(|path| {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(".mutter-Xwaylandauth."))
    })
}
