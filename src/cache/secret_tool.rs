//! `secret-tool` backend
//!
//! Records are stored in the Secret Service under a fixed schema with
//! `gateway` and `protocol` attributes. When the service runs as root the
//! tool is started through `runuser` so it talks to the desktop user's
//! keyring on their session bus.

use super::{CacheError, CacheKey, SecretStore};
use crate::session::{Identity, SessionEnv};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use tracing::debug;
use zeroize::Zeroizing;

pub const SCHEMA: &str = "org.freedesktop.NetworkManager.vpn-sso";

pub struct SecretToolStore {
    secret_tool: PathBuf,
    runuser: PathBuf,
}

impl SecretToolStore {
    pub fn new() -> Self {
        Self {
            secret_tool: PathBuf::from("/usr/bin/secret-tool"),
            runuser: PathBuf::from("/usr/sbin/runuser"),
        }
    }

    /// Full argv for a secret-tool invocation, including any runuser prefix
    pub fn argv(&self, user: &Identity, as_other_user: bool, verb_args: &[String]) -> Vec<String> {
        let mut argv = Vec::new();
        if as_other_user {
            argv.push(self.runuser.display().to_string());
            argv.push("-u".to_string());
            argv.push(user.username.clone());
            argv.push("--".to_string());
        }
        argv.push(self.secret_tool.display().to_string());
        argv.extend(verb_args.iter().cloned());
        argv
    }

    fn command(&self, user: &Identity, session: &SessionEnv, verb_args: &[String]) -> Command {
        let argv = self.argv(user, !user.is_current_user(), verb_args);
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        if let Some(bus) = &session.dbus_address {
            cmd.env("DBUS_SESSION_BUS_ADDRESS", bus);
        }
        if let Some(runtime) = &session.xdg_runtime_dir {
            cmd.env("XDG_RUNTIME_DIR", runtime);
        }
        cmd
    }

    fn run(&self, user: &Identity, session: &SessionEnv, verb_args: &[String], stdin: Option<&str>) -> Result<Output, CacheError> {
        let mut cmd = self.command(user, session, verb_args);
        cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())?;
        }
        Ok(child.wait_with_output()?)
    }
}

impl Default for SecretToolStore {
    fn default() -> Self {
        Self::new()
    }
}

pub fn attributes(key: &CacheKey) -> Vec<String> {
    vec![
        "xdg:schema".to_string(),
        SCHEMA.to_string(),
        "gateway".to_string(),
        key.gateway.clone(),
        "protocol".to_string(),
        key.protocol.as_str().to_string(),
    ]
}

fn failure(verb: &str, output: &Output) -> CacheError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    CacheError::Backend(format!(
        "secret-tool {} exited with {}: {}",
        verb,
        output.status,
        stderr.trim()
    ))
}

impl SecretStore for SecretToolStore {
    fn name(&self) -> &'static str {
        "secret-tool"
    }

    fn store(&self, user: &Identity, session: &SessionEnv, key: &CacheKey, payload: &str) -> Result<(), CacheError> {
        let mut args = vec![
            "store".to_string(),
            "--label".to_string(),
            format!("VPN SSO: {} ({})", key.gateway, key.protocol),
        ];
        args.extend(attributes(key));

        let output = self.run(user, session, &args, Some(payload))?;
        if !output.status.success() {
            return Err(failure("store", &output));
        }
        Ok(())
    }

    fn lookup(&self, user: &Identity, session: &SessionEnv, key: &CacheKey) -> Result<Option<Zeroizing<String>>, CacheError> {
        let mut args = vec!["lookup".to_string()];
        args.extend(attributes(key));

        let mut output = self.run(user, session, &args, None)?;
        let stdout = Zeroizing::new(std::mem::take(&mut output.stdout));
        match output.status.code() {
            Some(0) => {
                let secret = String::from_utf8_lossy(&stdout).trim().to_string();
                Ok((!secret.is_empty()).then(|| Zeroizing::new(secret)))
            }
            // secret-tool exits 1 when nothing matches
            Some(1) => {
                debug!("secret-tool found nothing for {}", key);
                Ok(None)
            }
            _ => Err(failure("lookup", &output)),
        }
    }

    fn clear(&self, user: &Identity, session: &SessionEnv, key: &CacheKey) -> Result<(), CacheError> {
        let mut args = vec!["clear".to_string()];
        args.extend(attributes(key));

        let output = self.run(user, session, &args, None)?;
        if !output.status.success() {
            return Err(failure("clear", &output));
        }
        Ok(())
    }

    fn clear_all(&self, user: &Identity, session: &SessionEnv) -> Result<(), CacheError> {
        let args = vec!["clear".to_string(), "xdg:schema".to_string(), SCHEMA.to_string()];
        let output = self.run(user, session, &args, None)?;
        if !output.status.success() {
            return Err(failure("clear", &output));
        }
        Ok(())
    }
}
