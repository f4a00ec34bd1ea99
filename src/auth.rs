//! SSO authentication launcher
//!
//! Runs the protocol's browser-based authenticator inside the desktop
//! session, collects everything it prints, and extracts a cookie once it
//! exits. Authenticators refuse to run as root, so a privileged service
//! spawns them as the session user.
//!
//! Exit codes are only a hint. The tools are often killed right after they
//! print credentials, so exit codes 1 and 2 still count as success when the
//! output contains a known success phrase.

use crate::config::ConnectionConfig;
use crate::process::{self, ChildControl, SpawnError, StopMode, StopRequests, SupervisedChild};
use crate::protocol::Protocol;
use crate::session::SessionEnv;
use std::env;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

const SUCCESS_PHRASES: &[&str] = &[
    "Connected",
    "connection established",
    "Login successful",
    "Authentication successful",
    "authenticated",
];

/// How long to keep reading buffered output once the authenticator exits
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Error, Debug)]
pub enum AuthError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("Authenticator failed: {0}")]
    Failed(String),
    #[error("Authenticator finished without producing a cookie")]
    NoCookie,
    #[error("Authentication was cancelled")]
    Cancelled,
    #[error("Failed to read authenticator output: {0}")]
    Io(#[from] io::Error),
}

/// Secrets produced by a successful SSO login
#[derive(Clone)]
pub struct CredentialBundle {
    pub cookie: Zeroizing<String>,
    pub username: Option<String>,
    pub fingerprint: Option<String>,
    pub usergroup: Option<String>,
    pub host: Option<String>,
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("cookie", &format_args!("<{} bytes>", self.cookie.len()))
            .field("username", &self.username)
            .field("fingerprint", &self.fingerprint)
            .field("usergroup", &self.usergroup)
            .field("host", &self.host)
            .finish()
    }
}

/// A running authenticator
pub struct AuthSession {
    pub outcome: oneshot::Receiver<Result<CredentialBundle, AuthError>>,
    pub control: Box<dyn ChildControl>,
}

/// Starts SSO authenticators
pub trait Authenticator: Send + Sync {
    fn launch(&self, config: &ConnectionConfig, session: &SessionEnv) -> Result<AuthSession, SpawnError>;
}

/// Run one authentication to completion, or until `cancel` fires
pub async fn authenticate(
    authenticator: &dyn Authenticator,
    config: &ConnectionConfig,
    session: &SessionEnv,
    cancel: CancellationToken,
) -> Result<CredentialBundle, AuthError> {
    let AuthSession {
        mut outcome,
        mut control,
    } = authenticator.launch(config, session)?;

    tokio::select! {
        result = &mut outcome => result.unwrap_or(Err(AuthError::Cancelled)),
        _ = cancel.cancelled() => {
            control.stop(StopMode::Kill);
            Err(AuthError::Cancelled)
        }
    }
}

/// Whether an exit code counts as success given the captured output
pub fn exit_accepted(code: Option<i32>, output: &str) -> bool {
    match code {
        Some(0) => true,
        Some(1..=2) => SUCCESS_PHRASES.iter().any(|phrase| output.contains(phrase)),
        _ => false,
    }
}

/// Turn a finished authenticator run into a credential bundle
pub fn evaluate(protocol: Protocol, code: Option<i32>, output: &str) -> Result<CredentialBundle, AuthError> {
    if !exit_accepted(code, output) {
        let detail = match code {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        };
        return Err(AuthError::Failed(detail));
    }

    let parsed = protocol.parse_auth_output(output);
    let cookie = parsed.cookie.filter(|c| !c.is_empty()).ok_or(AuthError::NoCookie)?;

    Ok(CredentialBundle {
        cookie: Zeroizing::new(cookie),
        username: parsed.username,
        fingerprint: parsed.fingerprint,
        usergroup: None,
        host: parsed.host,
    })
}

/// Launches the real authenticator binaries
pub struct SsoLauncher {
    tool_dir: PathBuf,
    uid_threshold: u32,
    stop_grace: Duration,
    tasks: TaskTracker,
}

impl SsoLauncher {
    pub fn new(tool_dir: PathBuf, uid_threshold: u32, stop_grace: Duration, tasks: TaskTracker) -> Self {
        Self {
            tool_dir,
            uid_threshold,
            stop_grace,
            tasks,
        }
    }
}

impl Authenticator for SsoLauncher {
    fn launch(&self, config: &ConnectionConfig, session: &SessionEnv) -> Result<AuthSession, SpawnError> {
        let spec = config.protocol.auth_command(config, &self.tool_dir);
        info!("Starting {} authenticator for {}", config.protocol, config.gateway);
        if !session.has_display() {
            warn!("No graphical display found; the login window may not appear");
        }

        let mut cmd = spec.command();
        cmd.env_clear()
            .envs(session.spawn_environment(&self.tool_dir, env::var("PATH").ok().as_deref()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if process::running_privileged() {
            match session.identity() {
                Some(identity) if identity.uid >= self.uid_threshold => {
                    process::run_as(&mut cmd, &identity)
                }
                _ => warn!("No desktop user to run the authenticator as; it may refuse to start as root"),
            }
        }

        let child = cmd
            .spawn()
            .map_err(|e| SpawnError::new(spec.program_name(), e))?;
        debug!("Authenticator pid {:?}", child.id());

        let (control, requests) = SupervisedChild::new(child.id());
        let (tx, rx) = oneshot::channel();
        self.tasks.spawn(supervise(
            child,
            config.protocol,
            requests,
            self.stop_grace,
            tx,
        ));

        Ok(AuthSession {
            outcome: rx,
            control: Box::new(control),
        })
    }
}

async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut Option<R>, buf: &mut [u8]) -> io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => Ok(0),
    }
}

/// Read what is left in `reader` until EOF or `deadline`
async fn drain<R: AsyncRead + Unpin>(
    reader: &mut Option<R>,
    buf: &mut [u8],
    captured: &mut Vec<u8>,
    deadline: Instant,
) {
    while let Ok(Ok(n)) = tokio::time::timeout_at(deadline, read_chunk(reader, buf)).await {
        if n == 0 {
            break;
        }
        captured.extend_from_slice(&buf[..n]);
    }
}

async fn supervise(
    mut child: Child,
    protocol: Protocol,
    mut stop: StopRequests,
    grace: Duration,
    reply: oneshot::Sender<Result<CredentialBundle, AuthError>>,
) {
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_open = stdout.is_some();
    let mut err_open = stderr.is_some();
    let mut out_buf = [0u8; 4096];
    let mut err_buf = [0u8; 4096];
    let mut captured = Zeroizing::new(Vec::new());

    let status = loop {
        tokio::select! {
            read = read_chunk(&mut stdout, &mut out_buf), if out_open => match read {
                Ok(0) | Err(_) => out_open = false,
                Ok(n) if !stop.cancel.is_cancelled() => captured.extend_from_slice(&out_buf[..n]),
                Ok(_) => {}
            },
            read = read_chunk(&mut stderr, &mut err_buf), if err_open => match read {
                Ok(0) | Err(_) => err_open = false,
                Ok(n) if !stop.cancel.is_cancelled() => captured.extend_from_slice(&err_buf[..n]),
                Ok(_) => {}
            },
            status = child.wait() => break status,
            mode = stop.next() => {
                process::stop_child(&mut child, mode, grace).await;
                debug!("Authenticator stopped with {:?}", mode);
                let _ = reply.send(Err(AuthError::Cancelled));
                return;
            }
        }
    };

    // Descendants such as an external browser can inherit the pipes and
    // keep them open long after the authenticator itself has exited
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    if out_open {
        drain(&mut stdout, &mut out_buf, &mut captured, deadline).await;
    }
    if err_open {
        drain(&mut stderr, &mut err_buf, &mut captured, deadline).await;
    }
    drop(stdout);
    drop(stderr);

    let result = match status {
        Ok(status) => {
            let text = Zeroizing::new(String::from_utf8_lossy(&captured).into_owned());
            debug!("Authenticator exited with {} after {} bytes of output", status, text.len());
            evaluate(protocol, status.code(), &text)
        }
        Err(e) => Err(AuthError::Io(e)),
    };

    match &result {
        Ok(bundle) => info!(
            "SSO login succeeded{}",
            bundle.username.as_deref().map(|u| format!(" for {}", u)).unwrap_or_default()
        ),
        Err(e) => error!("SSO login failed: {}", e),
    }
    let _ = reply.send(result);
}
