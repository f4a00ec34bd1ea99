//! Connection state machine
//!
//! The service owns at most one connection attempt and drives it through
//! cache lookup, SSO authentication and tunnel establishment. It runs as a
//! single task: commands from the [`ServiceHandle`] and results from the
//! collaborators arrive on channels and are handled one at a time, so the
//! attempt record needs no locking.
//!
//! ```text
//!            cache hit                       Ready
//! connect ──────────────────▶ Connecting ──────────▶ Connected
//!    │                           ▲    │                  │
//!    │ miss        SSO success   │    │ abnormal exit    │ clean exit
//!    ▼                           │    ▼                  ▼
//! Authenticating ────────────────┘  cached? ── yes ──▶ Authenticating (once)
//!    │                                 │
//!    │ SSO failure                     no
//!    ▼                                 ▼
//! Failed (LOGIN_FAILED)          Failed (CONNECT_FAILED)
//! ```
//!
//! Every asynchronous result is tagged with the ticket of the stage that
//! produced it. When a stage is replaced or torn down its ticket goes stale
//! and late results are dropped.

use crate::auth::{AuthError, AuthSession, Authenticator, CredentialBundle};
use crate::cache::{CacheClient, CacheKey, CachedCredential};
use crate::config::{ConfigError, ConnectionConfig};
use crate::process::{ChildControl, StopMode};
use crate::session::{SessionEnv, SessionResolver};
use crate::tunnel::{Ip4Config, TunnelEvent, TunnelExit, TunnelRequest, TunnelSession, TunnelSpawner};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Authenticating,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Failure causes reported upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    LoginFailed,
    ConnectFailed,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::LoginFailed => f.write_str("LOGIN_FAILED"),
            FailureReason::ConnectFailed => f.write_str("CONNECT_FAILED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    StateChanged(ConnectionState),
    Ip4Config(Ip4Config),
    Failure(FailureReason),
    /// The remote side closed an established tunnel
    Disconnected,
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid connection config: {0}")]
    Config(#[from] ConfigError),
    #[error("Connection service has stopped")]
    Stopped,
}

enum Command {
    Connect(ConnectionConfig),
    Disconnect,
    Logout,
}

/// Client side of the service
#[derive(Clone)]
pub struct ServiceHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ServiceHandle {
    pub fn connect(&self, config: ConnectionConfig) -> Result<(), ServiceError> {
        config.validate()?;
        self.send(Command::Connect(config))
    }

    /// Tear down the attempt but keep the remote session alive
    pub fn disconnect(&self) -> Result<(), ServiceError> {
        self.send(Command::Disconnect)
    }

    /// Final disconnect: end the remote session and forget the credential
    pub fn logout(&self) -> Result<(), ServiceError> {
        self.send(Command::Logout)
    }

    /// SSO replaces interactive credentials, so nothing is ever asked for
    pub fn need_secrets(&self) -> bool {
        false
    }

    fn send(&self, command: Command) -> Result<(), ServiceError> {
        self.commands.send(command).map_err(|_| ServiceError::Stopped)
    }
}

/// Everything the state machine drives
#[derive(Clone)]
pub struct Collaborators {
    pub sessions: Arc<dyn SessionResolver>,
    pub authenticator: Arc<dyn Authenticator>,
    pub tunnels: Arc<dyn TunnelSpawner>,
    pub cache: CacheClient,
}

pub struct ConnectionService;

impl ConnectionService {
    /// Start the service task on the current runtime
    pub fn spawn(collaborators: Collaborators) -> (ServiceHandle, mpsc::UnboundedReceiver<ServiceEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let engine = Engine {
            collab: collaborators,
            events: event_tx,
            internal: internal_tx,
            state: ConnectionState::Idle,
            attempt: None,
            next_ticket: 0,
        };
        tokio::spawn(engine.run(command_rx, internal_rx));

        (ServiceHandle { commands: command_tx }, event_rx)
    }
}

/// Results coming back from collaborators
enum Internal {
    Session {
        ticket: u64,
        session: SessionEnv,
    },
    Lookup {
        ticket: u64,
        record: Option<CachedCredential>,
    },
    Auth {
        ticket: u64,
        result: Result<CredentialBundle, AuthError>,
    },
    Tunnel {
        ticket: u64,
        event: TunnelEvent,
    },
}

/// State of the current connection attempt
struct Attempt {
    config: ConnectionConfig,
    key: CacheKey,
    ticket: u64,
    session: Option<SessionEnv>,
    credentials: Option<CredentialBundle>,
    using_cached: bool,
    auth: Option<Box<dyn ChildControl>>,
    tunnel: Option<Box<dyn ChildControl>>,
}

impl Attempt {
    fn stop_children(&mut self, tunnel_mode: StopMode) {
        if let Some(mut auth) = self.auth.take() {
            auth.stop(StopMode::Terminate);
        }
        if let Some(mut tunnel) = self.tunnel.take() {
            tunnel.stop(tunnel_mode);
        }
    }
}

struct Engine {
    collab: Collaborators,
    events: mpsc::UnboundedSender<ServiceEvent>,
    internal: mpsc::UnboundedSender<Internal>,
    state: ConnectionState,
    attempt: Option<Attempt>,
    next_ticket: u64,
}

impl Engine {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("Service handle dropped, shutting down");
                        if let Some(mut attempt) = self.attempt.take() {
                            attempt.stop_children(StopMode::PreserveSession);
                        }
                        break;
                    }
                },
                Some(message) = internal.recv() => self.handle_internal(message),
            }
        }
    }

    fn emit(&self, event: ServiceEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            info!("Connection state: {} -> {}", self.state, state);
            self.state = state;
            self.emit(ServiceEvent::StateChanged(state));
        }
    }

    fn ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    /// The attempt, if `ticket` is still its current stage
    fn current(&mut self, ticket: u64) -> Option<&mut Attempt> {
        match self.attempt.as_mut() {
            Some(attempt) if attempt.ticket == ticket => Some(attempt),
            _ => {
                debug!("Dropping result for stale ticket {}", ticket);
                None
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(config) => self.connect(config),
            Command::Disconnect => self.disconnect(),
            Command::Logout => self.logout(),
        }
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Session { ticket, session } => self.on_session(ticket, session),
            Internal::Lookup { ticket, record } => self.on_lookup(ticket, record),
            Internal::Auth { ticket, result } => self.on_auth(ticket, result),
            Internal::Tunnel { ticket, event } => self.on_tunnel(ticket, event),
        }
    }

    fn connect(&mut self, config: ConnectionConfig) {
        if let Some(mut previous) = self.attempt.take() {
            info!("Restarting connection to {}", config.gateway);
            previous.stop_children(StopMode::PreserveSession);
        }

        info!("Connecting to {} ({})", config.gateway, config.protocol);
        let ticket = self.ticket();
        self.attempt = Some(Attempt {
            key: CacheKey::new(config.gateway.clone(), config.protocol),
            config,
            ticket,
            session: None,
            credentials: None,
            using_cached: false,
            auth: None,
            tunnel: None,
        });

        let sessions = self.collab.sessions.clone();
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let session = match tokio::task::spawn_blocking(move || sessions.resolve()).await {
                Ok(session) => session,
                Err(e) => {
                    warn!("Session resolution panicked: {}", e);
                    SessionEnv::default()
                }
            };
            let _ = internal.send(Internal::Session { ticket, session });
        });
    }

    fn on_session(&mut self, ticket: u64, session: SessionEnv) {
        let cache = self.collab.cache.clone();
        let internal = self.internal.clone();
        let Some(attempt) = self.current(ticket) else {
            return;
        };

        if session.identity().is_none() {
            warn!("No desktop session identity found, cached credentials unavailable");
        }
        if !session.has_display() {
            warn!("No graphical session found, SSO login may not be able to open a window");
        }
        attempt.session = Some(session.clone());

        let reply = cache.lookup(session, attempt.key.clone());
        tokio::spawn(async move {
            let record = match reply.await {
                Ok(Ok(record)) => record,
                Ok(Err(e)) => {
                    warn!("Credential cache lookup failed: {}", e);
                    None
                }
                Err(_) => {
                    warn!("Credential cache lookup was dropped");
                    None
                }
            };
            let _ = internal.send(Internal::Lookup { ticket, record });
        });
    }

    fn on_lookup(&mut self, ticket: u64, record: Option<CachedCredential>) {
        let Some(attempt) = self.current(ticket) else {
            return;
        };

        match record.filter(CachedCredential::has_cookie) {
            Some(record) => {
                info!("Using cached credential for {}", attempt.key);
                attempt.using_cached = true;
                let bundle = CredentialBundle {
                    cookie: record.cookie.clone(),
                    username: record.username.clone(),
                    fingerprint: record.fingerprint.clone(),
                    usergroup: record.usergroup.clone(),
                    host: None,
                };
                self.start_tunnel(bundle);
            }
            None => self.start_auth(),
        }
    }

    fn start_auth(&mut self) {
        let ticket = self.ticket();
        self.set_state(ConnectionState::Authenticating);

        let authenticator = self.collab.authenticator.clone();
        let internal = self.internal.clone();
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        attempt.ticket = ticket;

        let session = attempt.session.clone().unwrap_or_default();
        let AuthSession { outcome, control } = match authenticator.launch(&attempt.config, &session) {
            Ok(launched) => launched,
            Err(e) => {
                error!("{}", e);
                self.fail(FailureReason::ConnectFailed);
                return;
            }
        };
        attempt.auth = Some(control);

        tokio::spawn(async move {
            let result = outcome.await.unwrap_or(Err(AuthError::Cancelled));
            let _ = internal.send(Internal::Auth { ticket, result });
        });
    }

    fn on_auth(&mut self, ticket: u64, result: Result<CredentialBundle, AuthError>) {
        let cache = self.collab.cache.clone();
        let Some(attempt) = self.current(ticket) else {
            return;
        };
        attempt.auth = None;

        match result {
            Ok(bundle) => {
                info!("SSO login to {} succeeded", attempt.key);
                if let Some(session) = attempt.session.clone() {
                    cache.store(
                        session,
                        attempt.key.clone(),
                        bundle.clone(),
                        attempt.config.cache_hours,
                    );
                }
                attempt.using_cached = false;
                self.start_tunnel(bundle);
            }
            Err(e) => {
                error!("SSO login failed: {}", e);
                self.fail(FailureReason::LoginFailed);
            }
        }
    }

    fn start_tunnel(&mut self, bundle: CredentialBundle) {
        let ticket = self.ticket();
        self.set_state(ConnectionState::Connecting);

        let tunnels = self.collab.tunnels.clone();
        let internal = self.internal.clone();
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        attempt.ticket = ticket;

        let request = TunnelRequest::new(&attempt.config, &bundle);
        attempt.credentials = Some(bundle);

        let TunnelSession { mut events, control } = match tunnels.launch(&request) {
            Ok(launched) => launched,
            Err(e) => {
                error!("{}", e);
                self.fail(FailureReason::ConnectFailed);
                return;
            }
        };
        attempt.tunnel = Some(control);

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if internal.send(Internal::Tunnel { ticket, event }).is_err() {
                    break;
                }
            }
        });
    }

    fn on_tunnel(&mut self, ticket: u64, event: TunnelEvent) {
        let cache = self.collab.cache.clone();
        let Some(attempt) = self.current(ticket) else {
            return;
        };

        match event {
            TunnelEvent::State(state) => debug!("Tunnel state: {:?}", state),
            TunnelEvent::SessionCookie { cookie, usergroup } => {
                let Some(credentials) = attempt.credentials.as_mut() else {
                    return;
                };
                credentials.cookie = cookie;
                credentials.usergroup = Some(usergroup);
                if let Some(session) = attempt.session.clone() {
                    cache.store(
                        session,
                        attempt.key.clone(),
                        credentials.clone(),
                        attempt.config.cache_hours,
                    );
                }
            }
            TunnelEvent::Ready(config) => {
                self.emit(ServiceEvent::Ip4Config(config));
                self.set_state(ConnectionState::Connected);
            }
            TunnelEvent::Exited(exit) => {
                attempt.tunnel = None;
                self.on_tunnel_exit(exit);
            }
        }
    }

    fn on_tunnel_exit(&mut self, exit: TunnelExit) {
        let cache = self.collab.cache.clone();
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };

        if exit.requested {
            debug!("Tunnel stopped on request");
            return;
        }

        if exit.is_clean() {
            info!("Tunnel to {} closed by the remote side", attempt.key);
            self.attempt = None;
            self.emit(ServiceEvent::Disconnected);
            self.set_state(ConnectionState::Idle);
            return;
        }

        if attempt.using_cached {
            warn!(
                "Tunnel exited with {:?} using a cached credential, logging in again",
                exit.code
            );
            if let Some(session) = attempt.session.clone() {
                cache.clear(session, attempt.key.clone());
            }
            attempt.credentials = None;
            attempt.using_cached = false;
            self.start_auth();
            return;
        }

        error!("Tunnel exited with {:?}", exit.code);
        self.fail(FailureReason::ConnectFailed);
    }

    fn fail(&mut self, reason: FailureReason) {
        if let Some(mut attempt) = self.attempt.take() {
            attempt.stop_children(StopMode::PreserveSession);
        }
        self.emit(ServiceEvent::Failure(reason));
        self.set_state(ConnectionState::Failed);
    }

    fn disconnect(&mut self) {
        let Some(mut attempt) = self.attempt.take() else {
            debug!("Disconnect with no active connection");
            return;
        };
        info!("Disconnecting from {}", attempt.key);
        self.set_state(ConnectionState::Disconnecting);
        attempt.stop_children(StopMode::PreserveSession);
        self.set_state(ConnectionState::Idle);
    }

    fn logout(&mut self) {
        let Some(mut attempt) = self.attempt.take() else {
            debug!("Logout with no active connection");
            return;
        };
        info!("Logging out of {}", attempt.key);
        self.set_state(ConnectionState::Disconnecting);
        attempt.stop_children(StopMode::Terminate);

        let key = attempt.key.clone();
        match attempt.session.take() {
            Some(session) => self.collab.cache.clear(session, key),
            None => {
                let sessions = self.collab.sessions.clone();
                let cache = self.collab.cache.clone();
                tokio::spawn(async move {
                    if let Ok(session) = tokio::task::spawn_blocking(move || sessions.resolve()).await {
                        cache.clear(session, key);
                    }
                });
            }
        }
        self.set_state(ConnectionState::Idle);
    }
}
