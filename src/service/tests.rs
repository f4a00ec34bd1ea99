use super::*;
use crate::cache::testing::{ManualClock, MemoryStore, bundle, session};
use crate::cache::{CacheKey, CredentialCache};
use crate::process::SpawnError;
use crate::protocol::{Protocol, globalprotect};
use crate::tunnel::TunnelState;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use zeroize::Zeroizing;

const GATEWAY: &str = "vpn.example.com";

type StopLog = Arc<Mutex<Vec<(&'static str, StopMode)>>>;

struct RecordingControl {
    label: &'static str,
    log: StopLog,
}

impl ChildControl for RecordingControl {
    fn stop(&mut self, mode: StopMode) {
        self.log.lock().unwrap().push((self.label, mode));
    }
}

struct FixedSession;

impl SessionResolver for FixedSession {
    fn resolve(&self) -> SessionEnv {
        session()
    }
}

enum AuthPlan {
    Succeed(&'static str),
    SucceedWith(CredentialBundle),
    Fail,
    Hang,
}

struct FakeAuthenticator {
    plans: Mutex<VecDeque<AuthPlan>>,
    launches: AtomicUsize,
    pending: Mutex<Vec<oneshot::Sender<Result<CredentialBundle, AuthError>>>>,
    log: StopLog,
}

impl Authenticator for FakeAuthenticator {
    fn launch(&self, _config: &ConnectionConfig, _session: &SessionEnv) -> Result<AuthSession, SpawnError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        match self.plans.lock().unwrap().pop_front().unwrap_or(AuthPlan::Fail) {
            AuthPlan::Succeed(cookie) => {
                let _ = tx.send(Ok(bundle(cookie)));
            }
            AuthPlan::SucceedWith(credentials) => {
                let _ = tx.send(Ok(credentials));
            }
            AuthPlan::Fail => {
                let _ = tx.send(Err(AuthError::Failed("exit status 3".to_string())));
            }
            AuthPlan::Hang => self.pending.lock().unwrap().push(tx),
        }
        Ok(AuthSession {
            outcome: rx,
            control: Box::new(RecordingControl {
                label: "auth",
                log: self.log.clone(),
            }),
        })
    }
}

enum TunnelPlan {
    Connects,
    Exits(i32),
    ConnectsThenExits(i32),
    IssuesSessionCookie(&'static str),
}

struct FakeTunnels {
    plans: Mutex<VecDeque<TunnelPlan>>,
    requests: Mutex<Vec<TunnelRequest>>,
    open: Mutex<Vec<mpsc::UnboundedSender<TunnelEvent>>>,
    log: StopLog,
}

fn ready() -> Ip4Config {
    Ip4Config {
        tundev: "tun0".to_string(),
        address: Some(Ipv4Addr::new(192, 168, 5, 20)),
        prefix: Some(32),
        gateway: Some(Ipv4Addr::new(10, 0, 0, 1)),
        dns: vec![],
    }
}

fn exited(code: i32) -> TunnelEvent {
    TunnelEvent::Exited(TunnelExit {
        code: Some(code),
        requested: false,
    })
}

impl TunnelSpawner for FakeTunnels {
    fn launch(&self, request: &TunnelRequest) -> Result<TunnelSession, SpawnError> {
        self.requests.lock().unwrap().push(request.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(TunnelEvent::State(TunnelState::Starting));

        match self.plans.lock().unwrap().pop_front().unwrap_or(TunnelPlan::Exits(1)) {
            TunnelPlan::Connects => {
                let _ = tx.send(TunnelEvent::State(TunnelState::Connected));
                let _ = tx.send(TunnelEvent::Ready(ready()));
            }
            TunnelPlan::Exits(code) => {
                let _ = tx.send(exited(code));
            }
            TunnelPlan::ConnectsThenExits(code) => {
                let _ = tx.send(TunnelEvent::Ready(ready()));
                let _ = tx.send(exited(code));
            }
            TunnelPlan::IssuesSessionCookie(cookie) => {
                let _ = tx.send(TunnelEvent::SessionCookie {
                    cookie: Zeroizing::new(cookie.to_string()),
                    usergroup: globalprotect::SESSION_USERGROUP.to_string(),
                });
                let _ = tx.send(TunnelEvent::Ready(ready()));
            }
        }
        self.open.lock().unwrap().push(tx);

        Ok(TunnelSession {
            events: rx,
            control: Box::new(RecordingControl {
                label: "tunnel",
                log: self.log.clone(),
            }),
        })
    }
}

struct Harness {
    handle: ServiceHandle,
    events: mpsc::UnboundedReceiver<ServiceEvent>,
    auth: Arc<FakeAuthenticator>,
    tunnels: Arc<FakeTunnels>,
    cache: CacheClient,
    log: StopLog,
}

fn harness(cached: Option<&str>, auth: Vec<AuthPlan>, tunnels: Vec<TunnelPlan>) -> Harness {
    harness_for(&key(), cached.map(bundle), auth, tunnels)
}

fn harness_for(
    key: &CacheKey,
    cached: Option<CredentialBundle>,
    auth: Vec<AuthPlan>,
    tunnels: Vec<TunnelPlan>,
) -> Harness {
    let store = MemoryStore::default();
    let cache = CredentialCache::new(Box::new(store), ManualClock::at(1_700_000_000), 8);
    if let Some(credentials) = cached {
        cache.store(&session(), key, &credentials, 0).unwrap();
    }
    let cache = CacheClient::spawn(Arc::new(cache));

    let log = StopLog::default();
    let auth = Arc::new(FakeAuthenticator {
        plans: Mutex::new(auth.into()),
        launches: AtomicUsize::new(0),
        pending: Mutex::new(Vec::new()),
        log: log.clone(),
    });
    let tunnels = Arc::new(FakeTunnels {
        plans: Mutex::new(tunnels.into()),
        requests: Mutex::new(Vec::new()),
        open: Mutex::new(Vec::new()),
        log: log.clone(),
    });

    let (handle, events) = ConnectionService::spawn(Collaborators {
        sessions: Arc::new(FixedSession),
        authenticator: auth.clone(),
        tunnels: tunnels.clone(),
        cache: cache.clone(),
    });

    Harness {
        handle,
        events,
        auth,
        tunnels,
        cache,
        log,
    }
}

fn key() -> CacheKey {
    CacheKey::new(GATEWAY, Protocol::GlobalProtect)
}

fn config() -> ConnectionConfig {
    ConnectionConfig::new(GATEWAY, Protocol::GlobalProtect)
}

impl Harness {
    /// Collect events up to and including the first one matching `done`
    async fn until(&mut self, done: impl Fn(&ServiceEvent) -> bool) -> Vec<ServiceEvent> {
        let mut seen = Vec::new();
        loop {
            let event = timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("timed out waiting for service event")
                .expect("service stopped");
            let finished = done(&event);
            seen.push(event);
            if finished {
                return seen;
            }
        }
    }

    async fn cached_cookie(&self) -> Option<String> {
        self.cache
            .lookup(session(), key())
            .await
            .unwrap()
            .unwrap()
            .map(|record| record.cookie.to_string())
    }

    fn auth_launches(&self) -> usize {
        self.auth.launches.load(Ordering::SeqCst)
    }

    fn tunnel_fingerprints(&self) -> Vec<Option<String>> {
        self.tunnels
            .requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.fingerprint.clone())
            .collect()
    }

    fn tunnel_cookies(&self) -> Vec<String> {
        self.tunnels
            .requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.cookie.to_string())
            .collect()
    }

    fn stops(&self) -> Vec<(&'static str, StopMode)> {
        self.log.lock().unwrap().clone()
    }
}

fn anyconnect_key() -> CacheKey {
    CacheKey::new(GATEWAY, Protocol::AnyConnect)
}

/// What openconnect-sso reports for an ASA login
fn anyconnect_bundle(cookie: &str) -> CredentialBundle {
    CredentialBundle {
        fingerprint: Some("pin-sha256:abc".to_string()),
        host: Some(format!("https://{}/", GATEWAY)),
        ..bundle(cookie)
    }
}

fn is_config(event: &ServiceEvent) -> bool {
    matches!(event, ServiceEvent::Ip4Config(_))
}

fn is_state(state: ConnectionState) -> impl Fn(&ServiceEvent) -> bool {
    move |event| *event == ServiceEvent::StateChanged(state)
}

fn is_failure(event: &ServiceEvent) -> bool {
    matches!(event, ServiceEvent::Failure(_))
}

#[tokio::test]
async fn test_cache_hit_skips_sso() {
    let mut h = harness(Some("cached-cookie"), vec![], vec![TunnelPlan::Connects]);
    h.handle.connect(config()).unwrap();

    let events = h.until(is_state(ConnectionState::Connected)).await;
    assert!(!events.contains(&ServiceEvent::StateChanged(ConnectionState::Authenticating)));
    assert!(events.contains(&ServiceEvent::Ip4Config(ready())));
    assert_eq!(h.auth_launches(), 0);
    assert_eq!(h.tunnel_cookies(), vec!["cached-cookie"]);
}

#[tokio::test]
async fn test_cache_miss_runs_sso_and_stores() {
    let mut h = harness(None, vec![AuthPlan::Succeed("fresh")], vec![TunnelPlan::Connects]);
    h.handle.connect(config()).unwrap();

    let events = h.until(is_config).await;
    assert_eq!(
        &events[..2],
        &[
            ServiceEvent::StateChanged(ConnectionState::Authenticating),
            ServiceEvent::StateChanged(ConnectionState::Connecting),
        ]
    );
    assert_eq!(h.auth_launches(), 1);
    assert_eq!(h.tunnel_cookies(), vec!["fresh"]);
    assert_eq!(h.cached_cookie().await.as_deref(), Some("fresh"));
}

#[tokio::test]
async fn test_stale_cache_falls_back_to_sso() {
    let mut h = harness(
        Some("stale"),
        vec![AuthPlan::Succeed("fresh")],
        vec![TunnelPlan::Exits(1), TunnelPlan::Connects],
    );
    h.handle.connect(config()).unwrap();

    let events = h.until(is_config).await;
    assert!(events.contains(&ServiceEvent::StateChanged(ConnectionState::Authenticating)));
    assert!(!events.iter().any(is_failure));
    assert_eq!(h.auth_launches(), 1);
    assert_eq!(h.tunnel_cookies(), vec!["stale", "fresh"]);
    assert_eq!(h.cached_cookie().await.as_deref(), Some("fresh"));
}

#[tokio::test]
async fn test_stale_fallback_happens_once() {
    let mut h = harness(
        Some("stale"),
        vec![AuthPlan::Succeed("fresh")],
        vec![TunnelPlan::Exits(1), TunnelPlan::Exits(1)],
    );
    h.handle.connect(config()).unwrap();

    let events = h.until(is_failure).await;
    assert_eq!(
        events.last(),
        Some(&ServiceEvent::Failure(FailureReason::ConnectFailed))
    );
    assert_eq!(h.auth_launches(), 1);
    assert_eq!(h.tunnel_cookies().len(), 2);
    h.until(is_state(ConnectionState::Failed)).await;
}

#[tokio::test]
async fn test_tunnel_failure_without_cache_is_connect_failed() {
    let mut h = harness(None, vec![AuthPlan::Succeed("fresh")], vec![TunnelPlan::Exits(2)]);
    h.handle.connect(config()).unwrap();

    let events = h.until(is_failure).await;
    assert_eq!(
        events.last(),
        Some(&ServiceEvent::Failure(FailureReason::ConnectFailed))
    );
    assert_eq!(h.auth_launches(), 1);
}

#[tokio::test]
async fn test_sso_failure_is_login_failed() {
    let mut h = harness(None, vec![AuthPlan::Fail], vec![]);
    h.handle.connect(config()).unwrap();

    let events = h.until(is_failure).await;
    assert_eq!(
        events.last(),
        Some(&ServiceEvent::Failure(FailureReason::LoginFailed))
    );
    assert!(h.tunnel_cookies().is_empty());
    assert_eq!(h.cached_cookie().await, None);
}

#[tokio::test]
async fn test_disconnect_preserves_tunnel_session() {
    let mut h = harness(Some("cached"), vec![], vec![TunnelPlan::Connects]);
    h.handle.connect(config()).unwrap();
    h.until(is_state(ConnectionState::Connected)).await;

    h.handle.disconnect().unwrap();
    let events = h.until(is_state(ConnectionState::Idle)).await;
    assert_eq!(
        events,
        vec![
            ServiceEvent::StateChanged(ConnectionState::Disconnecting),
            ServiceEvent::StateChanged(ConnectionState::Idle),
        ]
    );
    assert_eq!(h.stops(), vec![("tunnel", StopMode::PreserveSession)]);
    assert_eq!(h.cached_cookie().await.as_deref(), Some("cached"));
}

#[tokio::test]
async fn test_disconnect_terminates_sso() {
    let mut h = harness(None, vec![AuthPlan::Hang], vec![]);
    h.handle.connect(config()).unwrap();
    h.until(is_state(ConnectionState::Authenticating)).await;

    h.handle.disconnect().unwrap();
    h.until(is_state(ConnectionState::Idle)).await;
    assert_eq!(h.stops(), vec![("auth", StopMode::Terminate)]);
}

#[tokio::test]
async fn test_logout_terminates_and_clears_cache() {
    let mut h = harness(Some("cached"), vec![], vec![TunnelPlan::Connects]);
    h.handle.connect(config()).unwrap();
    h.until(is_state(ConnectionState::Connected)).await;

    h.handle.logout().unwrap();
    h.until(is_state(ConnectionState::Idle)).await;
    assert_eq!(h.stops(), vec![("tunnel", StopMode::Terminate)]);
    assert_eq!(h.cached_cookie().await, None);
}

#[tokio::test]
async fn test_clean_exit_reports_disconnect() {
    let mut h = harness(Some("cached"), vec![], vec![TunnelPlan::ConnectsThenExits(0)]);
    h.handle.connect(config()).unwrap();

    let events = h.until(is_state(ConnectionState::Idle)).await;
    assert!(events.contains(&ServiceEvent::Disconnected));
    assert!(!events.iter().any(is_failure));
    assert_eq!(h.auth_launches(), 0);
}

#[tokio::test]
async fn test_session_cookie_replaces_cached_cookie() {
    let mut h = harness(
        None,
        vec![AuthPlan::Succeed("prelogin")],
        vec![TunnelPlan::IssuesSessionCookie("long-lived")],
    );
    h.handle.connect(config()).unwrap();
    h.until(is_config).await;

    let record = h
        .cache
        .lookup(session(), key())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(record.cookie.as_str(), "long-lived");
    assert_eq!(record.usergroup.as_deref(), Some(globalprotect::SESSION_USERGROUP));
}

#[tokio::test]
async fn test_cached_usergroup_reaches_tunnel() {
    let mut h = harness(None, vec![AuthPlan::Succeed("prelogin")], vec![
        TunnelPlan::IssuesSessionCookie("long-lived"),
        TunnelPlan::Connects,
    ]);
    h.handle.connect(config()).unwrap();
    h.until(is_config).await;
    h.handle.disconnect().unwrap();
    h.until(is_state(ConnectionState::Idle)).await;

    h.handle.connect(config()).unwrap();
    h.until(is_state(ConnectionState::Connected)).await;
    let requests = h.tunnels.requests.lock().unwrap();
    assert_eq!(requests[1].cookie.as_str(), "long-lived");
    assert_eq!(requests[1].usergroup.as_deref(), Some(globalprotect::SESSION_USERGROUP));
    assert_eq!(h.auth_launches(), 1);
}

#[tokio::test]
async fn test_reconnect_restarts_active_attempt() {
    let mut h = harness(Some("cached"), vec![], vec![TunnelPlan::Connects, TunnelPlan::Connects]);
    h.handle.connect(config()).unwrap();
    h.until(is_state(ConnectionState::Connected)).await;

    h.handle.connect(config()).unwrap();
    h.until(is_config).await;
    assert_eq!(h.stops(), vec![("tunnel", StopMode::PreserveSession)]);
    assert_eq!(h.tunnel_cookies().len(), 2);
}

#[tokio::test]
async fn test_empty_gateway_is_rejected() {
    let h = harness(None, vec![], vec![]);
    let result = h.handle.connect(ConnectionConfig::new("  ", Protocol::AnyConnect));
    assert!(matches!(
        result,
        Err(ServiceError::Config(ConfigError::MissingGateway))
    ));
}

#[tokio::test]
async fn test_no_secrets_needed() {
    let h = harness(None, vec![], vec![]);
    assert!(!h.handle.need_secrets());
}

#[test]
fn test_failure_reason_display() {
    assert_eq!(FailureReason::LoginFailed.to_string(), "LOGIN_FAILED");
    assert_eq!(FailureReason::ConnectFailed.to_string(), "CONNECT_FAILED");
    assert_eq!(ConnectionState::Authenticating.to_string(), "authenticating");
}

#[tokio::test]
async fn test_anyconnect_login_pins_server_certificate() {
    let mut h = harness_for(
        &anyconnect_key(),
        None,
        vec![AuthPlan::SucceedWith(anyconnect_bundle("asa-cookie"))],
        vec![TunnelPlan::Connects],
    );
    h.handle
        .connect(ConnectionConfig::new(GATEWAY, Protocol::AnyConnect))
        .unwrap();

    h.until(is_config).await;
    assert_eq!(h.tunnel_cookies(), vec!["asa-cookie"]);
    assert_eq!(h.tunnel_fingerprints(), vec![Some("pin-sha256:abc".to_string())]);

    let record = h
        .cache
        .lookup(session(), anyconnect_key())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(record.fingerprint.as_deref(), Some("pin-sha256:abc"));
}

#[tokio::test]
async fn test_anyconnect_cache_hit_restores_fingerprint() {
    let mut h = harness_for(
        &anyconnect_key(),
        Some(anyconnect_bundle("cached-asa")),
        vec![],
        vec![TunnelPlan::Connects],
    );
    h.handle
        .connect(ConnectionConfig::new(GATEWAY, Protocol::AnyConnect))
        .unwrap();

    h.until(is_state(ConnectionState::Connected)).await;
    assert_eq!(h.auth_launches(), 0);
    assert_eq!(h.tunnel_cookies(), vec!["cached-asa"]);
    assert_eq!(h.tunnel_fingerprints(), vec![Some("pin-sha256:abc".to_string())]);
}
