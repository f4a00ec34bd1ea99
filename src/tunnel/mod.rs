//! Tunnel launcher
//!
//! Starts openconnect with the SSO cookie on stdin and turns its output
//! into [`TunnelEvent`]s. The IPv4 configuration is published only after
//! the "Configured as" line and once the tunnel device shows up under
//! `/sys/class/net`, polled at a fixed interval for a bounded number of
//! attempts. When the device never appears the facts are published anyway.

pub mod monitor;

pub use monitor::{OutputMonitor, TunnelFacts, TunnelState};

use crate::auth::CredentialBundle;
use crate::config::{ConnectionConfig, ServiceSettings};
use crate::process::{self, ChildControl, SpawnError, StopMode, StopRequests, SupervisedChild};
use crate::protocol::{Protocol, globalprotect};
use monitor::Observation;
use serde::Serialize;
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, interval_at, timeout};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Device name published when the output never named one
pub const DEFAULT_TUNDEV: &str = "tun0";

const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Everything needed to start a tunnel
#[derive(Clone)]
pub struct TunnelRequest {
    pub protocol: Protocol,
    pub gateway: String,
    pub username: Option<String>,
    pub cookie: Zeroizing<String>,
    pub fingerprint: Option<String>,
    pub usergroup: Option<String>,
    pub extra_args: Vec<String>,
}

impl fmt::Debug for TunnelRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelRequest")
            .field("protocol", &self.protocol)
            .field("gateway", &self.gateway)
            .field("username", &self.username)
            .field("fingerprint", &self.fingerprint)
            .field("usergroup", &self.usergroup)
            .field("extra_args", &self.extra_args)
            .finish_non_exhaustive()
    }
}

impl TunnelRequest {
    /// Configured username wins over the one the login reported; a
    /// usergroup carried by the credentials wins over the configured one.
    pub fn new(config: &ConnectionConfig, bundle: &CredentialBundle) -> Self {
        Self {
            protocol: config.protocol,
            gateway: config.gateway.clone(),
            username: config.username.clone().or_else(|| bundle.username.clone()),
            cookie: bundle.cookie.clone(),
            fingerprint: bundle.fingerprint.clone(),
            usergroup: bundle.usergroup.clone().or_else(|| config.usergroup.clone()),
            extra_args: config.extra_args(),
        }
    }
}

/// IPv4 configuration published upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ip4Config {
    pub tundev: String,
    pub address: Option<Ipv4Addr>,
    pub prefix: Option<u32>,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Vec<Ipv4Addr>,
}

/// Value types of the published key/value map
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Ip4Value {
    Str(String),
    U32(u32),
    U32Array(Vec<u32>),
}

impl Ip4Config {
    pub fn from_facts(facts: &TunnelFacts) -> Self {
        Self {
            tundev: facts
                .device
                .clone()
                .unwrap_or_else(|| DEFAULT_TUNDEV.to_string()),
            address: facts.address,
            prefix: facts.address.map(|_| 32),
            gateway: facts.peer,
            dns: facts.dns.clone(),
        }
    }

    /// Address packed the way `inet_pton` lays it out in memory
    pub fn pack(addr: Ipv4Addr) -> u32 {
        u32::from_ne_bytes(addr.octets())
    }

    pub fn to_map(&self) -> BTreeMap<&'static str, Ip4Value> {
        let mut map = BTreeMap::new();
        map.insert("tundev", Ip4Value::Str(self.tundev.clone()));
        if let Some(address) = self.address {
            map.insert("address", Ip4Value::U32(Self::pack(address)));
            map.insert("prefix", Ip4Value::U32(self.prefix.unwrap_or(32)));
        }
        if let Some(gateway) = self.gateway {
            map.insert("gateway", Ip4Value::U32(Self::pack(gateway)));
        }
        if !self.dns.is_empty() {
            map.insert(
                "dns",
                Ip4Value::U32Array(self.dns.iter().copied().map(Self::pack).collect()),
            );
        }
        map
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelExit {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    /// Whether the exit followed a stop request
    pub requested: bool,
}

impl TunnelExit {
    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug)]
pub enum TunnelEvent {
    State(TunnelState),
    /// A cookie that supersedes the one the tunnel was started with
    SessionCookie {
        cookie: Zeroizing<String>,
        usergroup: String,
    },
    Ready(Ip4Config),
    Exited(TunnelExit),
}

/// A running tunnel
pub struct TunnelSession {
    pub events: mpsc::UnboundedReceiver<TunnelEvent>,
    pub control: Box<dyn ChildControl>,
}

/// Starts tunnel subprocesses
pub trait TunnelSpawner: Send + Sync {
    fn launch(&self, request: &TunnelRequest) -> Result<TunnelSession, SpawnError>;
}

/// Checks whether a network device exists
#[derive(Debug, Clone)]
pub struct DeviceProbe {
    root: PathBuf,
}

impl DeviceProbe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn exists(&self, device: &str) -> bool {
        self.root.join(device).is_dir()
    }
}

impl Default for DeviceProbe {
    fn default() -> Self {
        Self::new("/sys/class/net")
    }
}

/// Device poll cadence
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub attempts: u32,
}

/// Launches openconnect
pub struct TunnelLauncher {
    openconnect: PathBuf,
    tool_dir: PathBuf,
    probe: DeviceProbe,
    poll: PollPolicy,
    stop_grace: Duration,
    tasks: TaskTracker,
}

impl TunnelLauncher {
    pub fn new(settings: &ServiceSettings, tasks: TaskTracker) -> Self {
        Self {
            openconnect: settings.openconnect.clone(),
            tool_dir: settings.tool_dir.clone(),
            probe: DeviceProbe::default(),
            poll: PollPolicy {
                interval: Duration::from_millis(settings.device_poll_interval_ms),
                attempts: settings.device_poll_attempts,
            },
            stop_grace: Duration::from_secs(settings.stop_grace_secs),
            tasks,
        }
    }

    pub fn with_probe(mut self, probe: DeviceProbe) -> Self {
        self.probe = probe;
        self
    }

    fn search_path(&self) -> String {
        let inherited = env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string());
        format!("{}:{}", self.tool_dir.display(), inherited)
    }
}

impl TunnelSpawner for TunnelLauncher {
    fn launch(&self, request: &TunnelRequest) -> Result<TunnelSession, SpawnError> {
        let spec = request.protocol.tunnel_command(&self.openconnect, request);
        info!("Starting {} tunnel to {}", request.protocol, request.gateway);
        debug!("Tunnel arguments: {:?}", spec.args);

        let mut cmd = spec.command();
        cmd.env("PATH", self.search_path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| SpawnError::new(spec.program_name(), e))?;
        debug!("Tunnel pid {:?}", child.id());

        let (control, requests) = SupervisedChild::new(child.id());
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor {
            monitor: OutputMonitor::new(request.protocol, request.cookie.clone()),
            probe: self.probe.clone(),
            poll: self.poll,
            grace: self.stop_grace,
            events: tx,
        };
        self.tasks
            .spawn(supervisor.run(child, request.cookie.clone(), requests));

        Ok(TunnelSession {
            events: rx,
            control: Box::new(control),
        })
    }
}

type OutputLines<R> = Option<Lines<BufReader<R>>>;

async fn next_line<R: tokio::io::AsyncRead + Unpin>(lines: &mut OutputLines<R>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => None,
    }
}

async fn tick(poll: &mut Option<Interval>) {
    match poll {
        Some(poll) => {
            poll.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Lines that may carry a secret are not logged verbatim
fn loggable(line: &str) -> &str {
    if line.to_ascii_lowercase().contains("cookie") {
        "<line with cookie omitted>"
    } else {
        line
    }
}

struct Supervisor {
    monitor: OutputMonitor,
    probe: DeviceProbe,
    poll: PollPolicy,
    grace: Duration,
    events: mpsc::UnboundedSender<TunnelEvent>,
}

impl Supervisor {
    fn emit(&self, event: TunnelEvent) {
        let _ = self.events.send(event);
    }

    async fn run(mut self, mut child: Child, cookie: Zeroizing<String>, mut stop: StopRequests) {
        self.emit(TunnelEvent::State(TunnelState::Starting));

        if let Err(e) = write_secret(&mut child, &cookie).await {
            warn!("Failed to pass the cookie to openconnect: {}", e);
            let status = process::stop_child(&mut child, StopMode::Kill, self.grace).await;
            self.finish(status.and_then(|s| s.code()), false);
            return;
        }
        drop(cookie);

        let mut stdout: OutputLines<ChildStdout> = child.stdout.take().map(|s| BufReader::new(s).lines());
        let mut stderr: OutputLines<ChildStderr> = child.stderr.take().map(|s| BufReader::new(s).lines());
        let mut out_open = stdout.is_some();
        let mut err_open = stderr.is_some();
        let mut poll: Option<Interval> = None;
        let mut attempts = 0u32;

        loop {
            tokio::select! {
                line = next_line(&mut stdout), if out_open => match line {
                    Some(line) if !stop.cancel.is_cancelled() => self.handle_line(&line, &mut poll),
                    Some(_) => {}
                    None => out_open = false,
                },
                line = next_line(&mut stderr), if err_open => match line {
                    Some(line) if !stop.cancel.is_cancelled() => self.handle_line(&line, &mut poll),
                    Some(_) => {}
                    None => err_open = false,
                },
                _ = tick(&mut poll), if poll.is_some() => {
                    attempts += 1;
                    if self.poll_device(attempts) {
                        poll = None;
                    }
                }
                mode = stop.next() => {
                    info!("Stopping tunnel with {:?}", mode);
                    self.emit(TunnelEvent::State(TunnelState::Disconnecting));
                    let status = process::stop_child(&mut child, mode, self.grace).await;
                    self.finish(status.and_then(|s| s.code()), true);
                    return;
                }
                status = child.wait() => {
                    self.drain(&mut stdout, &stop).await;
                    self.drain(&mut stderr, &stop).await;
                    let code = match status {
                        Ok(status) => {
                            info!("openconnect exited with {}", status);
                            status.code()
                        }
                        Err(e) => {
                            warn!("Failed to wait for openconnect: {}", e);
                            None
                        }
                    };
                    self.finish(code, false);
                    return;
                }
            }
        }
    }

    fn handle_line(&mut self, line: &str, poll: &mut Option<Interval>) {
        debug!("openconnect: {}", loggable(line));

        for observation in self.monitor.observe(line) {
            match observation {
                Observation::State(state) => self.emit(TunnelEvent::State(state)),
                Observation::SessionCookie(cookie) => {
                    info!("Tunnel issued a long-lived session cookie");
                    self.emit(TunnelEvent::SessionCookie {
                        cookie,
                        usergroup: globalprotect::SESSION_USERGROUP.to_string(),
                    });
                }
                Observation::Configured => {
                    if self.device_present() {
                        self.publish();
                    } else {
                        debug!("Waiting for the tunnel device to appear");
                        let start = Instant::now() + self.poll.interval;
                        *poll = Some(interval_at(start, self.poll.interval));
                    }
                }
            }
        }
    }

    fn device_name(&self) -> String {
        self.monitor
            .facts()
            .device
            .clone()
            .unwrap_or_else(|| DEFAULT_TUNDEV.to_string())
    }

    fn device_present(&self) -> bool {
        self.probe.exists(&self.device_name())
    }

    /// Returns true once polling is over
    fn poll_device(&self, attempts: u32) -> bool {
        if self.device_present() {
            self.publish();
            return true;
        }
        if attempts >= self.poll.attempts {
            warn!(
                "Device {} did not appear after {} checks, publishing anyway",
                self.device_name(),
                attempts
            );
            self.publish();
            return true;
        }
        false
    }

    fn publish(&self) {
        let config = self.monitor.ip4_config();
        info!(
            "Tunnel ready on {} (address {:?}, peer {:?}, {} DNS servers)",
            config.tundev,
            config.address,
            config.gateway,
            config.dns.len()
        );
        self.emit(TunnelEvent::Ready(config));
    }

    /// Read whatever output is still buffered after exit
    async fn drain<R: tokio::io::AsyncRead + Unpin>(&mut self, lines: &mut OutputLines<R>, stop: &StopRequests) {
        let mut ignored = None;
        while let Ok(Some(line)) = timeout(DRAIN_TIMEOUT, next_line(lines)).await {
            if !stop.cancel.is_cancelled() {
                self.handle_line(&line, &mut ignored);
            }
        }
    }

    fn finish(&mut self, code: Option<i32>, requested: bool) {
        let state = if requested || code == Some(0) {
            TunnelState::Idle
        } else {
            TunnelState::Failed
        };
        if let Some(Observation::State(state)) = self.monitor.set_state(state) {
            self.emit(TunnelEvent::State(state));
        }
        self.emit(TunnelEvent::Exited(TunnelExit { code, requested }));
    }
}

async fn write_secret(child: &mut Child, cookie: &str) -> std::io::Result<()> {
    let Some(mut stdin) = child.stdin.take() else {
        return Ok(());
    };
    let line = Zeroizing::new(format!("{}\n", cookie));
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn facts() -> TunnelFacts {
        TunnelFacts {
            device: Some("tun3".to_string()),
            address: Some(Ipv4Addr::new(192, 168, 5, 20)),
            peer: Some(Ipv4Addr::new(10, 0, 0, 1)),
            dns: vec![Ipv4Addr::new(10, 0, 0, 53)],
        }
    }

    #[test]
    fn test_ip4_config_map() {
        let map = Ip4Config::from_facts(&facts()).to_map();
        assert_eq!(map["tundev"], Ip4Value::Str("tun3".to_string()));
        assert_eq!(
            map["address"],
            Ip4Value::U32(u32::from_ne_bytes([192, 168, 5, 20]))
        );
        assert_eq!(map["prefix"], Ip4Value::U32(32));
        assert_eq!(map["gateway"], Ip4Value::U32(u32::from_ne_bytes([10, 0, 0, 1])));
        assert_eq!(
            map["dns"],
            Ip4Value::U32Array(vec![u32::from_ne_bytes([10, 0, 0, 53])])
        );
    }

    #[test]
    fn test_ip4_config_defaults() {
        let map = Ip4Config::from_facts(&TunnelFacts::default()).to_map();
        assert_eq!(map.len(), 1);
        assert_eq!(map["tundev"], Ip4Value::Str(DEFAULT_TUNDEV.to_string()));
    }

    #[test]
    fn test_ip4_map_serializes_flat() {
        let json = serde_json::to_value(Ip4Config::from_facts(&facts()).to_map()).unwrap();
        assert_eq!(json["tundev"], "tun3");
        assert_eq!(json["prefix"], 32);
        assert!(json["dns"].is_array());
    }

    #[test]
    fn test_request_from_config() {
        let mut config = ConnectionConfig::new("vpn.example.com", Protocol::GlobalProtect);
        config.extra_args = Some("--no-dtls --timestamp".to_string());
        config.usergroup = Some("gateway".to_string());
        let request = TunnelRequest::new(&config, &bundle("c"));
        assert_eq!(request.extra_args, vec!["--no-dtls", "--timestamp"]);
        assert_eq!(request.usergroup.as_deref(), Some("gateway"));
        assert_eq!(request.username.as_deref(), Some("reported"));
        assert_eq!(request.fingerprint.as_deref(), Some("pin-sha256:abc"));
        assert!(!format!("{:?}", request).contains("cookie: "));

        let mut issued = bundle("c");
        issued.usergroup = Some(globalprotect::SESSION_USERGROUP.to_string());
        config.username = Some("configured".to_string());
        let request = TunnelRequest::new(&config, &issued);
        assert_eq!(request.usergroup.as_deref(), Some(globalprotect::SESSION_USERGROUP));
        assert_eq!(request.username.as_deref(), Some("configured"));
    }

    #[test]
    fn test_device_probe() {
        let root = tempfile::tempdir().unwrap();
        let probe = DeviceProbe::new(root.path());
        assert!(!probe.exists("tun0"));
        std::fs::create_dir(root.path().join("tun0")).unwrap();
        assert!(probe.exists("tun0"));
    }

    #[test]
    fn test_loggable_hides_cookies() {
        assert_eq!(loggable("Connected to 10.0.0.1:443"), "Connected to 10.0.0.1:443");
        assert_eq!(
            loggable("portal-userauthcookie=abc"),
            "<line with cookie omitted>"
        );
    }

    /// A stand-in openconnect: echoes stdin to a file, prints status lines
    fn fake_openconnect(dir: &Path, body: &str) -> ServiceSettings {
        let path = dir.join("openconnect");
        std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        ServiceSettings {
            openconnect: path,
            tool_dir: dir.to_path_buf(),
            device_poll_interval_ms: 10,
            device_poll_attempts: 3,
            stop_grace_secs: 2,
            ..ServiceSettings::default()
        }
    }

    async fn collect_until_exit(session: &mut TunnelSession) -> Vec<TunnelEvent> {
        let mut events = Vec::new();
        while let Some(event) = timeout(Duration::from_secs(10), session.events.recv())
            .await
            .expect("tunnel events timed out")
        {
            let done = matches!(event, TunnelEvent::Exited(_));
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    fn bundle(cookie: &str) -> CredentialBundle {
        CredentialBundle {
            cookie: Zeroizing::new(cookie.to_string()),
            username: Some("reported".to_string()),
            fingerprint: Some("pin-sha256:abc".to_string()),
            usergroup: None,
            host: None,
        }
    }

    fn request() -> TunnelRequest {
        TunnelRequest::new(
            &ConnectionConfig::new("vpn.example.com", Protocol::GlobalProtect),
            &bundle("prelogin"),
        )
    }

    #[tokio::test]
    async fn test_launch_publishes_after_configured() {
        let dir = tempfile::tempdir().unwrap();
        let settings = fake_openconnect(
            dir.path(),
            "read secret\n\
             echo \"$secret\" > \"$(dirname \"$0\")/stdin.txt\"\n\
             echo 'Connected to 10.0.0.1:443'\n\
             echo 'Received DNS server address 10.0.0.53' >&2\n\
             echo 'Configured as 192.168.5.20, with SSL connected'\n\
             echo 'Using tun7 device'\n\
             sleep 0.5\n\
             exit 1\n",
        );
        let launcher = TunnelLauncher::new(&settings, TaskTracker::new())
            .with_probe(DeviceProbe::new(dir.path().join("net")));

        let mut session = launcher.launch(&request()).unwrap();
        let events = collect_until_exit(&mut session).await;

        let ready = events
            .iter()
            .find_map(|e| match e {
                TunnelEvent::Ready(config) => Some(config.clone()),
                _ => None,
            })
            .expect("tunnel should publish after polling gives up");
        assert_eq!(ready.address, Some(Ipv4Addr::new(192, 168, 5, 20)));
        assert_eq!(ready.gateway, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(ready.tundev, "tun7");
        assert_eq!(ready.dns, vec![Ipv4Addr::new(10, 0, 0, 53)]);

        assert!(matches!(
            events.last(),
            Some(TunnelEvent::Exited(TunnelExit { code: Some(1), requested: false }))
        ));
        let written = std::fs::read_to_string(dir.path().join("stdin.txt")).unwrap();
        assert_eq!(written.trim(), "prelogin");
    }

    #[tokio::test]
    async fn test_stop_preserve_session_sends_hangup() {
        let dir = tempfile::tempdir().unwrap();
        let settings = fake_openconnect(
            dir.path(),
            "trap 'echo hup > \"$(dirname \"$0\")/signal.txt\"; exit 0' HUP\n\
             read secret\n\
             echo 'Configured as 10.9.9.9'\n\
             while true; do sleep 0.1; done\n",
        );
        let net = dir.path().join("net");
        std::fs::create_dir_all(net.join("tun0")).unwrap();
        let launcher = TunnelLauncher::new(&settings, TaskTracker::new()).with_probe(DeviceProbe::new(&net));

        let mut session = launcher.launch(&request()).unwrap();
        loop {
            match timeout(Duration::from_secs(10), session.events.recv()).await.unwrap() {
                Some(TunnelEvent::Ready(config)) => {
                    assert_eq!(config.tundev, "tun0");
                    break;
                }
                Some(_) => continue,
                None => panic!("tunnel ended before becoming ready"),
            }
        }

        session.control.stop(StopMode::PreserveSession);
        let events = collect_until_exit(&mut session).await;
        assert!(matches!(
            events.last(),
            Some(TunnelEvent::Exited(TunnelExit { requested: true, .. }))
        ));
        let signal = std::fs::read_to_string(dir.path().join("signal.txt")).unwrap();
        assert_eq!(signal.trim(), "hup");
    }

    #[tokio::test]
    async fn test_device_appearing_while_polling_publishes_once() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ServiceSettings {
            device_poll_interval_ms: 50,
            device_poll_attempts: 40,
            ..fake_openconnect(
                dir.path(),
                "read secret\n\
                 echo 'Using tun5 device'\n\
                 echo 'Configured as 10.9.9.9'\n\
                 while true; do sleep 0.1; done\n",
            )
        };
        let net = dir.path().join("net");
        std::fs::create_dir_all(&net).unwrap();
        let launcher = TunnelLauncher::new(&settings, TaskTracker::new()).with_probe(DeviceProbe::new(&net));

        let mut session = launcher.launch(&request()).unwrap();
        let mut events = Vec::new();
        loop {
            let event = timeout(Duration::from_secs(10), session.events.recv())
                .await
                .unwrap()
                .expect("tunnel ended before connecting");
            let connected = matches!(event, TunnelEvent::State(TunnelState::Connected));
            events.push(event);
            if connected {
                break;
            }
        }

        // let a couple of checks miss before the device shows up
        let connected_at = Instant::now();
        tokio::time::sleep(Duration::from_millis(120)).await;
        std::fs::create_dir(net.join("tun5")).unwrap();

        loop {
            let event = timeout(Duration::from_secs(10), session.events.recv())
                .await
                .unwrap()
                .expect("tunnel ended before becoming ready");
            let ready = matches!(event, TunnelEvent::Ready(_));
            events.push(event);
            if ready {
                break;
            }
        }
        assert!(connected_at.elapsed() < Duration::from_millis(50 * 40));

        session.control.stop(StopMode::Terminate);
        events.extend(collect_until_exit(&mut session).await);

        let ready: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                TunnelEvent::Ready(config) => Some(config),
                _ => None,
            })
            .collect();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].tundev, "tun5");
        assert_eq!(ready[0].address, Some(Ipv4Addr::new(10, 9, 9, 9)));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let settings = ServiceSettings {
            openconnect: PathBuf::from("/nonexistent/openconnect"),
            ..ServiceSettings::default()
        };
        let launcher = TunnelLauncher::new(&settings, TaskTracker::new());
        assert!(launcher.launch(&request()).is_err());
    }
}
