//! Tunnel output monitor
//!
//! openconnect reports progress as free-form text on stdout and stderr.
//! The monitor reads it one line at a time, tracks the tunnel state and
//! collects the IPv4 facts needed once the tunnel is configured.
//!
//! | Pattern | Fact |
//! |---------|------|
//! | `tun<digits>` | tunnel device |
//! | ` as <a.b.c.d>` | assigned address |
//! | `Connected to <a.b.c.d>:<port>` | peer address |
//! | `DNS server ... address <a.b.c.d>` | DNS servers |
//! | `portal-userauthcookie=<value>` | long-lived GlobalProtect cookie |
//!
//! Only `Configured as` moves the tunnel to Connected. The earlier
//! transport lines arrive before the address and DNS facts are final.

use super::Ip4Config;
use crate::protocol::Protocol;
use regex::Regex;
use std::net::Ipv4Addr;
use std::sync::LazyLock;
use zeroize::Zeroizing;

static TUNDEV: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"tun\d+").expect("valid regex"));
static ASSIGNED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" as (\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})").expect("valid regex"));
static PEER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Connected to (\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})(?::\d+)?").expect("valid regex")
});
static DNS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"DNS server.*?address (\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})").expect("valid regex")
});
static SESSION_COOKIE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"portal-userauthcookie=([^\s]+)").expect("valid regex"));

const TRANSPORT_MARKERS: &[&str] = &[
    "Connected to ",
    "SSL connected",
    "ESP session established",
    "DTLS handshake",
];
const CONFIGURED_MARKER: &str = "Configured as";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Starting,
    Connecting,
    Connected,
    Disconnecting,
    Idle,
    Failed,
}

/// Facts collected from tunnel output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelFacts {
    pub device: Option<String>,
    pub address: Option<Ipv4Addr>,
    pub peer: Option<Ipv4Addr>,
    pub dns: Vec<Ipv4Addr>,
}

/// Something the supervisor has to act on
#[derive(Debug, PartialEq, Eq)]
pub enum Observation {
    State(TunnelState),
    SessionCookie(Zeroizing<String>),
    Configured,
}

pub struct OutputMonitor {
    protocol: Protocol,
    state: TunnelState,
    facts: TunnelFacts,
    cookie: Zeroizing<String>,
}

impl OutputMonitor {
    pub fn new(protocol: Protocol, cookie: Zeroizing<String>) -> Self {
        Self {
            protocol,
            state: TunnelState::Starting,
            facts: TunnelFacts::default(),
            cookie,
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn facts(&self) -> &TunnelFacts {
        &self.facts
    }

    pub fn set_state(&mut self, state: TunnelState) -> Option<Observation> {
        if self.state == state {
            return None;
        }
        self.state = state;
        Some(Observation::State(state))
    }

    /// Feed one output line. Facts are recorded before any state change
    /// so the Configured observation sees the address on the same line.
    pub fn observe(&mut self, line: &str) -> Vec<Observation> {
        let mut seen = Vec::new();
        self.collect_facts(line);

        if self.protocol.issues_session_cookie() {
            if let Some(cookie) = self.session_cookie(line) {
                seen.push(Observation::SessionCookie(cookie));
            }
        }

        if line.contains(CONFIGURED_MARKER) {
            if self.state != TunnelState::Connected {
                seen.extend(self.set_state(TunnelState::Connected));
                seen.push(Observation::Configured);
            }
        } else if self.state == TunnelState::Starting
            && TRANSPORT_MARKERS.iter().any(|marker| line.contains(marker))
        {
            seen.extend(self.set_state(TunnelState::Connecting));
        }

        seen
    }

    fn collect_facts(&mut self, line: &str) {
        if self.facts.device.is_none() {
            if let Some(m) = TUNDEV.find(line) {
                self.facts.device = Some(m.as_str().to_string());
            }
        }

        if let Some(addr) = capture_ipv4(&ASSIGNED, line) {
            self.facts.address = Some(addr);
        }
        if let Some(addr) = capture_ipv4(&PEER, line) {
            self.facts.peer = Some(addr);
        }

        for caps in DNS.captures_iter(line) {
            if let Some(addr) = caps.get(1).and_then(|m| m.as_str().parse().ok()) {
                if !self.facts.dns.contains(&addr) {
                    self.facts.dns.push(addr);
                }
            }
        }
    }

    fn session_cookie(&mut self, line: &str) -> Option<Zeroizing<String>> {
        let value = SESSION_COOKIE.captures(line)?.get(1)?.as_str();
        if value.eq_ignore_ascii_case("empty") || value == self.cookie.as_str() {
            return None;
        }
        self.cookie = Zeroizing::new(value.to_string());
        Some(self.cookie.clone())
    }

    /// Facts in the form published upstream
    pub fn ip4_config(&self) -> Ip4Config {
        Ip4Config::from_facts(&self.facts)
    }
}

fn capture_ipv4(pattern: &Regex, line: &str) -> Option<Ipv4Addr> {
    pattern.captures(line)?.get(1)?.as_str().parse().ok()
}
