//! VPN SSO - connection orchestration for SSO-authenticated VPN tunnels
//!
//! This crate drives external tools to bring up a GlobalProtect or
//! AnyConnect tunnel behind single sign-on: a browser-based authenticator
//! produces a cookie, openconnect consumes it, and the resulting IPv4
//! configuration is reported back to the caller. Cookies are cached in the
//! desktop user's secret store so most reconnects skip the browser.
//!
//! # Architecture
//!
//! - `config`: Connection parameters and the TOML settings file
//! - `protocol`: Per-protocol command lines and output grammars
//! - `session`: Finding the interactive desktop session from a daemon
//! - `process`: Child supervision, stop signals and privilege dropping
//! - `cache`: TTL-aware credential cache over pluggable secret stores
//! - `auth`: SSO authenticator launcher
//! - `tunnel`: openconnect launcher and output monitor
//! - `service`: The connection state machine tying it all together
//!
//! # Usage
//!
//! ```bash
//! vpn-sso init
//! sudo vpn-sso connect --gateway vpn.example.com --protocol gp
//! ```

pub mod auth;
pub mod cache;
pub mod config;
pub mod process;
pub mod protocol;
pub mod service;
pub mod session;
pub mod tunnel;

pub use config::{ConnectionConfig, Settings};
pub use protocol::Protocol;
pub use service::{ConnectionService, ConnectionState, FailureReason, ServiceEvent, ServiceHandle};
