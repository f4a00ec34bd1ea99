//! Protocol variants and their capabilities
//!
//! Each supported protocol owns three things: how its SSO authenticator is
//! invoked, which tunnel flags it needs, and the grammar used to pull a
//! cookie out of the authenticator's text output.
//!
//! | Protocol | Authenticator | Secret on stdin |
//! |----------|---------------|-----------------|
//! | GlobalProtect | `gp-saml-gui` | `--passwd-on-stdin` |
//! | AnyConnect | `openconnect-sso` | `--cookie-on-stdin` |

pub mod anyconnect;
pub mod globalprotect;

use crate::config::{ConfigError, ConnectionConfig};
use crate::tunnel::TunnelRequest;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    GlobalProtect,
    AnyConnect,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::GlobalProtect => "globalprotect",
            Protocol::AnyConnect => "anyconnect",
        }
    }

    /// Command line for the protocol's SSO authenticator
    pub fn auth_command(self, config: &ConnectionConfig, tool_dir: &Path) -> CommandSpec {
        match self {
            Protocol::GlobalProtect => CommandSpec {
                program: tool_dir.join(globalprotect::AUTHENTICATOR),
                args: globalprotect::auth_args(config),
            },
            Protocol::AnyConnect => CommandSpec {
                program: tool_dir.join(anyconnect::AUTHENTICATOR),
                args: anyconnect::auth_args(config),
            },
        }
    }

    /// Command line for the tunnel subprocess. The gateway is always last.
    pub fn tunnel_command(self, openconnect: &Path, request: &TunnelRequest) -> CommandSpec {
        let mut args = match self {
            Protocol::GlobalProtect => globalprotect::tunnel_args(request),
            Protocol::AnyConnect => anyconnect::tunnel_args(request),
        };
        args.extend(request.extra_args.iter().cloned());
        args.push("--non-inter".to_string());
        args.push(request.gateway.clone());

        CommandSpec {
            program: openconnect.to_path_buf(),
            args,
        }
    }

    pub fn parse_auth_output(self, output: &str) -> AuthOutput {
        match self {
            Protocol::GlobalProtect => globalprotect::parse_auth_output(output),
            Protocol::AnyConnect => anyconnect::parse_auth_output(output),
        }
    }

    /// Whether the tunnel may hand out a long-lived cookie that replaces
    /// the one it was started with
    pub fn issues_session_cookie(self) -> bool {
        matches!(self, Protocol::GlobalProtect)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "globalprotect" | "gp" => Ok(Protocol::GlobalProtect),
            "anyconnect" | "ac" => Ok(Protocol::AnyConnect),
            "" => Err(ConfigError::MissingProtocol),
            other => Err(ConfigError::UnknownProtocol(other.to_string())),
        }
    }
}

/// A program plus its arguments, ready to become a process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    pub fn program_name(&self) -> String {
        self.program.display().to_string()
    }
}

/// Facts extracted from an authenticator's combined output.
///
/// Every field is optional; an absent token is not an error at this level.
#[derive(Default, PartialEq, Eq)]
pub struct AuthOutput {
    pub cookie: Option<String>,
    pub username: Option<String>,
    pub fingerprint: Option<String>,
    pub host: Option<String>,
}

impl fmt::Debug for AuthOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthOutput")
            .field("cookie", &self.cookie.as_ref().map(|_| "<redacted>"))
            .field("username", &self.username)
            .field("fingerprint", &self.fingerprint)
            .field("host", &self.host)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeroize::Zeroizing;

    fn request(protocol: Protocol) -> TunnelRequest {
        TunnelRequest {
            protocol,
            gateway: "vpn.example.com".to_string(),
            username: Some("alice".to_string()),
            cookie: Zeroizing::new("secret".to_string()),
            fingerprint: Some("pin-sha256:abc".to_string()),
            usergroup: None,
            extra_args: vec!["--no-dtls".to_string()],
        }
    }

    #[test]
    fn test_protocol_from_str() {
        assert_eq!("globalprotect".parse::<Protocol>().unwrap(), Protocol::GlobalProtect);
        assert_eq!("GP".parse::<Protocol>().unwrap(), Protocol::GlobalProtect);
        assert_eq!("AnyConnect".parse::<Protocol>().unwrap(), Protocol::AnyConnect);
        assert!(matches!(
            "".parse::<Protocol>(),
            Err(ConfigError::MissingProtocol)
        ));
        assert!(matches!(
            "l2tp".parse::<Protocol>(),
            Err(ConfigError::UnknownProtocol(p)) if p == "l2tp"
        ));
    }

    #[test]
    fn test_protocol_display_matches_serde() {
        let json = serde_json::to_string(&Protocol::AnyConnect).unwrap();
        assert_eq!(json, format!("\"{}\"", Protocol::AnyConnect));
    }

    #[test]
    fn test_tunnel_command_globalprotect() {
        let spec = Protocol::GlobalProtect.tunnel_command(Path::new("openconnect"), &request(Protocol::GlobalProtect));
        assert_eq!(spec.program, PathBuf::from("openconnect"));
        assert_eq!(
            spec.args,
            vec![
                "--protocol=gp",
                "--useragent=PAN GlobalProtect",
                "--os=linux-64",
                "--user",
                "alice",
                "--usergroup=portal:prelogin-cookie",
                "--passwd-on-stdin",
                "--no-dtls",
                "--non-inter",
                "vpn.example.com",
            ]
        );
    }

    #[test]
    fn test_tunnel_command_anyconnect() {
        let spec = Protocol::AnyConnect.tunnel_command(Path::new("/usr/sbin/openconnect"), &request(Protocol::AnyConnect));
        assert_eq!(
            spec.args,
            vec![
                "--protocol=anyconnect",
                "--user",
                "alice",
                "--servercert=pin-sha256:abc",
                "--cookie-on-stdin",
                "--no-dtls",
                "--non-inter",
                "vpn.example.com",
            ]
        );
    }

    #[test]
    fn test_auth_command_uses_tool_dir() {
        let config = ConnectionConfig::new("portal.example.com", Protocol::GlobalProtect);
        let spec = Protocol::GlobalProtect.auth_command(&config, Path::new("/opt/vpn-sso/bin"));
        assert_eq!(spec.program, PathBuf::from("/opt/vpn-sso/bin/gp-saml-gui"));

        let config = ConnectionConfig::new("asa.example.com", Protocol::AnyConnect);
        let spec = Protocol::AnyConnect.auth_command(&config, Path::new("/opt/vpn-sso/bin"));
        assert_eq!(spec.program, PathBuf::from("/opt/vpn-sso/bin/openconnect-sso"));
    }

    #[test]
    fn test_auth_output_debug_redacts_cookie() {
        let output = AuthOutput {
            cookie: Some("topsecret".to_string()),
            ..AuthOutput::default()
        };
        let rendered = format!("{:?}", output);
        assert!(!rendered.contains("topsecret"));
        assert!(rendered.contains("<redacted>"));
    }
}
