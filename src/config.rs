//! Configuration handling for the VPN SSO service
//!
//! Two sources feed a connection attempt:
//!
//! - a TOML settings file (`~/.config/vpn-sso/config.toml`) holding a
//!   `[connection]` section and the `[service]` tunables
//! - the host's flat key/value VPN data map (see [`ConnectionConfig::from_vpn_data`])
//!
//! # Settings file
//!
//! ```toml
//! [connection]
//! gateway = "vpn.example.com"
//! protocol = "globalprotect"
//! cache_hours = 8
//!
//! [service]
//! tool_dir = "/opt/vpn-sso/bin"
//! cache_backend = "secret-tool"
//! ```

use crate::protocol::Protocol;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default lifetime of a cached credential, in hours
pub const DEFAULT_CACHE_HOURS: u32 = 8;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("Missing VPN gateway")]
    MissingGateway,
    #[error("Missing VPN protocol")]
    MissingProtocol,
    #[error("Unknown VPN protocol: {0}")]
    UnknownProtocol(String),
}

/// Parameters for a single connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub gateway: String,
    pub protocol: Protocol,
    pub username: Option<String>,
    pub usergroup: Option<String>,
    /// Extra tunnel arguments, whitespace separated
    pub extra_args: Option<String>,
    /// Cache lifetime in hours; 0 selects the service default
    pub cache_hours: u32,
    pub external_browser: bool,
}

impl ConnectionConfig {
    pub fn new(gateway: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            gateway: gateway.into(),
            protocol,
            username: None,
            usergroup: None,
            extra_args: None,
            cache_hours: 0,
            external_browser: false,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.trim().is_empty() {
            return Err(ConfigError::MissingGateway);
        }
        Ok(())
    }

    /// Extra tunnel arguments split on whitespace
    pub fn extra_args(&self) -> Vec<String> {
        self.extra_args
            .as_deref()
            .map(|args| args.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Build a config from the host's VPN data map.
    ///
    /// | Key | Meaning |
    /// |-----|---------|
    /// | `gateway` | Portal or server address |
    /// | `protocol` | `globalprotect` or `anyconnect` |
    /// | `username` | Optional login name |
    /// | `usergroup` | Optional cookie-acceptance path |
    /// | `extra-args` | Extra tunnel arguments |
    /// | `cache-hours` | Credential lifetime, 0 for default |
    /// | `external-browser` | `yes` to use the system browser |
    pub fn from_vpn_data(data: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            data.get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let gateway = get("gateway").ok_or(ConfigError::MissingGateway)?;
        let protocol: Protocol = get("protocol")
            .ok_or(ConfigError::MissingProtocol)?
            .parse()?;

        Ok(Self {
            gateway,
            protocol,
            username: get("username"),
            usergroup: get("usergroup"),
            extra_args: get("extra-args"),
            cache_hours: get("cache-hours")
                .and_then(|h| h.parse().ok())
                .unwrap_or(0),
            external_browser: get("external-browser").is_some_and(|v| v == "yes"),
        })
    }
}

/// Which secret store backs the credential cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheBackendKind {
    #[default]
    SecretTool,
    File,
    Keyring,
}

/// On-disk settings file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub service: ServiceSettings,
}

/// `[connection]` section, kept as raw strings until validated
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    pub gateway: String,
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usergroup: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_args: Option<String>,
    pub cache_hours: u32,
    pub external_browser: bool,
}

impl ConnectionSection {
    pub fn to_config(&self) -> Result<ConnectionConfig, ConfigError> {
        if self.gateway.trim().is_empty() {
            return Err(ConfigError::MissingGateway);
        }
        if self.protocol.trim().is_empty() {
            return Err(ConfigError::MissingProtocol);
        }

        Ok(ConnectionConfig {
            gateway: self.gateway.trim().to_string(),
            protocol: self.protocol.parse()?,
            username: self.username.clone().filter(|u| !u.is_empty()),
            usergroup: self.usergroup.clone().filter(|g| !g.is_empty()),
            extra_args: self.extra_args.clone().filter(|a| !a.trim().is_empty()),
            cache_hours: self.cache_hours,
            external_browser: self.external_browser,
        })
    }
}

/// `[service]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Private directory holding the SSO authenticators, prepended to PATH
    pub tool_dir: PathBuf,
    pub openconnect: PathBuf,
    pub cache_backend: CacheBackendKind,
    /// Lowest uid considered an interactive desktop user
    pub uid_threshold: u32,
    pub default_cache_hours: u32,
    pub device_poll_interval_ms: u64,
    pub device_poll_attempts: u32,
    pub stop_grace_secs: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            tool_dir: PathBuf::from("/opt/vpn-sso/bin"),
            openconnect: PathBuf::from("openconnect"),
            cache_backend: CacheBackendKind::default(),
            uid_threshold: 1000,
            default_cache_hours: DEFAULT_CACHE_HOURS,
            device_poll_interval_ms: 100,
            device_poll_attempts: 50,
            stop_grace_secs: 5,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// `~/.config/vpn-sso/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("vpn-sso").join("config.toml"))
    }

    /// A starter file with a placeholder gateway
    pub fn example() -> Self {
        Self {
            connection: ConnectionSection {
                gateway: "vpn.example.com".to_string(),
                protocol: Protocol::GlobalProtect.as_str().to_string(),
                ..ConnectionSection::default()
            },
            service: ServiceSettings::default(),
        }
    }
}
