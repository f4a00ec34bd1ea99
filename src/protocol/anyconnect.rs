//! AnyConnect authenticator and tunnel flags
//!
//! `openconnect-sso --authenticate` prints one assignment per line:
//!
//! ```text
//! HOST=https://asa.example.com/
//! COOKIE=3B9C...
//! FINGERPRINT=pin-sha256:...
//! ```

use super::AuthOutput;
use super::globalprotect::strip_quotes;
use crate::config::ConnectionConfig;
use crate::tunnel::TunnelRequest;

pub const AUTHENTICATOR: &str = "openconnect-sso";

/// The username is never passed here; the browser login collects it.
pub fn auth_args(config: &ConnectionConfig) -> Vec<String> {
    let mut args = vec![
        "--server".to_string(),
        config.gateway.clone(),
        "--authenticate".to_string(),
    ];
    if config.external_browser {
        args.push("--external-browser".to_string());
    } else {
        args.push("--browser-display-mode".to_string());
        args.push("shown".to_string());
    }
    args
}

pub fn tunnel_args(request: &TunnelRequest) -> Vec<String> {
    let mut args = vec!["--protocol=anyconnect".to_string()];
    if let Some(user) = request.username.as_deref().filter(|u| !u.is_empty()) {
        args.push("--user".to_string());
        args.push(user.to_string());
    }
    if let Some(fingerprint) = request.fingerprint.as_deref().filter(|f| !f.is_empty()) {
        args.push(format!("--servercert={}", fingerprint));
    }
    args.push("--cookie-on-stdin".to_string());
    args
}

pub fn parse_auth_output(output: &str) -> AuthOutput {
    let mut parsed = AuthOutput::default();

    for line in output.lines().map(str::trim) {
        let (slot, value) = if let Some(value) = line.strip_prefix("COOKIE=") {
            (&mut parsed.cookie, value)
        } else if let Some(value) = line.strip_prefix("FINGERPRINT=") {
            (&mut parsed.fingerprint, value)
        } else if let Some(value) = line.strip_prefix("HOST=") {
            (&mut parsed.host, value)
        } else {
            continue;
        };

        let value = strip_quotes(value);
        if !value.is_empty() {
            *slot = Some(value.to_string());
        }
    }

    parsed
}
