//! GlobalProtect authenticator and tunnel flags
//!
//! `gp-saml-gui` finishes a SAML login and prints shell-style assignments:
//!
//! ```text
//! HOST=https://portal.example.com/global-protect/prelogin.esp
//! USER=alice
//! COOKIE='Q2xlYXJseSBub3QgYSByZWFsIGNvb2tpZQ'
//! OS=linux-64
//! ```
//!
//! The cookie it prints is a short-lived prelogin cookie. Once the tunnel is
//! up the gateway may hand out a long-lived `portal-userauthcookie`, which is
//! accepted through a different usergroup.

use super::AuthOutput;
use crate::config::ConnectionConfig;
use crate::tunnel::TunnelRequest;

pub const AUTHENTICATOR: &str = "gp-saml-gui";

/// Usergroup for the cookie produced by the SAML login
pub const PRELOGIN_USERGROUP: &str = "portal:prelogin-cookie";

/// Usergroup for the long-lived cookie reported by the tunnel
pub const SESSION_USERGROUP: &str = "portal:portal-userauthcookie";

pub fn auth_args(config: &ConnectionConfig) -> Vec<String> {
    let mut args = vec!["--portal".to_string(), config.gateway.clone()];
    if let Some(user) = config.username.as_deref().filter(|u| !u.is_empty()) {
        args.push("--user".to_string());
        args.push(user.to_string());
    }
    if config.external_browser {
        args.push("--external".to_string());
    }
    args.push("--".to_string());
    args.push("--protocol=gp".to_string());
    args
}

pub fn tunnel_args(request: &TunnelRequest) -> Vec<String> {
    let mut args = vec![
        "--protocol=gp".to_string(),
        "--useragent=PAN GlobalProtect".to_string(),
        "--os=linux-64".to_string(),
    ];
    if let Some(user) = request.username.as_deref().filter(|u| !u.is_empty()) {
        args.push("--user".to_string());
        args.push(user.to_string());
    }
    let usergroup = request
        .usergroup
        .as_deref()
        .filter(|g| !g.is_empty())
        .unwrap_or(PRELOGIN_USERGROUP);
    args.push(format!("--usergroup={}", usergroup));
    args.push("--passwd-on-stdin".to_string());
    args
}

pub fn parse_auth_output(output: &str) -> AuthOutput {
    let cookie = value_after(output, "COOKIE=")
        .or_else(|| value_after(output, "prelogin-cookie="))
        .map(strip_quotes)
        .filter(|c| !c.is_empty())
        .map(str::to_string);

    let username = output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("USER="))
        .map(strip_quotes)
        .find(|u| !u.is_empty())
        .map(str::to_string);

    AuthOutput {
        cookie,
        username,
        ..AuthOutput::default()
    }
}

/// Text following the first occurrence of `token`, up to the end of its line
fn value_after<'a>(text: &'a str, token: &str) -> Option<&'a str> {
    let start = text.find(token)? + token.len();
    let rest = &text[start..];
    let end = rest.find('\n').unwrap_or(rest.len());
    Some(rest[..end].trim_end_matches('\r').trim())
}

/// Remove one pair of matching surrounding quotes
pub(crate) fn strip_quotes(value: &str) -> &str {
    for quote in ['\'', '"'] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}
