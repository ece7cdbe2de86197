//! Endpoint addressing and client identification.
//!
//! Users type addresses in many shapes: `example.com`, `localhost:8080`,
//! `https://example.com`, `ws://example.com:8080/terminal`. All of them are
//! normalized into a `ws://` or `wss://` URL that points at the session path.

use std::net::SocketAddr;

use url::Url;

use crate::error::{ProtocolError, Result};

/// Path on which the server accepts terminal sessions.
pub const TERMINAL_PATH: &str = "/terminal";

/// Default listening port of the server.
pub const DEFAULT_PORT: u16 = 8080;

/// Product name sent in the `User-Agent` header.
const PRODUCT: &str = "LinkTerm";

/// Normalize a user-supplied address into a WebSocket URL.
///
/// - `http://` maps to `ws://` and `https://` maps to `wss://`
/// - `ws://` and `wss://` are kept
/// - an address without a scheme gets `ws://`
/// - an empty address means `ws://localhost/terminal`
/// - when nothing follows the authority, [`TERMINAL_PATH`] is appended
pub fn normalize_url(input: &str) -> Result<Url> {
    let input = input.trim();
    if input.is_empty() {
        return parse(format!("ws://localhost{}", TERMINAL_PATH));
    }

    let candidate = if let Some(rest) = input.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if let Some(rest) = input.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if input.starts_with("ws://") || input.starts_with("wss://") {
        input.to_string()
    } else if let Some((scheme, _)) = input.split_once("://") {
        return Err(ProtocolError::UnsupportedScheme(scheme.to_string()));
    } else {
        format!("ws://{}", input)
    };

    let has_path = candidate
        .split_once("://")
        .map(|(_, rest)| rest.contains('/'))
        .unwrap_or(false);

    let mut url = parse(candidate)?;
    if !has_path {
        url.set_path(TERMINAL_PATH);
    }
    Ok(url)
}

fn parse(candidate: String) -> Result<Url> {
    let url = Url::parse(&candidate).map_err(|e| ProtocolError::InvalidUrl {
        url: candidate.clone(),
        reason: e.to_string(),
    })?;

    if url.host_str().map_or(true, str::is_empty) {
        return Err(ProtocolError::MissingHost(candidate));
    }
    Ok(url)
}

/// Platform string used in client identification, e.g. `linux/x86_64`.
pub fn platform() -> String {
    format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH)
}

/// `User-Agent` value identifying the client: `LinkTerm/<version> <platform>`.
pub fn user_agent(version: &str) -> String {
    format!("{}/{} {}", PRODUCT, version, platform())
}

/// Resolve the address a request came from, for logging.
///
/// Precedence: Cloudflare's connecting-IP headers, then the first entry of
/// `X-Forwarded-For`, then the transport peer address with the port removed.
/// Header values are not trusted for anything beyond log output.
pub fn client_ip(
    cf_connecting_ip: Option<&str>,
    cf_connecting_ipv6: Option<&str>,
    forwarded_for: Option<&str>,
    remote_addr: &str,
) -> String {
    fn non_empty(value: Option<&str>) -> Option<&str> {
        value.map(str::trim).filter(|v| !v.is_empty())
    }

    if let Some(ip) = non_empty(cf_connecting_ip) {
        return ip.to_string();
    }
    if let Some(ip) = non_empty(cf_connecting_ipv6) {
        return ip.to_string();
    }
    if let Some(first) = forwarded_for.and_then(|chain| non_empty(chain.split(',').next())) {
        return first.to_string();
    }

    match remote_addr.parse::<SocketAddr>() {
        Ok(addr) => addr.ip().to_string(),
        Err(_) => remote_addr.to_string(),
    }
}
