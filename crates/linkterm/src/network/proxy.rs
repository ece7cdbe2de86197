//! Proxy dialing for the client role.
//!
//! Relay and tunnel services expose a local SOCKS5 endpoint; corporate
//! networks usually offer an HTTP proxy. Both are reduced to "give me a TCP
//! stream to host:port" so the WebSocket handshake runs unchanged on top.

use std::net::IpAddr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use percent_encoding::percent_decode_str;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

const SOCKS_VERSION: u8 = 0x05;
const SOCKS_AUTH_NONE: u8 = 0x00;
const SOCKS_AUTH_PASSWORD: u8 = 0x02;
const SOCKS_AUTH_UNACCEPTABLE: u8 = 0xFF;
const SOCKS_CMD_CONNECT: u8 = 0x01;
const SOCKS_ATYP_IPV4: u8 = 0x01;
const SOCKS_ATYP_DOMAIN: u8 = 0x03;
const SOCKS_ATYP_IPV6: u8 = 0x04;

const DEFAULT_SOCKS_PORT: u16 = 1080;

/// Longest HTTP CONNECT response head we are willing to buffer.
const MAX_CONNECT_RESPONSE: usize = 8192;

/// Errors that can occur while dialing through a proxy.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("invalid proxy URL: {0}")]
    InvalidUrl(String),

    #[error("unsupported proxy scheme: {0} (expected socks5 or http)")]
    UnsupportedScheme(String),

    #[error("SOCKS5 proxy error: {0}")]
    Socks(String),

    #[error("HTTP proxy error: {0}")]
    Http(String),

    #[error("proxy I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Username and password for proxy authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Which protocol the proxy speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Socks5,
    HttpConnect,
}

/// A parsed proxy endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proxy {
    kind: ProxyKind,
    address: String,
    credentials: Option<Credentials>,
}

impl Proxy {
    /// Parse `socks5://[user:pass@]host:port` or `http://[user:pass@]host:port`.
    pub fn parse(input: &str) -> Result<Self, ProxyError> {
        let url = Url::parse(input).map_err(|e| ProxyError::InvalidUrl(e.to_string()))?;

        let kind = match url.scheme() {
            "socks5" | "socks5h" => ProxyKind::Socks5,
            "http" => ProxyKind::HttpConnect,
            other => return Err(ProxyError::UnsupportedScheme(other.to_string())),
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyError::InvalidUrl(format!("{} has no host", input)))?;
        let port = url.port_or_known_default().unwrap_or(DEFAULT_SOCKS_PORT);

        let credentials = if url.username().is_empty() {
            None
        } else {
            Some(Credentials {
                username: decode_userinfo(url.username())?,
                password: decode_userinfo(url.password().unwrap_or_default())?,
            })
        };

        Ok(Self {
            kind,
            address: format!("{}:{}", host, port),
            credentials,
        })
    }

    /// The proxy protocol.
    pub fn kind(&self) -> ProxyKind {
        self.kind
    }

    /// `host:port` of the proxy itself.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Credentials presented to the proxy, if any.
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Open a TCP stream to `host:port` through the proxy.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, ProxyError> {
        let mut stream = TcpStream::connect(&self.address).await?;
        tracing::debug!(proxy = %self.address, target = %host, port, "Connected to proxy");

        match self.kind {
            ProxyKind::Socks5 => {
                socks5_handshake(&mut stream, host, port, self.credentials.as_ref()).await?
            }
            ProxyKind::HttpConnect => {
                http_connect(&mut stream, host, port, self.credentials.as_ref()).await?
            }
        }

        Ok(stream)
    }
}

/// Userinfo arrives percent-encoded; proxies expect the raw text.
fn decode_userinfo(value: &str) -> Result<String, ProxyError> {
    percent_decode_str(value)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|e| ProxyError::InvalidUrl(format!("credentials are not valid UTF-8: {}", e)))
}

async fn socks5_handshake<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    credentials: Option<&Credentials>,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting: &[u8] = if credentials.is_some() {
        &[SOCKS_VERSION, 2, SOCKS_AUTH_NONE, SOCKS_AUTH_PASSWORD]
    } else {
        &[SOCKS_VERSION, 1, SOCKS_AUTH_NONE]
    };
    stream.write_all(greeting).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(ProxyError::Socks(format!(
            "unexpected protocol version {}",
            choice[0]
        )));
    }

    match (choice[1], credentials) {
        (SOCKS_AUTH_NONE, _) => {}
        (SOCKS_AUTH_PASSWORD, Some(creds)) => socks5_authenticate(stream, creds).await?,
        (SOCKS_AUTH_UNACCEPTABLE, _) => {
            return Err(ProxyError::Socks(
                "no acceptable authentication method".to_string(),
            ))
        }
        (method, _) => {
            return Err(ProxyError::Socks(format!(
                "proxy selected unsupported method {:#04x}",
                method
            )))
        }
    }

    let mut request = vec![SOCKS_VERSION, SOCKS_CMD_CONNECT, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(SOCKS_ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(SOCKS_ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let name = host.as_bytes();
            let len = u8::try_from(name.len())
                .map_err(|_| ProxyError::Socks(format!("hostname too long: {}", host)))?;
            request.push(SOCKS_ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(name);
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(ProxyError::Socks(socks5_reply_message(reply[1]).to_string()));
    }

    // Skip the bound address
    let remaining = match reply[3] {
        SOCKS_ATYP_IPV4 => 4 + 2,
        SOCKS_ATYP_IPV6 => 16 + 2,
        SOCKS_ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        other => {
            return Err(ProxyError::Socks(format!(
                "unknown address type {:#04x} in reply",
                other
            )))
        }
    };
    let mut bound = vec![0u8; remaining];
    stream.read_exact(&mut bound).await?;

    Ok(())
}

async fn socks5_authenticate<S>(stream: &mut S, creds: &Credentials) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user = creds.username.as_bytes();
    let pass = creds.password.as_bytes();
    let user_len = u8::try_from(user.len())
        .map_err(|_| ProxyError::Socks("username too long".to_string()))?;
    let pass_len = u8::try_from(pass.len())
        .map_err(|_| ProxyError::Socks("password too long".to_string()))?;

    let mut request = vec![0x01, user_len];
    request.extend_from_slice(user);
    request.push(pass_len);
    request.extend_from_slice(pass);
    stream.write_all(&request).await?;

    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await?;
    if status[1] != 0x00 {
        return Err(ProxyError::Socks("authentication failed".to_string()));
    }
    Ok(())
}

fn socks5_reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown failure",
    }
}

async fn http_connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    credentials: Option<&Credentials>,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };

    let mut request = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n",
        authority = authority
    );
    if let Some(creds) = credentials {
        let token = BASE64.encode(format!("{}:{}", creds.username, creds.password));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    // Read byte by byte so nothing past the response head is consumed
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_CONNECT_RESPONSE {
            return Err(ProxyError::Http("response head too large".to_string()));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(ProxyError::Http(
                "proxy closed the connection during CONNECT".to_string(),
            ));
        }
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| ProxyError::Http(format!("malformed status line: {}", status_line)))?;

    if !(200..300).contains(&status) {
        return Err(ProxyError::Http(format!("CONNECT rejected: {}", status_line)));
    }
    Ok(())
}
