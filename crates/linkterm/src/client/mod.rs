//! Terminal controller (client role).
//!
//! Connects the invoking user's terminal to a remote session: dial the
//! server, switch to raw mode, then pump standard input and output until the
//! session ends.

pub mod resize;
pub mod session;
pub mod terminal;

use std::sync::Arc;
use std::time::Duration;

use protocol::{normalize_url, user_agent, DisconnectReason, Lifecycle, ProtocolError};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, USER_AGENT};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{client_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::config::ClientConfig;
use crate::network::{Proxy, ProxyError};

#[cfg(unix)]
pub use resize::SignalResizeSource;
pub use resize::{default_resize_source, PollingResizeSource, ResizeSource, SizeQuery};
pub use session::{run_session, Interrupt, SessionIo};
pub use terminal::RawModeGuard;

/// Connection established by [`dial`].
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Handshake timeout when connecting directly.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Minimum handshake timeout when connecting through a proxy.
pub const PROXY_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that end the client before a session starts.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The server address could not be turned into a WebSocket URL.
    #[error("invalid server address: {0}")]
    InvalidUrl(#[from] ProtocolError),

    /// TCP connect or the WebSocket handshake failed.
    #[error("failed to connect to terminal server: {0}")]
    Connect(String),

    /// The server answered the upgrade with an HTTP error.
    #[error("failed to connect to terminal server: HTTP {status} - {reason}")]
    Handshake { status: u16, reason: String },

    /// Connecting took longer than the handshake timeout.
    #[error("timed out connecting to terminal server after {0:?}")]
    Timeout(Duration),

    /// The proxy refused or failed.
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    /// The local terminal could not be prepared.
    #[error("terminal error: {0}")]
    Terminal(String),
}

/// How to reach the server.
#[derive(Debug, Clone)]
pub struct DialOptions {
    /// Optional proxy to tunnel through.
    pub proxy: Option<Proxy>,
    /// Bound on connecting plus the handshake.
    pub handshake_timeout: Duration,
    /// `User-Agent` header value.
    pub user_agent: String,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            proxy: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            user_agent: user_agent(env!("CARGO_PKG_VERSION")),
        }
    }
}

impl DialOptions {
    /// Build options from the client configuration.
    pub fn from_config(config: &ClientConfig) -> Result<Self, ClientError> {
        let proxy = config.proxy.as_deref().map(Proxy::parse).transpose()?;
        Ok(Self {
            proxy,
            handshake_timeout: config.handshake_timeout(),
            ..Self::default()
        })
    }

    /// Timeout actually applied. Proxied connections get at least
    /// [`PROXY_HANDSHAKE_TIMEOUT`].
    pub fn effective_timeout(&self) -> Duration {
        if self.proxy.is_some() {
            self.handshake_timeout.max(PROXY_HANDSHAKE_TIMEOUT)
        } else {
            self.handshake_timeout
        }
    }
}

/// Normalize `address` and open a WebSocket connection to it.
pub async fn dial(address: &str, options: &DialOptions) -> Result<WsStream, ClientError> {
    let url = normalize_url(address)?;
    let timeout = options.effective_timeout();

    tracing::debug!(url = %url, proxy = ?options.proxy.as_ref().map(Proxy::address), "Dialing");

    match tokio::time::timeout(timeout, dial_url(&url, options)).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Timeout(timeout)),
    }
}

async fn dial_url(url: &Url, options: &DialOptions) -> Result<WsStream, ClientError> {
    let host = url
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
        .ok_or_else(|| ClientError::Connect(format!("{} has no host", url)))?;
    let port = url.port_or_known_default().unwrap_or(protocol::DEFAULT_PORT);

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| ClientError::Connect(e.to_string()))?;
    let agent = HeaderValue::from_str(&options.user_agent)
        .map_err(|e| ClientError::Connect(format!("invalid User-Agent: {}", e)))?;
    request.headers_mut().insert(USER_AGENT, agent);

    let stream = match &options.proxy {
        Some(proxy) => proxy.connect(host, port).await?,
        None => TcpStream::connect((host, port))
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?,
    };

    let (ws, response) = client_async_tls_with_config(request, stream, None, None)
        .await
        .map_err(handshake_error)?;

    tracing::debug!(status = %response.status(), "WebSocket connected");
    Ok(ws)
}

fn handshake_error(error: WsError) -> ClientError {
    match error {
        WsError::Http(response) => {
            let status = response.status();
            ClientError::Handshake {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
            }
        }
        other => ClientError::Connect(other.to_string()),
    }
}

/// Connects the local terminal to a server.
#[derive(Debug, Clone, Default)]
pub struct TerminalController {
    options: DialOptions,
}

impl TerminalController {
    /// Create a controller with the given dial options.
    pub fn new(options: DialOptions) -> Self {
        Self { options }
    }

    /// Run one session against `address` on the real terminal.
    ///
    /// Returns an error only when connecting or entering raw mode fails; a
    /// session that ends for any other reason returns that reason.
    pub async fn connect(&self, address: &str) -> Result<DisconnectReason, ClientError> {
        let ws = dial(address, &self.options).await?;
        let lifecycle = Arc::new(Lifecycle::start());
        tracing::info!(address = %address, "Connected to terminal server");

        let _raw_mode =
            RawModeGuard::enable().map_err(|e| ClientError::Terminal(e.to_string()))?;

        let size = terminal::size_query();
        let resize = match default_resize_source(Arc::clone(&size)).events() {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(error = %e, "Resize events unavailable, polling instead");
                Box::new(PollingResizeSource::new(Arc::clone(&size)))
                    .events()
                    .map_err(|e| ClientError::Terminal(e.to_string()))?
            }
        };

        let io = SessionIo {
            input: terminal::spawn_stdin_reader(),
            output: tokio::io::stdout(),
            resize,
            size,
            interrupt: Box::pin(terminal::wait_for_interrupt()),
        };

        Ok(run_session(ws, io, lifecycle).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dial_options_default() {
        let options = DialOptions::default();
        assert!(options.proxy.is_none());
        assert_eq!(options.effective_timeout(), Duration::from_secs(5));
        assert!(options.user_agent.starts_with("LinkTerm/"));
    }

    #[test]
    fn test_dial_options_proxy_timeout() {
        let config = ClientConfig {
            proxy: Some("socks5://127.0.0.1:1080".to_string()),
            ..ClientConfig::default()
        };
        let options = DialOptions::from_config(&config).unwrap();
        assert!(options.proxy.is_some());
        assert_eq!(options.effective_timeout(), Duration::from_secs(10));

        let config = ClientConfig {
            proxy: Some("socks5://127.0.0.1:1080".to_string()),
            handshake_timeout_secs: 30,
            ..ClientConfig::default()
        };
        let options = DialOptions::from_config(&config).unwrap();
        assert_eq!(options.effective_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_dial_options_bad_proxy() {
        let config = ClientConfig {
            proxy: Some("gopher://proxy".to_string()),
            ..ClientConfig::default()
        };
        assert!(matches!(
            DialOptions::from_config(&config),
            Err(ClientError::Proxy(ProxyError::UnsupportedScheme(_)))
        ));
    }

    #[tokio::test]
    async fn test_dial_invalid_address() {
        let err = dial("ftp://example.com", &DialOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_dial_connection_refused() {
        // Grab a free port, then release it
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = dial(&format!("127.0.0.1:{}", port), &DialOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Connect(_)));
        assert!(err.to_string().starts_with("failed to connect to terminal server"));
    }

    #[test]
    fn test_handshake_error_reports_status() {
        let response = tokio_tungstenite::tungstenite::http::Response::builder()
            .status(404)
            .body(None)
            .unwrap();
        let err = handshake_error(WsError::Http(response));
        assert_eq!(
            err.to_string(),
            "failed to connect to terminal server: HTTP 404 - Not Found"
        );
    }
}
