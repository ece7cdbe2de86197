//! Session bridge (server role).
//!
//! The server listens for WebSocket upgrades on [`protocol::TERMINAL_PATH`]
//! and gives every accepted connection its own shell on a fresh PTY. Origins
//! are not checked; access control belongs to the network placement or the
//! tunnel in front of the server.

pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::{client_ip, TERMINAL_PATH};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ServerConfig;
use crate::session::{SessionError, ShellCommand};

pub use session::ClientInfo;

/// How long `run` waits for live sessions to tear down after shutdown.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Back-off after a failed `accept`.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Per-session settings derived from [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Shell spawned for each session.
    pub shell: ShellCommand,
    /// Bound on voluntary exit after SIGTERM.
    pub grace_period: Duration,
    /// Size of one PTY read.
    pub read_buffer_size: usize,
}

impl SessionSettings {
    /// Resolve the shell and copy the relevant settings.
    pub fn from_config(config: &ServerConfig) -> Result<Self, SessionError> {
        Ok(Self {
            shell: ShellCommand::detect(config.shell.as_deref(), &config.shell_args)?,
            grace_period: config.grace_period(),
            read_buffer_size: config.read_buffer_size,
        })
    }
}

/// A bound terminal server.
pub struct Server {
    listener: TcpListener,
    settings: Arc<SessionSettings>,
    shutdown: CancellationToken,
}

impl Server {
    /// Resolve the shell and bind the listening socket.
    ///
    /// Failure here is fatal to the process.
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let settings = SessionSettings::from_config(config)?;

        let address = config.bind_address();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to bind {}", address))?;

        Ok(Self {
            listener,
            settings: Arc::new(settings),
            shutdown: CancellationToken::new(),
        })
    }

    /// Address actually bound, useful with port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Token that stops the accept loop and every live session when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Settings applied to each session.
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Accept connections until the shutdown token is cancelled.
    pub async fn run(self) -> Result<()> {
        let local = self.local_addr()?;
        tracing::info!(
            address = %local,
            shell = %self.settings.shell.program(),
            "Terminal server listening on ws://{}{}",
            local,
            TERMINAL_PATH
        );

        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Server shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(peer = %peer, "Accepted connection");
                        let settings = Arc::clone(&self.settings);
                        let shutdown = self.shutdown.child_token();
                        tracker.spawn(async move {
                            serve_connection(stream, peer.to_string(), settings, shutdown).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "TCP accept error");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        tracker.close();
        if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(sessions = tracker.len(), "Sessions still running at shutdown");
        }

        Ok(())
    }
}

/// Upgrade one inbound stream and run a terminal session on it.
///
/// Generic over the stream so that paths other than the TCP listener, such
/// as a relay connector, can feed connections into the same bridge. Errors
/// end this session only; they are logged and never propagated.
pub async fn serve_connection<S>(
    stream: S,
    peer: String,
    settings: Arc<SessionSettings>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut info = None;
    let callback = |request: &Request, response: Response| {
        let path = request.uri().path();
        if path != TERMINAL_PATH {
            tracing::debug!(peer = %peer, path = %path, "Rejecting upgrade for unknown path");
            let mut rejection = ErrorResponse::new(Some("Not Found".to_string()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            return Err(rejection);
        }
        info = Some(client_info(request, &peer));
        Ok(response)
    };

    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "WebSocket upgrade failed");
            return;
        }
    };

    let info = info.unwrap_or_else(|| ClientInfo::new(client_ip(None, None, None, &peer), None));
    session::run(ws, info, &settings, shutdown).await;
}

fn client_info(request: &Request, peer: &str) -> ClientInfo {
    let header = |name: &str| {
        request
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
    };

    let ip = client_ip(
        header("CF-Connecting-IP"),
        header("CF-Connecting-IPv6"),
        header("X-Forwarded-For"),
        peer,
    );
    ClientInfo::new(ip, header("User-Agent").map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: &[(&str, &str)]) -> Request {
        let mut builder = Request::builder().uri("/terminal");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_client_info_from_headers() {
        let req = request(&[
            ("X-Forwarded-For", "198.51.100.4, 10.0.0.1"),
            ("User-Agent", "LinkTerm/0.3.0 linux/x86_64"),
        ]);
        let info = client_info(&req, "127.0.0.1:40000");
        assert_eq!(info.ip, "198.51.100.4");
        assert_eq!(info.user_agent, "LinkTerm/0.3.0 linux/x86_64");
    }

    #[test]
    fn test_client_info_defaults() {
        let info = client_info(&request(&[]), "127.0.0.1:40000");
        assert_eq!(info.ip, "127.0.0.1");
        assert_eq!(info.user_agent, "Unknown");
    }

    #[test]
    fn test_settings_from_config() {
        let config = ServerConfig {
            shell: Some("/bin/sh".to_string()),
            shell_args: vec!["-i".to_string()],
            grace_period_ms: 250,
            ..ServerConfig::default()
        };
        let settings = SessionSettings::from_config(&config).unwrap();
        assert_eq!(settings.shell.program(), "/bin/sh");
        assert_eq!(settings.shell.args(), ["-i"]);
        assert_eq!(settings.grace_period, Duration::from_millis(250));
        assert_eq!(settings.read_buffer_size, 1024);
    }

    #[tokio::test]
    async fn test_bind_reports_address() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            shell: Some("/bin/sh".to_string()),
            ..ServerConfig::default()
        };
        let server = Server::bind(&config).await.unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let first = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = first.local_addr().unwrap().port();

        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port,
            shell: Some("/bin/sh".to_string()),
            ..ServerConfig::default()
        };
        let err = Server::bind(&config).await.err().unwrap();
        assert!(err.to_string().contains("Failed to bind"));
    }
}
