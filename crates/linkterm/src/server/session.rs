//! One terminal session: a WebSocket connection bridged to a shell.
//!
//! Four tasks share a session. The inbound pump feeds client frames to the
//! PTY, the outbound pump feeds PTY output to the connection, the exit
//! watcher sends the closing frame when the shell exits, and a single writer
//! task owns the sink. Everything sent on the connection goes through the
//! writer's queue.
//!
//! [`SessionState`] decides which task gets to report the end of the
//! session, so the first unexpected error is logged once and later errors
//! caused by the teardown itself stay quiet.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{decode_client_frame, format_duration, ControlMessage, Frame, SessionState, TerminalSize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::SessionSettings;
use crate::network::{classify, close_message, ErrorClass, SESSION_ENDED_REASON};
use crate::session::{PtyProcess, Termination};

/// Capacity of the outbound message queue.
const QUEUE_CAPACITY: usize = 64;

/// How long the exit watcher lets trailing output drain before closing.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Bound on flushing queued frames once teardown has run.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Who is on the other end of a session, for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    /// Resolved client address.
    pub ip: String,
    /// `User-Agent` header, `"Unknown"` when absent.
    pub user_agent: String,
}

impl ClientInfo {
    /// Build client info, defaulting the user agent.
    pub fn new(ip: String, user_agent: Option<String>) -> Self {
        Self {
            ip,
            user_agent: user_agent
                .filter(|ua| !ua.is_empty())
                .unwrap_or_else(|| "Unknown".to_string()),
        }
    }
}

/// Run a session on an upgraded connection until it ends.
pub async fn run<S>(
    mut ws: WebSocketStream<S>,
    client: ClientInfo,
    settings: &SessionSettings,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let id = Uuid::new_v4().to_string();

    let (pty, reader) = match PtyProcess::spawn(&settings.shell, TerminalSize::default()) {
        Ok(spawned) => spawned,
        Err(e) => {
            tracing::error!(
                session_id = %id,
                client_ip = %client.ip,
                error = %e,
                "Failed to start shell"
            );
            let _ = ws.close(None).await;
            return;
        }
    };

    let started = Instant::now();
    tracing::info!(
        session_id = %id,
        client_ip = %client.ip,
        user_agent = %client.user_agent,
        pid = ?pty.pid(),
        "New terminal session"
    );

    let pty = Arc::new(pty);
    let state = Arc::new(SessionState::new());
    let (sink, stream) = ws.split();
    let (queue, queue_rx) = mpsc::channel(QUEUE_CAPACITY);

    let writer = tokio::spawn(write_loop(sink, queue_rx, Arc::clone(&state), id.clone()));

    let output_done = CancellationToken::new();
    let mut outbound = tokio::spawn(outbound_pump(
        reader.into_channel(settings.read_buffer_size),
        queue.clone(),
        output_done.clone(),
    ));

    let mut inbound = tokio::spawn(inbound_pump(
        stream,
        Arc::clone(&pty),
        Arc::clone(&state),
        id.clone(),
    ));

    let watcher = tokio::spawn(exit_watcher(
        Arc::clone(&pty),
        Arc::clone(&state),
        queue,
        output_done,
        id.clone(),
    ));

    tokio::select! {
        _ = &mut inbound => {}
        _ = &mut outbound => {}
        _ = shutdown.cancelled() => {
            if state.begin_closing() {
                tracing::info!(session_id = %id, "Closing session for server shutdown");
            }
        }
    }

    // Teardown: stop the shell, let the watcher send its frame, then drop
    // every queue sender so the writer flushes and closes the sink.
    pty.close().await;
    let termination = pty.terminate(settings.grace_period).await;
    match termination {
        Termination::Exited(_) => {}
        Termination::Killed => {
            tracing::warn!(session_id = %id, "Shell did not exit in time and was killed");
        }
        Termination::Unsignalled => {
            tracing::warn!(session_id = %id, "Shell did not exit in time and has no pid to signal");
        }
    }

    if tokio::time::timeout(settings.grace_period + OUTPUT_DRAIN_TIMEOUT, watcher)
        .await
        .is_err()
    {
        tracing::debug!(session_id = %id, "Exit watcher did not finish");
    }
    inbound.abort();
    outbound.abort();

    if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, writer).await.is_err() {
        tracing::debug!(session_id = %id, "Writer did not flush in time");
    }

    if state.finish() {
        tracing::info!(
            session_id = %id,
            client_ip = %client.ip,
            duration = %format_duration(started.elapsed()),
            "Session ended"
        );
    }
}

/// Log a transport error according to its class.
fn report_error(state: &SessionState, id: &str, direction: &str, error: &WsError) {
    match classify(error) {
        ErrorClass::AlreadyClosed => {}
        ErrorClass::UnexpectedClosure => {
            if state.begin_closing() {
                tracing::info!(session_id = %id, "Client disconnected unexpectedly");
            }
        }
        ErrorClass::Other => {
            if state.begin_closing() {
                tracing::error!(session_id = %id, direction, error = %error, "WebSocket error");
            }
        }
    }
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
    mut queue: mpsc::Receiver<WsMessage>,
    state: Arc<SessionState>,
    id: String,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = queue.recv().await {
        let is_close = matches!(message, WsMessage::Close(_));
        if let Err(e) = sink.send(message).await {
            report_error(&state, &id, "write", &e);
            break;
        }
        if is_close {
            break;
        }
    }

    // Best effort: the peer may already be gone
    let _ = sink.close().await;
}

async fn inbound_pump<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    pty: Arc<PtyProcess>,
    state: Arc<SessionState>,
    id: String,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(result) = stream.next().await {
        let frame = match result {
            Ok(WsMessage::Text(text)) => Frame::Text(text),
            Ok(WsMessage::Binary(bytes)) => Frame::Binary(bytes),
            Ok(WsMessage::Close(_)) => {
                if state.begin_closing() {
                    tracing::info!(session_id = %id, "Client closed connection");
                }
                return;
            }
            // Ping and pong are answered by tungstenite
            Ok(_) => continue,
            Err(e) => {
                report_error(&state, &id, "read", &e);
                return;
            }
        };

        match decode_client_frame(frame) {
            Some(ControlMessage::Data(bytes)) => {
                if let Err(e) = pty.write(&bytes).await {
                    if !state.is_closing() {
                        tracing::debug!(session_id = %id, error = %e, "Failed to write to PTY");
                    }
                    return;
                }
            }
            Some(ControlMessage::Resize(size)) => {
                if let Err(e) = pty.resize(size).await {
                    tracing::error!(session_id = %id, error = %e, "Failed to resize PTY");
                }
            }
            None => {
                tracing::debug!(session_id = %id, "Ignoring malformed resize message");
            }
        }
    }

    if state.begin_closing() {
        tracing::info!(session_id = %id, "Client connection ended");
    }
}

async fn outbound_pump(
    mut output: mpsc::Receiver<Vec<u8>>,
    queue: mpsc::Sender<WsMessage>,
    done: CancellationToken,
) {
    while let Some(chunk) = output.recv().await {
        if queue.send(WsMessage::Binary(chunk)).await.is_err() {
            break;
        }
    }
    done.cancel();
}

async fn exit_watcher(
    pty: Arc<PtyProcess>,
    state: Arc<SessionState>,
    queue: mpsc::Sender<WsMessage>,
    output_done: CancellationToken,
    id: String,
) {
    let status = pty.wait_exit().await;
    tracing::debug!(session_id = %id, code = ?status.code, "Shell exited");

    let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, output_done.cancelled()).await;

    if state.begin_closing() {
        tracing::info!(session_id = %id, "Shell exited, closing connection");
        let _ = queue.send(close_message(SESSION_ENDED_REASON)).await;
    }
}
