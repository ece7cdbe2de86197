//! The client side of a terminal session.
//!
//! [`run_session`] is transport- and terminal-agnostic: input, output,
//! resize events, size queries and the interrupt all arrive through
//! [`SessionIo`], so the same code drives a real terminal and the
//! integration tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{encode_resize, DisconnectReason, Lifecycle};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use super::resize::SizeQuery;
use crate::network::{classify, close_message, ErrorClass, CLIENT_DISCONNECTED_REASON};

/// Capacity of the outbound message queue.
const QUEUE_CAPACITY: usize = 64;

/// Bound on flushing the final close frame.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Clears the current line before narration so it is not mixed with output.
const LINE_RESET: &str = "\r\x1b[K";

/// Future that resolves when the user asks to leave.
pub type Interrupt = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Everything a session reads from and writes to, apart from the connection.
pub struct SessionIo<W> {
    /// Chunks of user input.
    pub input: mpsc::Receiver<Vec<u8>>,
    /// Where terminal output and narration go.
    pub output: W,
    /// One event per possible resize.
    pub resize: mpsc::Receiver<()>,
    /// Current local terminal size.
    pub size: SizeQuery,
    /// Resolves on interrupt.
    pub interrupt: Interrupt,
}

type SharedOutput<W> = Arc<Mutex<W>>;

/// Drive a session until it ends and return why it ended.
///
/// The disconnect line is written to the output exactly once, with the
/// reason of whichever path got there first.
pub async fn run_session<S, W>(
    ws: WebSocketStream<S>,
    io: SessionIo<W>,
    lifecycle: Arc<Lifecycle>,
) -> DisconnectReason
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let SessionIo {
        input,
        output,
        resize,
        size,
        interrupt,
    } = io;

    let (sink, stream) = ws.split();
    let output: SharedOutput<W> = Arc::new(Mutex::new(output));
    let (queue, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
    let done = CancellationToken::new();

    let writer = tokio::spawn(write_loop(sink, queue_rx));

    match size() {
        Ok(initial) if initial.is_valid() => {
            if queue.send(WsMessage::Text(encode_resize(initial))).await.is_err() {
                tracing::warn!("Failed to send initial terminal size");
            }
        }
        Ok(initial) => {
            tracing::warn!(cols = initial.cols, rows = initial.rows, "Terminal reports no size");
        }
        Err(e) => tracing::warn!(error = %e, "Could not get terminal size"),
    }

    let resize_task = tokio::spawn(resize_loop(resize, size, queue.clone()));
    let input_task = tokio::spawn(input_pump(input, queue.clone(), done.clone()));
    let output_task = tokio::spawn(output_pump(
        stream,
        Arc::clone(&output),
        Arc::clone(&lifecycle),
        done.clone(),
    ));

    tokio::select! {
        _ = done.cancelled() => {}
        _ = interrupt => {
            write_output(&output, b"\r\nReceived interrupt, disconnecting...\r\n").await;
            // Best effort: a stalled peer must not keep the client alive
            let _ = queue.try_send(close_message(CLIENT_DISCONNECTED_REASON));
            report(&lifecycle, &output, DisconnectReason::Interrupted).await;
        }
    }

    if lifecycle.reason() != Some(DisconnectReason::Interrupted) {
        // Best effort: the server may have closed already
        let _ = queue.try_send(close_message(CLIENT_DISCONNECTED_REASON));
    }
    report(&lifecycle, &output, DisconnectReason::ClientClosed).await;

    input_task.abort();
    resize_task.abort();
    output_task.abort();
    drop(queue);

    if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, writer).await.is_err() {
        tracing::debug!("Connection writer did not finish in time");
    }

    lifecycle.reason().unwrap_or(DisconnectReason::ClientClosed)
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
    mut queue: mpsc::Receiver<WsMessage>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = queue.recv().await {
        let is_close = matches!(message, WsMessage::Close(_));
        if let Err(e) = sink.send(message).await {
            if classify(&e) != ErrorClass::AlreadyClosed {
                tracing::debug!(error = %e, "Failed to send message");
            }
            break;
        }
        if is_close {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn resize_loop(
    mut events: mpsc::Receiver<()>,
    size: SizeQuery,
    queue: mpsc::Sender<WsMessage>,
) {
    while events.recv().await.is_some() {
        match size() {
            Ok(current) if current.is_valid() => {
                tracing::debug!(cols = current.cols, rows = current.rows, "Terminal resized");
                if queue.send(WsMessage::Text(encode_resize(current))).await.is_err() {
                    // Connection already closed
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "Could not get terminal size"),
        }
    }
}

async fn input_pump(
    mut input: mpsc::Receiver<Vec<u8>>,
    queue: mpsc::Sender<WsMessage>,
    done: CancellationToken,
) {
    while let Some(chunk) = input.recv().await {
        if queue.send(WsMessage::Binary(chunk)).await.is_err() {
            break;
        }
    }
    tracing::debug!("Input ended");
    done.cancel();
}

async fn output_pump<S, W>(
    mut stream: SplitStream<WebSocketStream<S>>,
    output: SharedOutput<W>,
    lifecycle: Arc<Lifecycle>,
    done: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(result) = stream.next().await {
        let written = match result {
            Ok(WsMessage::Binary(bytes)) => write_bytes(&output, &bytes).await,
            Ok(WsMessage::Text(text)) => write_bytes(&output, text.as_bytes()).await,
            Ok(WsMessage::Close(frame)) => {
                tracing::debug!(frame = ?frame, "Server closed the connection");
                report(&lifecycle, &output, DisconnectReason::ServerClosed).await;
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                match classify(&e) {
                    ErrorClass::AlreadyClosed => {
                        report(&lifecycle, &output, DisconnectReason::ClientClosed).await;
                    }
                    ErrorClass::UnexpectedClosure | ErrorClass::Other => {
                        if !lifecycle.is_disconnected() {
                            let message = format!("{}\nConnection closed: {}\r\n", LINE_RESET, e);
                            write_output(&output, message.as_bytes()).await;
                        }
                        report(&lifecycle, &output, DisconnectReason::ConnectionError).await;
                    }
                }
                break;
            }
        };

        if let Err(e) = written {
            tracing::debug!(error = %e, "Failed to write output");
            report(&lifecycle, &output, DisconnectReason::OutputError).await;
            break;
        }
    }

    report(&lifecycle, &output, DisconnectReason::ClientClosed).await;
    done.cancel();
}

async fn write_bytes<W>(output: &SharedOutput<W>, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = output.lock().await;
    out.write_all(bytes).await?;
    out.flush().await
}

async fn write_output<W>(output: &SharedOutput<W>, bytes: &[u8])
where
    W: AsyncWrite + Unpin,
{
    let _ = write_bytes(output, bytes).await;
}

/// Record the end of the session; only the first call prints.
async fn report<W>(lifecycle: &Lifecycle, output: &SharedOutput<W>, reason: DisconnectReason)
where
    W: AsyncWrite + Unpin,
{
    if let Some(line) = lifecycle.disconnect(reason) {
        let message = format!("{}{}\r\n", LINE_RESET, line);
        write_output(output, message.as_bytes()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::TerminalSize;
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite::protocol::Role;

    fn session_io<W>(
        input: mpsc::Receiver<Vec<u8>>,
        output: W,
        interrupt: oneshot::Receiver<()>,
    ) -> (SessionIo<W>, mpsc::Sender<()>) {
        let (resize_tx, resize_rx) = mpsc::channel(1);
        let io = SessionIo {
            input,
            output,
            resize: resize_rx,
            size: Arc::new(|| Ok(TerminalSize::new(80, 24))),
            interrupt: Box::pin(async move {
                if interrupt.await.is_err() {
                    std::future::pending::<()>().await;
                }
            }),
        };
        (io, resize_tx)
    }

    #[tokio::test]
    async fn test_interrupt_returns_when_peer_stops_reading() {
        // The server half is never read, so the writer backs up
        let (local, _server) = tokio::io::duplex(1024);
        let ws = WebSocketStream::from_raw_socket(local, Role::Client, None).await;

        let (input_tx, input_rx) = mpsc::channel(256);
        let (interrupt_tx, interrupt_rx) = oneshot::channel();
        let (io, _resize_tx) = session_io(input_rx, tokio::io::sink(), interrupt_rx);
        let session = tokio::spawn(run_session(ws, io, Arc::new(Lifecycle::start())));

        for _ in 0..200 {
            input_tx.send(vec![b'x'; 1024]).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        interrupt_tx.send(()).unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .expect("session did not return after interrupt")
            .unwrap();
        assert_eq!(reason, DisconnectReason::Interrupted);
    }

    #[tokio::test]
    async fn test_end_of_input_reports_client_closed() {
        let (local, _server) = tokio::io::duplex(1 << 16);
        let ws = WebSocketStream::from_raw_socket(local, Role::Client, None).await;

        let (input_tx, input_rx) = mpsc::channel(4);
        let (_interrupt_tx, interrupt_rx) = oneshot::channel();
        let (output, mut narration) = tokio::io::duplex(1 << 16);
        let (io, _resize_tx) = session_io(input_rx, output, interrupt_rx);
        drop(input_tx);

        let reason = tokio::time::timeout(
            Duration::from_secs(5),
            run_session(ws, io, Arc::new(Lifecycle::start())),
        )
        .await
        .unwrap();
        assert_eq!(reason, DisconnectReason::ClientClosed);

        let mut printed = vec![0u8; 4096];
        let n = tokio::io::AsyncReadExt::read(&mut narration, &mut printed)
            .await
            .unwrap();
        let printed = String::from_utf8_lossy(&printed[..n]);
        assert!(printed.contains("Disconnected from terminal server after"));
        assert!(printed.contains("(client closed)"));
    }
}
