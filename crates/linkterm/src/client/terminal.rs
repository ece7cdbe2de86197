//! The invoking user's terminal: raw mode, size, standard input, signals.

use std::io::{self, Read};
use std::sync::Arc;

use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use protocol::TerminalSize;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use super::resize::SizeQuery;

/// Size of one standard input read.
const STDIN_BUFFER_SIZE: usize = 1024;

/// Puts the terminal in raw mode and restores the saved mode on drop.
///
/// The original mode is captured by crossterm when raw mode is entered and
/// is restored at most once, either by [`restore`](Self::restore) or by drop.
#[derive(Debug)]
pub struct RawModeGuard {
    active: bool,
}

impl RawModeGuard {
    /// Snapshot the current mode and switch to raw mode.
    pub fn enable() -> io::Result<Self> {
        enable_raw_mode()?;
        Ok(Self { active: true })
    }

    /// Restore the saved mode now. Later calls and the drop do nothing.
    pub fn restore(&mut self) -> io::Result<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        disable_raw_mode()
    }

    /// Whether the saved mode still has to be restored.
    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            tracing::warn!(error = %e, "Failed to restore terminal mode");
        }
    }
}

/// Current size of the controlling terminal.
pub fn terminal_size() -> io::Result<TerminalSize> {
    let (cols, rows) = crossterm::terminal::size()?;
    Ok(TerminalSize::new(cols, rows))
}

/// [`SizeQuery`] backed by [`terminal_size`].
pub fn size_query() -> SizeQuery {
    Arc::new(terminal_size)
}

/// Read standard input on a dedicated thread and forward chunks.
///
/// The channel closes at end of input or on a read error.
pub fn spawn_stdin_reader() -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(64);

    std::thread::spawn(move || {
        let mut stdin = io::stdin();
        let mut buf = [0u8; STDIN_BUFFER_SIZE];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "stdin read error");
                    break;
                }
            }
        }
    });

    rx
}

/// Resolves on the first SIGINT or SIGTERM.
///
/// If the handlers cannot be installed the future never resolves.
#[cfg(unix)]
pub async fn wait_for_interrupt() {
    let (mut sigint, mut sigterm) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "Failed to install interrupt handler");
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = sigint.recv() => tracing::debug!("Received SIGINT"),
        _ = sigterm.recv() => tracing::debug!("Received SIGTERM"),
    }
}

/// Resolves on the first Ctrl-C.
#[cfg(not(unix))]
pub async fn wait_for_interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to install interrupt handler");
        std::future::pending::<()>().await;
    }
    tracing::debug!("Received Ctrl-C");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_mode_guard_restores_once() {
        // Without a terminal attached, enabling fails and there is nothing to restore
        let Ok(mut guard) = RawModeGuard::enable() else {
            return;
        };
        assert!(guard.is_active());
        guard.restore().unwrap();
        assert!(!guard.is_active());
        guard.restore().unwrap();
    }

    #[test]
    fn test_size_query_matches_terminal_size() {
        let query = size_query();
        match (query(), terminal_size()) {
            (Ok(a), Ok(b)) => assert_eq!(a, b),
            (Err(_), Err(_)) => {}
            other => panic!("size query disagrees with terminal size: {:?}", other),
        }
    }
}
