//! PTY process management.
//!
//! A [`PtyProcess`] owns one pseudo-terminal and the shell attached to it.
//! Output is read through the separate [`PtyReader`] handle so that exactly
//! one pump reads while another writes. The child handle itself is moved
//! into a blocking waiter thread which publishes the exit status on a
//! `watch` channel; everything else observes exit through that channel.

use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use protocol::TerminalSize;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};

/// Shells tried in order when neither an explicit shell nor `$SHELL` is set.
const FALLBACK_SHELLS: &[&str] = &["bash", "zsh", "sh"];

/// Terminal type advertised to the shell when the server has none.
const DEFAULT_TERM: &str = "xterm-256color";

/// How long to wait for reaping after SIGKILL.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that can occur during PTY operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Failed to open the PTY or spawn the shell.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// The PTY has been closed.
    #[error("PTY already closed")]
    AlreadyClosed,

    /// No usable shell could be found.
    #[error("no shell found (tried $SHELL, {})", FALLBACK_SHELLS.join(", "))]
    NoShell,

    /// Failed to signal the shell process.
    #[error("failed to signal process {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shell program plus arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    program: String,
    args: Vec<String>,
}

impl ShellCommand {
    /// Create a command from a program and its arguments.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Pick the shell to run.
    ///
    /// Order of preference: `explicit`, then `$SHELL`, then the first of
    /// bash, zsh and sh found on `PATH`.
    pub fn detect(explicit: Option<&str>, args: &[String]) -> Result<Self, SessionError> {
        let env_shell = std::env::var("SHELL").ok();
        detect_with(explicit, env_shell.as_deref(), args)
    }

    /// The program to execute.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments passed to the program.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn to_builder(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.program);
        cmd.args(&self.args);
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }
        if std::env::var_os("TERM").is_none() {
            cmd.env("TERM", DEFAULT_TERM);
        }
        cmd
    }
}

fn detect_with(
    explicit: Option<&str>,
    env_shell: Option<&str>,
    args: &[String],
) -> Result<ShellCommand, SessionError> {
    let chosen = explicit
        .filter(|s| !s.is_empty())
        .or(env_shell.filter(|s| !s.is_empty()))
        .map(str::to_string)
        .or_else(|| {
            FALLBACK_SHELLS
                .iter()
                .find_map(|name| which::which(name).ok())
                .map(|path| path.to_string_lossy().into_owned())
        })
        .ok_or(SessionError::NoShell)?;

    Ok(ShellCommand::new(chosen, args.to_vec()))
}

/// Exit status of the shell as reported by the waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShellExit {
    /// Exit code, `None` when waiting on the child failed.
    pub code: Option<u32>,
}

/// How [`PtyProcess::terminate`] ended the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The shell exited on its own or after SIGTERM.
    Exited(ShellExit),
    /// The grace period ran out and SIGKILL was sent.
    Killed,
    /// The grace period ran out with no process id to signal.
    Unsignalled,
}

/// Sends termination signals to a process.
pub trait ProcessSignaller: Send + Sync {
    /// Ask the process to exit (SIGTERM).
    fn terminate(&self, pid: u32) -> io::Result<()>;

    /// Force the process to exit (SIGKILL).
    fn kill(&self, pid: u32) -> io::Result<()>;
}

/// [`ProcessSignaller`] backed by `kill(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NixSignaller;

impl NixSignaller {
    fn send(pid: u32, sig: Signal) -> io::Result<()> {
        let pid = i32::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        match signal::kill(Pid::from_raw(pid), sig) {
            // Already gone
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(io::Error::from(e)),
        }
    }
}

impl ProcessSignaller for NixSignaller {
    fn terminate(&self, pid: u32) -> io::Result<()> {
        Self::send(pid, Signal::SIGTERM)
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        Self::send(pid, Signal::SIGKILL)
    }
}

/// Read side of a PTY.
pub struct PtyReader {
    inner: Box<dyn Read + Send>,
}

impl PtyReader {
    /// Pump PTY output into a channel from a dedicated thread.
    ///
    /// The channel closes when the PTY reports EOF or an error (the shell
    /// exited or the PTY was closed) or when the receiver is dropped.
    pub fn into_channel(self, buffer_size: usize) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(64);
        let mut reader = self.inner;

        std::thread::spawn(move || {
            let mut buffer = vec![0u8; buffer_size.max(1)];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        tracing::debug!("PTY EOF");
                        break;
                    }
                    Ok(n) => {
                        if tx.blocking_send(buffer[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // EIO is how Linux reports that the slave side is gone
                        tracing::debug!(error = %e, "PTY read ended");
                        break;
                    }
                }
            }
        });

        rx
    }
}

impl Read for PtyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

/// A shell running on a pseudo-terminal.
pub struct PtyProcess {
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    size: std::sync::Mutex<TerminalSize>,
    pid: Option<u32>,
    exit: watch::Receiver<Option<ShellExit>>,
    closed: AtomicBool,
}

impl PtyProcess {
    /// Open a PTY of the given size and start `command` on it.
    ///
    /// The shell inherits this process's environment.
    pub fn spawn(
        command: &ShellCommand,
        size: TerminalSize,
    ) -> Result<(Self, PtyReader), SessionError> {
        if !size.is_valid() {
            return Err(SessionError::SpawnFailed(format!(
                "invalid terminal size {}x{}",
                size.cols, size.rows
            )));
        }

        let pair = native_pty_system()
            .openpty(pty_size(size))
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut child = pair
            .slave
            .spawn_command(command.to_builder())
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        // The child holds its own copy of the slave
        drop(pair.slave);

        let pid = child.process_id();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let (exit_tx, exit_rx) = watch::channel(None);
        std::thread::spawn(move || {
            let status = match child.wait() {
                Ok(status) => ShellExit {
                    code: Some(status.exit_code()),
                },
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to wait for shell");
                    ShellExit { code: None }
                }
            };
            tracing::debug!(pid = ?pid, code = ?status.code, "Shell exited");
            exit_tx.send_replace(Some(status));
        });

        tracing::debug!(
            shell = %command.program(),
            pid = ?pid,
            cols = size.cols,
            rows = size.rows,
            "Spawned shell"
        );

        let process = Self {
            master: Mutex::new(Some(pair.master)),
            writer: Mutex::new(Some(writer)),
            size: std::sync::Mutex::new(size),
            pid,
            exit: exit_rx,
            closed: AtomicBool::new(false),
        };

        Ok((process, PtyReader { inner: reader }))
    }

    /// Process ID of the shell, if known.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Last size applied to the PTY.
    pub fn size(&self) -> TerminalSize {
        match self.size.lock() {
            Ok(size) => *size,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Write input to the shell.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SessionError::AlreadyClosed)?;
        writer
            .write_all(data)
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    /// Apply new dimensions to the PTY.
    pub async fn resize(&self, size: TerminalSize) -> Result<(), SessionError> {
        if !size.is_valid() {
            return Err(SessionError::ResizeFailed(format!(
                "invalid terminal size {}x{}",
                size.cols, size.rows
            )));
        }

        let guard = self.master.lock().await;
        let master = guard.as_ref().ok_or(SessionError::AlreadyClosed)?;
        master
            .resize(pty_size(size))
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;

        match self.size.lock() {
            Ok(mut current) => *current = size,
            Err(poisoned) => *poisoned.into_inner() = size,
        }

        tracing::debug!(cols = size.cols, rows = size.rows, "Resized PTY");
        Ok(())
    }

    /// Close the PTY master and writer. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.writer.lock().await.take();
        self.master.lock().await.take();
    }

    /// Exit status if the shell has already exited.
    pub fn exit_status(&self) -> Option<ShellExit> {
        *self.exit.borrow()
    }

    /// A receiver that observes the shell's exit.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ShellExit>> {
        self.exit.clone()
    }

    /// Wait until the shell exits.
    pub async fn wait_exit(&self) -> ShellExit {
        wait_for_exit(&mut self.exit_watch()).await
    }

    /// Stop the shell: SIGTERM, wait up to `grace`, then SIGKILL once.
    pub async fn terminate(&self, grace: Duration) -> Termination {
        terminate_with(&NixSignaller, self.pid, self.exit_watch(), grace).await
    }
}

/// Graceful-then-forced termination over an arbitrary [`ProcessSignaller`].
///
/// Nothing is signalled when the exit has already been observed. At most one
/// forced kill is ever sent.
pub async fn terminate_with(
    signaller: &dyn ProcessSignaller,
    pid: Option<u32>,
    mut exit: watch::Receiver<Option<ShellExit>>,
    grace: Duration,
) -> Termination {
    let already = *exit.borrow();
    if let Some(status) = already {
        return Termination::Exited(status);
    }

    let Some(pid) = pid else {
        tracing::warn!("Shell process id unknown, waiting for exit without signalling");
        return match tokio::time::timeout(grace, wait_for_exit(&mut exit)).await {
            Ok(status) => Termination::Exited(status),
            Err(_) => Termination::Unsignalled,
        };
    };

    if let Err(e) = signaller.terminate(pid) {
        tracing::warn!(pid, error = %e, "Failed to send SIGTERM");
    }

    if let Ok(status) = tokio::time::timeout(grace, wait_for_exit(&mut exit)).await {
        return Termination::Exited(status);
    }

    tracing::debug!(pid, grace_ms = grace.as_millis() as u64, "Grace period elapsed, sending SIGKILL");
    if let Err(e) = signaller.kill(pid) {
        tracing::warn!(pid, error = %e, "Failed to send SIGKILL");
    }
    if tokio::time::timeout(KILL_REAP_TIMEOUT, wait_for_exit(&mut exit))
        .await
        .is_err()
    {
        tracing::warn!(pid, "Shell not reaped after SIGKILL");
    }

    Termination::Killed
}

async fn wait_for_exit(exit: &mut watch::Receiver<Option<ShellExit>>) -> ShellExit {
    match exit.wait_for(Option::is_some).await {
        Ok(status) => (*status).unwrap_or_default(),
        Err(_) => ShellExit::default(),
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Whether `path` names an existing shell binary.
pub fn shell_exists(path: &str) -> bool {
    let p = Path::new(path);
    if p.is_absolute() {
        p.exists()
    } else {
        which::which(path).is_ok()
    }
}
