//! Shell processes on pseudo-terminals.

pub mod pty;

pub use pty::{
    shell_exists, terminate_with, NixSignaller, ProcessSignaller, PtyProcess, PtyReader,
    SessionError, ShellCommand, ShellExit, Termination,
};
