//! # LinkTerm
//!
//! A remote shell over a WebSocket. One binary plays both roles:
//!
//! - **server**: accepts WebSocket connections on `/terminal` and bridges
//!   each one to a fresh shell running on a pseudo-terminal
//! - **client**: puts the local terminal in raw mode and connects it to a
//!   server, forwarding keystrokes, output and window resizes
//!
//! ## Architecture
//!
//! ```text
//!  keyboard ─► client::session ──binary──►  server::session ─► PTY ─► shell
//!  screen   ◄─ client::session ◄─binary──   server::session ◄─ PTY ◄─┘
//!  SIGWINCH ─► client::resize  ──text "resize:c:r"──► PTY size
//! ```
//!
//! The wire contract and the disconnect bookkeeping live in the `protocol`
//! crate so both roles share one definition.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use linkterm::config::ServerConfig;
//! use linkterm::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = Server::bind(&ServerConfig::default()).await?;
//!     server.run().await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`logging`]: Tracing subscriber setup
//! - [`session`]: Shell processes on pseudo-terminals
//! - [`network`]: Error classification, close frames, proxy dialing
//! - [`server`]: Session bridge
//! - [`client`]: Terminal controller

pub mod client;
pub mod config;
pub mod logging;
pub mod network;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use client::{dial, ClientError, DialOptions, TerminalController};
pub use config::{Config, ConfigError};
pub use server::{serve_connection, Server, SessionSettings};
pub use session::{PtyProcess, SessionError, ShellCommand};
