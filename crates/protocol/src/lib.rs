//! # LinkTerm Protocol Library
//!
//! This crate holds the parts of LinkTerm that both roles agree on and that
//! do not touch a socket or a terminal:
//!
//! - **Control Messages**: the resize side-channel multiplexed next to raw
//!   terminal bytes on one WebSocket connection
//! - **Endpoint Addressing**: normalization of user-supplied addresses into
//!   WebSocket URLs, the fixed session path, and client identification
//! - **Lifecycle**: the once-only disconnect narration with a human-readable
//!   session duration, and the per-session `Active → Closing → Closed` state
//!
//! ## Wire Layout
//!
//! ```text
//! ┌──────────────┬────────┬──────────────────────────────┐
//! │ Direction    │ Frame  │ Payload                      │
//! ├──────────────┼────────┼──────────────────────────────┤
//! │ client→server│ text   │ resize:<cols>:<rows>         │
//! │ client→server│ binary │ terminal input               │
//! │ client→server│ text   │ terminal input (older peers) │
//! │ server→client│ binary │ PTY output                   │
//! │ either       │ close  │ normal closure               │
//! └──────────────┴────────┴──────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{decode_client_frame, encode_resize, ControlMessage, Frame, TerminalSize};
//!
//! let text = encode_resize(TerminalSize::new(120, 40));
//! assert_eq!(text, "resize:120:40");
//!
//! let decoded = decode_client_frame(Frame::Text(text));
//! assert_eq!(decoded, Some(ControlMessage::Resize(TerminalSize::new(120, 40))));
//! ```
//!
//! ## Modules
//!
//! - [`control`]: Control message encoding and decoding
//! - [`endpoint`]: URL normalization, client identification
//! - [`lifecycle`]: Disconnect reasons, duration formatting, session state
//! - [`error`]: Error types

pub mod control;
pub mod endpoint;
pub mod error;
pub mod lifecycle;

pub use control::{
    decode_client_frame, encode_resize, parse_resize, ControlMessage, Frame, TerminalSize,
    RESIZE_PREFIX,
};
pub use endpoint::{client_ip, normalize_url, platform, user_agent, DEFAULT_PORT, TERMINAL_PATH};
pub use error::{ProtocolError, Result};
pub use lifecycle::{format_duration, DisconnectReason, Lifecycle, SessionPhase, SessionState};
