//! WebSocket plumbing shared by the server and client roles.
//!
//! - [`classify`] sorts transport errors into the three classes the pumps
//!   care about
//! - [`close_message`] builds the normal-closure frame both roles send
//! - [`proxy`] dials through SOCKS5 or HTTP CONNECT proxies

pub mod proxy;

use std::borrow::Cow;
use std::io;

use tokio_tungstenite::tungstenite::error::ProtocolError as WsProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

pub use proxy::{Proxy, ProxyError};

/// Close reason sent by the server when the shell exits.
pub const SESSION_ENDED_REASON: &str = "Terminal session ended";

/// Close reason sent by the client when it leaves.
pub const CLIENT_DISCONNECTED_REASON: &str = "Client disconnected";

/// How a transport error should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The peer went away without a close handshake. Expected, logged at info.
    UnexpectedClosure,
    /// The connection was already shut down locally. Suppressed.
    AlreadyClosed,
    /// Anything else. Logged at error, once per session.
    Other,
}

/// Classify a WebSocket error.
pub fn classify(error: &WsError) -> ErrorClass {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => ErrorClass::AlreadyClosed,
        WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake) => {
            ErrorClass::UnexpectedClosure
        }
        WsError::Io(e) => classify_io(e),
        _ => ErrorClass::Other,
    }
}

fn classify_io(error: &io::Error) -> ErrorClass {
    match error.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => ErrorClass::UnexpectedClosure,
        io::ErrorKind::NotConnected => ErrorClass::AlreadyClosed,
        _ => ErrorClass::Other,
    }
}

/// A close frame with code 1000 and the given reason.
pub fn close_message(reason: &'static str) -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: Cow::Borrowed(reason),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_closed_states() {
        assert_eq!(classify(&WsError::ConnectionClosed), ErrorClass::AlreadyClosed);
        assert_eq!(classify(&WsError::AlreadyClosed), ErrorClass::AlreadyClosed);
    }

    #[test]
    fn test_classify_reset() {
        let err = WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake);
        assert_eq!(classify(&err), ErrorClass::UnexpectedClosure);

        let err = WsError::Io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(classify(&err), ErrorClass::UnexpectedClosure);

        let err = WsError::Io(io::Error::from(io::ErrorKind::BrokenPipe));
        assert_eq!(classify(&err), ErrorClass::UnexpectedClosure);
    }

    #[test]
    fn test_classify_other() {
        let err = WsError::Io(io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(classify(&err), ErrorClass::Other);

        let err = WsError::Io(io::Error::from(io::ErrorKind::InvalidData));
        assert_eq!(classify(&err), ErrorClass::Other);
    }

    #[test]
    fn test_close_message() {
        match close_message(SESSION_ENDED_REASON) {
            WsMessage::Close(Some(frame)) => {
                assert_eq!(frame.code, CloseCode::Normal);
                assert_eq!(frame.reason, "Terminal session ended");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
