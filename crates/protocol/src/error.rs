//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The address could not be turned into a WebSocket URL.
    #[error("invalid endpoint URL {url:?}: {reason}")]
    InvalidUrl {
        /// The address as normalized so far.
        url: String,
        /// Parser message.
        reason: String,
    },

    /// The URL uses a scheme other than ws or wss after normalization.
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    /// The URL does not name a host.
    #[error("endpoint URL has no host: {0}")]
    MissingHost(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::InvalidUrl {
            url: "ws://[::1".to_string(),
            reason: "invalid IPv6 address".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid endpoint URL \"ws://[::1\": invalid IPv6 address"
        );

        let err = ProtocolError::UnsupportedScheme("ftp".to_string());
        assert_eq!(err.to_string(), "unsupported URL scheme: ftp");
    }
}
