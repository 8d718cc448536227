//! Common error types for Huddle.

use thiserror::Error;

/// Result type alias using Huddle's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Huddle operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on an established socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Socket open, bind or accept failed
    #[error("connection error: {0}")]
    Connection(String),

    /// Handshake rejected or malformed
    #[error("authentication error: {0}")]
    Auth(String),

    /// Encryption or decryption failed
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Malformed JSON or unexpected frame shape
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization failed on the sending side
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Application send attempted before the handshake completed
    #[error("not authenticated: {0}")]
    NotAuthenticated(String),

    /// The connection is already closed
    #[error("connection closed")]
    Closed,

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a connection error from any displayable type.
    pub fn connection(msg: impl std::fmt::Display) -> Self {
        Self::Connection(msg.to_string())
    }

    /// Create an auth error from any displayable type.
    pub fn auth(msg: impl std::fmt::Display) -> Self {
        Self::Auth(msg.to_string())
    }

    /// Create a crypto error from any displayable type.
    pub fn crypto(msg: impl std::fmt::Display) -> Self {
        Self::Crypto(msg.to_string())
    }

    /// Create a protocol error from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }

    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a not-authenticated error from any displayable type.
    pub fn not_authenticated(msg: impl std::fmt::Display) -> Self {
        Self::NotAuthenticated(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }

    /// Whether this error only spoils the frame that caused it.
    ///
    /// Undecryptable or malformed frames on an authenticated connection are
    /// dropped; the connection stays up.
    pub fn is_frame_error(&self) -> bool {
        matches!(self, Self::Crypto(_) | Self::Protocol(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            Self::Serialization(err.to_string())
        } else {
            Self::Protocol(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_errors_are_crypto_and_protocol_only() {
        assert!(Error::crypto("bad padding").is_frame_error());
        assert!(Error::protocol("bad json").is_frame_error());
        assert!(!Error::auth("nonce mismatch").is_frame_error());
        assert!(!Error::connection("refused").is_frame_error());
        assert!(!Error::Closed.is_frame_error());
    }

    #[test]
    fn test_json_syntax_errors_map_to_protocol() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_display_includes_kind() {
        assert_eq!(
            Error::auth("nonce mismatch").to_string(),
            "authentication error: nonce mismatch"
        );
        assert_eq!(Error::Closed.to_string(), "connection closed");
    }
}
