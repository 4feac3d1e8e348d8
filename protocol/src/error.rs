//! Error kinds shared by the buffer, the protocol definitions and the engine.

use thiserror::Error;

/// Convenience alias used throughout the protocol crate
pub type Result<T> = std::result::Result<T, QueryError>;

/// Everything that can go wrong while querying a single server.
///
/// Phase-level errors (`UnknownResponseType`, `ChecksumMismatch`, `SocketTimeout`,
/// ...) are recorded against one (server, phase) pair and never abort the run.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("buffer underrun: requested {requested} byte(s), {remaining} remaining")]
    BufferUnderrun { requested: usize, remaining: usize },

    #[error("response type '{0}' is not valid")]
    UnknownResponseType(String),

    #[error("{what} mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        what: &'static str,
        expected: u32,
        actual: u32,
    },

    #[error("missing required option '{0}'")]
    MissingRequiredOption(&'static str),

    #[error("no complete response after {attempts} attempt(s)")]
    SocketTimeout { attempts: u32 },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("incomplete split response: {received} of {expected} fragment(s)")]
    IncompleteResponse { received: usize, expected: usize },

    #[error("decompression failed: {0}")]
    Decompression(String),

    #[error("packet for phase '{0}' still contains an unresolved placeholder")]
    UnresolvedPlaceholder(String),

    #[error("challenge failed: {0}")]
    ChallengeFailed(String),

    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl QueryError {
    /// Builds a `Malformed` error from anything printable
    pub fn malformed(message: impl Into<String>) -> Self {
        QueryError::Malformed(message.into())
    }

    /// True for timeouts, which phase bookkeeping reports separately from failures
    pub fn is_timeout(&self) -> bool {
        matches!(self, QueryError::SocketTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_response_type_message() {
        let err = QueryError::UnknownResponseType("ffffffff7a".into());
        assert_eq!(err.to_string(), "response type 'ffffffff7a' is not valid");
    }

    #[test]
    fn test_checksum_message_is_hex() {
        let err = QueryError::ChecksumMismatch {
            what: "length",
            expected: 16,
            actual: 15,
        };
        assert_eq!(err.to_string(), "length mismatch: expected 0x10, got 0xf");
    }

    #[test]
    fn test_timeout_detection() {
        assert!(QueryError::SocketTimeout { attempts: 2 }.is_timeout());
        assert!(!QueryError::malformed("short").is_timeout());
    }
}
