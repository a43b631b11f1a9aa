//! Error types for the uplink agent
//!
//! This module defines all error types used throughout the library.

use thiserror::Error;

/// Result type alias for uplink operations
pub type Result<T> = std::result::Result<T, UplinkError>;

/// Main error type for uplink operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UplinkError {
    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Overflow store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Payload serialization error
    #[error("Payload serialization failed: {0}")]
    Serialize(String),

    /// Configuration error (invalid URL, credentials) - surfaced immediately, never retried
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Errors raised by the secure transport session
///
/// `Timeout` and `Protocol` are terminal for the current attempt but not
/// fatal to the agent; the caller routes the payload through the retry
/// manager and, on exhaustion, to the overflow store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// TCP connect failed after all immediate attempts
    #[error("Connect to {host}:{port} failed after {attempts} attempts: {reason}")]
    ConnectFailed {
        host: String,
        port: u16,
        attempts: u32,
        reason: String,
    },

    /// A per-phase deadline was exceeded
    #[error("{phase} deadline exceeded after {elapsed_ms}ms")]
    Timeout {
        phase: crate::transport::Phase,
        elapsed_ms: u64,
    },

    /// Malformed handshake or response
    #[error("Protocol failure during {phase}: {reason}")]
    Protocol {
        phase: crate::transport::Phase,
        reason: String,
    },

    /// Remote closed the connection before the exchange completed
    #[error("Peer closed connection during {phase}")]
    PeerClosed { phase: crate::transport::Phase },

    /// Hard socket error
    #[error("I/O error during {phase}: {reason}")]
    Io {
        phase: crate::transport::Phase,
        reason: String,
    },

    /// Invalid endpoint or TLS configuration
    #[error("Invalid transport configuration: {0}")]
    Config(String),
}

/// Errors raised by the durable overflow store
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Failed to open the overflow log
    #[error("Failed to open overflow log {path}: {reason}")]
    Open { path: String, reason: String },

    /// Failed to append a record
    #[error("Failed to append to overflow log: {0}")]
    Append(String),

    /// Failed to read the overflow log during a drain pass
    #[error("Failed to read overflow log: {0}")]
    Read(String),

    /// Failed to delete the overflow log after a clean drain
    #[error("Failed to delete overflow log: {0}")]
    Delete(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Phase;

    #[test]
    fn test_error_display() {
        let err = UplinkError::Transport(TransportError::Timeout {
            phase: Phase::Handshaking,
            elapsed_ms: 8012,
        });
        let msg = format!("{}", err);
        assert!(msg.contains("handshaking"));
        assert!(msg.contains("8012"));
    }

    #[test]
    fn test_error_conversion() {
        let store_err = StoreError::Append("disk full".to_string());
        let err: UplinkError = store_err.into();
        assert!(matches!(err, UplinkError::Store(_)));
    }
}
