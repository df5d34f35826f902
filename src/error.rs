//! Error types for headlink.

use thiserror::Error;

/// Main error type for all link operations.
#[derive(Debug, Error)]
pub enum LinkError {
    /// I/O error on the underlying transport stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error (invalid frame combination, reassembly mismatch, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// `send` or `end_session` on a session/service that is not ACTIVE.
    #[error("Session {0} is not active for the requested service")]
    SessionNotActive(u8),

    /// The peer answered a session start request with START_SESSION_NACK.
    #[error("Registration refused by peer")]
    RegistrationRefused,

    /// The physical connection is gone; the operation cannot complete.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Outbound queue stayed full past the configured timeout.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

/// Result type alias using LinkError.
pub type Result<T> = std::result::Result<T, LinkError>;
