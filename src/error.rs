//! Error types for Hostrelay.
//!
//! This module defines the error taxonomy shared by the session registry,
//! the transfer workers and the batch command executor. Workers never let
//! these escape their own boundary; they are converted into status
//! transitions and a logged cause.

use thiserror::Error;

use crate::connection::ConnectionError;
use crate::store::StoreError;

/// Result type alias for Hostrelay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Hostrelay.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Session Errors
    // ========================================================================
    /// Authentication or network failure while opening a remote session.
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// A live session is already registered under this key.
    #[error("Session already present: {channel_id}/{session_id}")]
    SessionAlreadyPresent {
        /// Client channel id
        channel_id: String,
        /// Session id within the channel
        session_id: String,
    },

    /// No live session is registered under this key.
    #[error("Session not found: {channel_id}/{session_id}")]
    SessionNotFound {
        /// Client channel id
        channel_id: String,
        /// Session id within the channel
        session_id: String,
    },

    /// The session exists but is of the other variant.
    #[error("Session {session_id} is not a {expected} session")]
    SessionVariantMismatch {
        /// Session id within the channel
        session_id: String,
        /// Expected variant name
        expected: &'static str,
    },

    /// The session was closed while the operation was in flight.
    #[error("Session closed")]
    SessionClosed,

    // ========================================================================
    // Operation Errors
    // ========================================================================
    /// Failure during an in-flight stream operation.
    #[error("Remote I/O error: {0}")]
    RemoteIo(String),

    /// Operation was forcibly terminated after its deadline.
    #[error("Operation timed out after {0:?}")]
    TimeoutExceeded(std::time::Duration),

    /// Operation was cancelled by the operator.
    #[error("Cancellation requested")]
    CancellationRequested,

    /// Host could not be resolved to connection parameters.
    #[error("Host not found: {0}")]
    HostNotFound(u64),

    /// A client channel message that cannot be acted on.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    // ========================================================================
    // Infrastructure Errors
    // ========================================================================
    /// Record store failure.
    #[error("Record store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Local IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Creates a new session-present error.
    pub fn session_present(channel_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self::SessionAlreadyPresent {
            channel_id: channel_id.into(),
            session_id: session_id.into(),
        }
    }

    /// Creates a new session-not-found error.
    pub fn session_not_found(channel_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self::SessionNotFound {
            channel_id: channel_id.into(),
            session_id: session_id.into(),
        }
    }

    /// Wraps any displayable cause as a remote I/O error.
    pub fn remote_io(cause: impl std::fmt::Display) -> Self {
        Self::RemoteIo(cause.to_string())
    }

    /// Returns true if this error ends the operation that raised it
    /// without affecting sibling operations.
    pub fn is_terminal_to_operation(&self) -> bool {
        matches!(
            self,
            Error::Connection(_)
                | Error::RemoteIo(_)
                | Error::TimeoutExceeded(_)
                | Error::CancellationRequested
        )
    }

    /// Returns the error code for CLI exit status.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Connection(_) => 3,
            Error::RemoteIo(_) => 2,
            Error::TimeoutExceeded(_) => 4,
            Error::CancellationRequested => 5,
            Error::HostNotFound(_) => 6,
            Error::Config(_) => 7,
            Error::InvalidMessage(_) => 8,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_present_message() {
        let err = Error::session_present("ch-1", "s-1");
        assert_eq!(err.to_string(), "Session already present: ch-1/s-1");
        assert!(!err.is_terminal_to_operation());
    }

    #[test]
    fn test_connection_error_converts() {
        let err: Error = ConnectionError::AuthenticationFailed("bad key".into()).into();
        assert!(err.is_terminal_to_operation());
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_timeout_and_cancel_are_distinct() {
        let timeout = Error::TimeoutExceeded(std::time::Duration::from_secs(2));
        let cancel = Error::CancellationRequested;
        assert_ne!(timeout.exit_code(), cancel.exit_code());
    }
}
