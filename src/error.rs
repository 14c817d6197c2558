//! Error handling module
//!
//! Defines custom error types for the Beehive transport core.

use std::io;

use thiserror::Error;

/// Main error type for the Beehive server
#[derive(Error, Debug)]
pub enum BeehiveError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Wire protocol integrity errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Session state errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Upstream service call errors
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BeehiveError {
    /// Whether the error must tear down the connection it happened on.
    ///
    /// Protocol integrity failures and transport failures are never retried
    /// in place; session state and RPC errors are left to the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BeehiveError::Protocol(_) | BeehiveError::Io(_) | BeehiveError::Network(_)
        )
    }
}

/// Network-specific errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timeout")]
    Timeout,

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Listener closed")]
    ListenerClosed,

    #[error("Write buffer full")]
    WriteBufferFull,
}

/// Wire protocol errors. All of them are fatal to the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame size too small: {size} bytes (min: {min})")]
    FrameTooSmall { size: usize, min: usize },

    #[error("frame size exceeds maximum: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("checksum verification failed: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumFailed { expected: u32, actual: u32 },

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}

/// Session state errors. Recoverable by the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session closed")]
    Closed,

    #[error("session blocked")]
    Blocked,

    #[error("session token not set")]
    TokenNotSet,

    #[error("session token already set")]
    TokenAlreadySet,

    #[error("invalid session id: {0}")]
    InvalidSessionId(String),
}

/// Errors from upstream service calls
#[derive(Error, Debug, Clone)]
pub enum RpcError {
    #[error("{service}.{method} timed out")]
    Timeout {
        service: &'static str,
        method: &'static str,
    },

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl From<reqwest::Error> for RpcError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RpcError::MalformedResponse(err.to_string())
        } else {
            RpcError::Unavailable(err.to_string())
        }
    }
}

/// Result type alias for Beehive operations
pub type Result<T> = std::result::Result<T, BeehiveError>;
