//! Errors returned before a WebSocket upgrade completes
//!
//! These are plain HTTP responses; once the socket is upgraded errors are
//! reported in-band as `error` envelopes instead.

use std::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::warn;

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

#[derive(Debug)]
pub enum UpgradeError {
    MissingToken,
    InvalidToken,
    /// The request was not a valid WebSocket handshake
    BadHandshake(String),
}

impl fmt::Display for UpgradeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeError::MissingToken => write!(f, "Missing authorization token"),
            UpgradeError::InvalidToken => write!(f, "Invalid token"),
            UpgradeError::BadHandshake(msg) => write!(f, "WebSocket upgrade failed: {}", msg),
        }
    }
}

impl std::error::Error for UpgradeError {}

impl UpgradeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            UpgradeError::MissingToken | UpgradeError::InvalidToken => StatusCode::UNAUTHORIZED,
            UpgradeError::BadHandshake(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            UpgradeError::MissingToken => "MISSING_TOKEN",
            UpgradeError::InvalidToken => "INVALID_TOKEN",
            UpgradeError::BadHandshake(_) => "BAD_HANDSHAKE",
        }
    }
}

impl IntoResponse for UpgradeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        warn!(status = status.as_u16(), code = self.error_code(), "Rejected WebSocket upgrade: {}", self);

        let body = ErrorResponse {
            error: self.to_string(),
            code: self.error_code(),
        };
        (status, Json(body)).into_response()
    }
}
