//! Error classification for Robot API calls.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors raised by the Robot API client.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RobotError {
    /// Raised when the client configuration is incomplete.
    #[error("robot configuration error: {0}")]
    Config(String),
    /// Raised when the remote object does not exist.
    #[error("robot: {path} not found")]
    NotFound {
        /// Request path that returned 404.
        path: String,
    },
    /// Raised when the API returns a structured error body.
    #[error("robot: {code}: {message} (HTTP {status})")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Provider error code such as `INVALID_INPUT`.
        code: String,
        /// Provider error message.
        message: String,
    },
    /// Raised when the API returns an unexpected status without a
    /// recognisable error body.
    #[error("robot: unexpected {status}: {body}")]
    UnexpectedStatus {
        /// HTTP status code.
        status: u16,
        /// Raw response body.
        body: String,
    },
    /// Raised when the request cannot be sent or the response cannot be read.
    #[error("robot request {method} {path} failed: {message}")]
    Transport {
        /// HTTP method.
        method: String,
        /// Request path.
        path: String,
        /// Error reported by the HTTP client.
        message: String,
    },
    /// Raised when a successful response cannot be decoded.
    #[error("robot response for {path} could not be decoded: {message}")]
    Decode {
        /// Request path.
        path: String,
        /// Decoder error message.
        message: String,
    },
}

impl RobotError {
    /// Returns `true` when the remote object is gone.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<ConfigError> for RobotError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}
