//! Error types for the VK client.

use thiserror::Error;

/// Result type for VK method calls.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Failure of a single POST through a [`Transport`](crate::Transport).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Connection failed, timed out, or the body could not be read
    #[error("Network error: {0}")]
    Network(String),

    /// Body was not valid JSON
    #[error("Decode error: {0}")]
    Decode(String),
}

/// Failure of a method call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The platform answered with an `error` object
    #[error("VK error {code}: {message}")]
    Platform { code: i64, message: String },

    /// The platform answered without a `response` value
    #[error("Empty response")]
    EmptyResponse,
}

/// Misuse of the [`BatchExecutor`](crate::BatchExecutor) lifecycle.
///
/// These are programmer errors and are never retried.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Loop for requests is not running")]
    NotRunning,

    #[error("Loop for requests is already running")]
    AlreadyRunning,
}
