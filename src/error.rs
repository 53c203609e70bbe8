//! Crate-level error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors surfaced by the synchronization subsystem.
///
/// Wire-level classification of individual stream frames lives in
/// [`crate::streaming::frame::ErrorKind`]; this enum is what crosses the
/// crate boundary.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The server rejected the request (HTTP 4xx).
    #[error("client error: {0}")]
    Client(String),

    /// The server failed while serving the request (HTTP 5xx).
    #[error("server error: {0}")]
    Server(String),

    /// Connection-level failure before any HTTP semantics were available.
    #[error("transport failure: {0}")]
    Transport(String),

    /// No endpoint is registered under the requested name.
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// Anything non-HTTP or unclassifiable.
    #[error("{0}")]
    Unknown(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
