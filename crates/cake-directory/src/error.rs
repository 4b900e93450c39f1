//! Error types for the user directory.

use thiserror::Error;

/// Errors that can occur when reading or updating the user directory.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading or writing a snapshot file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// User not found.
    #[error("user not found: {0}")]
    NotFound(String),

    /// Rate limited by the directory service.
    #[error("rate limited{}", match retry_after_secs {
        Some(secs) => format!(" (retry after {}s)", secs),
        None => String::new(),
    })]
    RateLimited {
        /// Seconds to wait before retrying (from Retry-After header, optional).
        retry_after_secs: Option<u64>,
    },

    /// Directory service answered with an unexpected status.
    #[error("directory returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Invalid response or request.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}
