//! Error types for the mailer.

use thiserror::Error;

/// Errors that can occur while delivering an email.
#[derive(Debug, Error)]
pub enum MailerError {
    /// No provider endpoint configured.
    #[error("email provider URL is not configured")]
    NotConfigured,

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider answered with a non-success status.
    #[error("provider rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },
}
