//! Error types for the scheduler.

use thiserror::Error;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Directory read or update failed.
    #[error("directory error: {0}")]
    Directory(#[from] cake_directory::DirectoryError),

    /// User's location is not a known timezone.
    #[error("invalid timezone for user {user_id}: {location:?}")]
    InvalidTimezone { user_id: String, location: String },

    /// User's birth date could not be parsed.
    #[error("invalid birth date for user {user_id}: {value:?}")]
    InvalidBirthDate { user_id: String, value: String },

    /// Recurring trigger expression could not be parsed.
    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),

    /// Invalid scheduler configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
