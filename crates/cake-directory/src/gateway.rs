//! The directory contract the scheduler depends on.

use async_trait::async_trait;

use crate::{DirectoryError, UserPage, UserPatch, UserRecord};

/// Read and partial-update access to the user population.
///
/// Implementations must make `update` at least last-writer-wins consistent:
/// concurrent updates to the same user never interleave field-by-field.
#[async_trait]
pub trait DirectoryGateway: Send + Sync {
    /// Fetch one page of users ordered by creation time. Pages are 1-based.
    async fn fetch_page(&self, page: u32, per_page: u32) -> Result<UserPage, DirectoryError>;

    /// Fetch every user whose `last_email_sent` is unset.
    async fn fetch_unsent(&self) -> Result<Vec<UserRecord>, DirectoryError>;

    /// Apply a partial update to one user and return the stored record.
    async fn update(&self, user_id: &str, patch: &UserPatch) -> Result<UserRecord, DirectoryError>;
}
