//! In-process directory, optionally snapshotted to a JSON file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{DirectoryError, DirectoryGateway, UserPage, UserPatch, UserRecord};

/// Directory gateway holding every user in memory, in creation order.
///
/// Writes take the lock for the whole read-modify-write, so concurrent updates
/// to one user are last-writer-wins.
pub struct InMemoryDirectory {
    users: RwLock<Vec<UserRecord>>,
    snapshot: Option<PathBuf>,
}

impl InMemoryDirectory {
    /// Create a directory holding `users`.
    pub fn new(mut users: Vec<UserRecord>) -> Self {
        // Stable: records without a creation time lead, in their given order.
        users.sort_by_key(|u| u.created_at);
        Self {
            users: RwLock::new(users),
            snapshot: None,
        }
    }

    /// Load users from a JSON array file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let path = path.as_ref();
        let raw = tokio::fs::read(path).await?;
        let users: Vec<UserRecord> = serde_json::from_slice(&raw)?;
        info!(count = users.len(), path = %path.display(), "loaded users");
        Ok(Self::new(users))
    }

    /// Rewrite `path` with every record after each update.
    pub fn with_snapshot(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot = Some(path.into());
        self
    }

    /// Copy of every stored record.
    pub async fn users(&self) -> Vec<UserRecord> {
        self.users.read().await.clone()
    }

    /// Copy of one stored record.
    pub async fn get(&self, user_id: &str) -> Option<UserRecord> {
        self.users
            .read()
            .await
            .iter()
            .find(|u| u.id == user_id)
            .cloned()
    }

    async fn write_snapshot(&self, path: &Path, users: &[UserRecord]) -> Result<(), DirectoryError> {
        let json = serde_json::to_vec_pretty(users)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl DirectoryGateway for InMemoryDirectory {
    async fn fetch_page(&self, page: u32, per_page: u32) -> Result<UserPage, DirectoryError> {
        if page == 0 || per_page == 0 {
            return Err(DirectoryError::InvalidResponse(format!(
                "page ({}) and per_page ({}) must be positive",
                page, per_page
            )));
        }

        let users = self.users.read().await;
        let total = users.len() as u64;
        let last_page = total.div_ceil(u64::from(per_page)) as u32;
        let skip = (page as usize - 1).saturating_mul(per_page as usize);
        let records = users
            .iter()
            .skip(skip)
            .take(per_page as usize)
            .cloned()
            .collect();

        Ok(UserPage {
            records,
            total,
            page,
            last_page,
        })
    }

    async fn fetch_unsent(&self) -> Result<Vec<UserRecord>, DirectoryError> {
        Ok(self
            .users
            .read()
            .await
            .iter()
            .filter(|u| u.last_email_sent.is_none())
            .cloned()
            .collect())
    }

    async fn update(&self, user_id: &str, patch: &UserPatch) -> Result<UserRecord, DirectoryError> {
        let mut users = self.users.write().await;
        let user = users
            .iter_mut()
            .find(|u| u.id == user_id)
            .ok_or_else(|| DirectoryError::NotFound(user_id.to_string()))?;

        patch.apply(user);
        let updated = user.clone();
        debug!(user_id, retry_count = updated.retry_count, "updated user");

        if let Some(path) = &self.snapshot
            && let Err(e) = self.write_snapshot(path, &users).await
        {
            warn!(path = %path.display(), error = %e, "failed to write directory snapshot");
        }

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn user(id: &str, sent: bool) -> UserRecord {
        UserRecord {
            id: id.to_string(),
            email: format!("{}@example.com", id),
            first_name: "Test".to_string(),
            last_name: id.to_string(),
            date_of_birth: "1990-06-15".to_string(),
            location: "UTC".to_string(),
            last_email_sent: sent.then(|| Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            retry_count: 0,
            created_at: None,
        }
    }

    fn population(n: usize) -> Vec<UserRecord> {
        (0..n).map(|i| user(&format!("u{}", i), false)).collect()
    }

    #[tokio::test]
    async fn test_pages_cover_population() {
        let directory = InMemoryDirectory::new(population(10));

        let first = directory.fetch_page(1, 4).await.unwrap();
        assert_eq!(first.records.len(), 4);
        assert_eq!(first.total, 10);
        assert_eq!(first.last_page, 3);
        assert!(first.has_more());

        let last = directory.fetch_page(3, 4).await.unwrap();
        assert_eq!(last.records.len(), 2);
        assert_eq!(last.records[0].id, "u8");
        assert!(!last.has_more());

        let beyond = directory.fetch_page(4, 4).await.unwrap();
        assert!(beyond.records.is_empty());
    }

    #[tokio::test]
    async fn test_empty_directory_reports_no_pages() {
        let directory = InMemoryDirectory::new(Vec::new());
        let page = directory.fetch_page(1, 4).await.unwrap();

        assert!(page.records.is_empty());
        assert_eq!(page.last_page, 0);
        assert!(!page.has_more());
    }

    #[tokio::test]
    async fn test_zero_page_rejected() {
        let directory = InMemoryDirectory::new(population(1));
        assert!(directory.fetch_page(0, 4).await.is_err());
        assert!(directory.fetch_page(1, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_pages_ordered_by_creation() {
        let mut late = user("late", false);
        late.created_at = Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
        let mut early = user("early", false);
        early.created_at = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());

        let directory = InMemoryDirectory::new(vec![late, early]);
        let page = directory.fetch_page(1, 4).await.unwrap();

        assert_eq!(page.records[0].id, "early");
        assert_eq!(page.records[1].id, "late");
    }

    #[tokio::test]
    async fn test_fetch_unsent_filters_sent_users() {
        let directory =
            InMemoryDirectory::new(vec![user("a", true), user("b", false), user("c", false)]);

        let unsent = directory.fetch_unsent().await.unwrap();
        let ids: Vec<_> = unsent.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_update_unknown_user() {
        let directory = InMemoryDirectory::new(population(1));
        let result = directory.update("nobody", &UserPatch::retrying(1)).await;
        assert!(matches!(result, Err(DirectoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        tokio::fs::write(&path, serde_json::to_vec(&population(2)).unwrap())
            .await
            .unwrap();

        let directory = InMemoryDirectory::load(&path).await.unwrap().with_snapshot(&path);
        directory.update("u1", &UserPatch::retrying(3)).await.unwrap();

        let reloaded = InMemoryDirectory::load(&path).await.unwrap();
        assert_eq!(reloaded.get("u1").await.unwrap().retry_count, 3);
        assert_eq!(reloaded.get("u0").await.unwrap().retry_count, 0);
    }
}
