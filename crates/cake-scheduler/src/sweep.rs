//! Population sweeps over the user directory.

use std::sync::Arc;

use tracing::debug;

use cake_directory::{DirectoryGateway, UserRecord};

use crate::{SchedulerError, SweepReport, UserDisposition};

/// Pages through the directory and hands every user to an action.
///
/// Pages are fetched one after another. Actions only arm timers, so a slow
/// user never holds up the next page.
#[derive(Clone)]
pub struct SweepDriver {
    directory: Arc<dyn DirectoryGateway>,
    page_size: u32,
}

impl SweepDriver {
    pub fn new(directory: Arc<dyn DirectoryGateway>, page_size: u32) -> Self {
        Self {
            directory,
            page_size,
        }
    }

    /// Visit every user, page 1 onward.
    ///
    /// Stops on an empty page or once the last reported page is reached. A
    /// failed fetch aborts the sweep.
    pub async fn sweep<F>(&self, mut per_user: F) -> Result<SweepReport, SchedulerError>
    where
        F: FnMut(UserRecord) -> UserDisposition,
    {
        let mut report = SweepReport::default();
        let mut page = 1;

        loop {
            let result = self.directory.fetch_page(page, self.page_size).await?;
            report.pages += 1;
            debug!(
                page,
                last_page = result.last_page,
                count = result.records.len(),
                "sweeping page"
            );

            if result.records.is_empty() {
                break;
            }
            for user in result.records {
                report.record(per_user(user));
            }
            if page >= result.last_page {
                break;
            }
            page += 1;
        }

        Ok(report)
    }

    /// Visit every user the directory has never emailed, in one fetch.
    pub async fn sweep_unsent<F>(&self, mut per_user: F) -> Result<SweepReport, SchedulerError>
    where
        F: FnMut(UserRecord) -> UserDisposition,
    {
        let users = self.directory.fetch_unsent().await?;
        let mut report = SweepReport::default();
        debug!(count = users.len(), "sweeping unsent users");

        for user in users {
            report.record(per_user(user));
        }
        Ok(report)
    }
}
