//! Long-running and one-shot scheduler commands.
//!
//! The daemon runs the full schedule and the unsent sweep at start-up, then
//! hands over to the daily trigger until Ctrl-C. `sweep_once` runs a single
//! entry point and stays up only as long as the timers it armed.

use std::path::PathBuf;
use std::sync::Arc;

use miette::Result;
use tokio::sync::watch;
use tracing::{error, info};

use cake_directory::{DirectoryGateway, HttpDirectory, InMemoryDirectory};
use cake_mailer::HttpMailer;
use cake_scheduler::{BirthdayScheduler, SchedulerConfig, SystemClock, TimerScheduler};

use crate::SweepKind;

/// Where users are read from.
pub enum DirectorySource {
    /// The user-management REST service.
    Http { url: String, token: Option<String> },
    /// A JSON array of users on disk.
    File { path: PathBuf, write_back: bool },
}

/// Configuration for the daemon.
pub struct DaemonConfig {
    pub directory: DirectorySource,
    /// Email provider base URL. Without it every send fails and is retried.
    pub email_provider_url: Option<String>,
    pub scheduler: SchedulerConfig,
}

async fn open_directory(source: &DirectorySource) -> Result<Arc<dyn DirectoryGateway>> {
    match source {
        DirectorySource::Http { url, token } => {
            info!(url = %url, "using user-management service");
            let mut client = HttpDirectory::new(url.as_str());
            if let Some(token) = token {
                client = client.with_token(token.as_str());
            }
            Ok(Arc::new(client))
        }
        DirectorySource::File { path, write_back } => {
            let mut directory = InMemoryDirectory::load(path)
                .await
                .map_err(|e| miette::miette!("failed to load {}: {}", path.display(), e))?;
            if *write_back {
                directory = directory.with_snapshot(path);
            }
            Ok(Arc::new(directory))
        }
    }
}

/// Wire up the scheduler against the configured collaborators.
async fn build(config: DaemonConfig, shutdown_rx: watch::Receiver<bool>) -> Result<BirthdayScheduler> {
    let directory = open_directory(&config.directory).await?;

    if config.email_provider_url.is_none() {
        error!("EMAIL_PROVIDER_API_URL is not set; every delivery will fail");
    }
    let mailer = Arc::new(HttpMailer::new(config.email_provider_url));

    let timers = TimerScheduler::with_shutdown(Arc::new(SystemClock), shutdown_rx);
    BirthdayScheduler::new(directory, mailer, timers, config.scheduler)
        .map_err(|e| miette::miette!("{}", e))
}

/// Flip `shutdown_tx` on Ctrl-C.
fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });
}

/// Run the daemon until Ctrl-C.
pub async fn run(config: DaemonConfig) -> Result<()> {
    info!("starting cake daemon");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);

    let scheduler = build(config, shutdown_rx.clone()).await?;
    info!(
        max_retry_count = scheduler.config().max_retry_count,
        page_size = scheduler.config().page_size,
        send_time = %scheduler.config().send_time,
        trigger = %scheduler.config().daily_trigger,
        host_zone = %scheduler.config().host_zone,
        "scheduler configured"
    );

    if let Err(e) = scheduler.schedule_all_birthdays().await {
        error!(error = %e, "initial birthday schedule failed");
    }
    if let Err(e) = scheduler.retry_all_unsent_emails().await {
        error!(error = %e, "initial unsent email sweep failed");
    }

    let trigger_handle = scheduler.start_daily_trigger();

    // Wait for shutdown signal
    let mut main_shutdown_rx = shutdown_rx;
    loop {
        if main_shutdown_rx.changed().await.is_err() || *main_shutdown_rx.borrow() {
            break;
        }
    }

    info!(
        pending = scheduler.timers().pending(),
        "shutting down, dropping pending timers"
    );
    let _ = trigger_handle.await;
    scheduler.timers().wait_idle().await;

    info!("daemon shut down gracefully");
    Ok(())
}

/// Run one entry point, then wait for its timers or Ctrl-C.
pub async fn sweep_once(config: DaemonConfig, kind: SweepKind) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);

    let scheduler = build(config, shutdown_rx).await?;

    let report = match kind {
        SweepKind::Full => scheduler.schedule_all_birthdays().await,
        SweepKind::Daily => scheduler.daily_birthday_check().await,
        SweepKind::Unsent => scheduler.retry_all_unsent_emails().await,
    }
    .map_err(|e| miette::miette!("{:?} sweep failed: {}", kind, e))?;

    let timers = scheduler.timers();
    if let Some(last) = timers.pending_timers().last() {
        info!(
            armed = report.armed,
            pending = timers.pending(),
            last = %last.at,
            "waiting for armed timers"
        );
    }
    // Shutdown drops every unfired timer, so this returns on Ctrl-C too.
    timers.wait_idle().await;

    info!(
        visited = report.visited,
        armed = report.armed,
        skipped = report.skipped,
        rejected = report.rejected,
        "sweep finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn file_config(path: PathBuf) -> DaemonConfig {
        DaemonConfig {
            directory: DirectorySource::File {
                path,
                write_back: true,
            },
            email_provider_url: None,
            scheduler: SchedulerConfig {
                retry_interval: Duration::from_millis(10),
                max_retry_count: 1,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_missing_users_file() {
        let result = open_directory(&DirectorySource::File {
            path: PathBuf::from("/nonexistent/cake/users.json"),
            write_back: false,
        })
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unsent_sweep_without_mailer_exhausts_unsent_users() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        std::fs::write(
            &path,
            r#"[{"id":"u1","email":"u1@example.com","firstName":"Ann","lastName":"Lee",
                "dateOfBirth":"1990-01-01","location":"UTC","retryCount":0}]"#,
        )
        .unwrap();

        let config = file_config(path.clone());
        sweep_once(config, SweepKind::Unsent).await.unwrap();

        let stored = InMemoryDirectory::load(&path).await.unwrap();
        let user = stored.get("u1").await.unwrap();
        assert_eq!(user.retry_count, 0);
        assert!(user.last_email_sent.is_some());
    }
}
