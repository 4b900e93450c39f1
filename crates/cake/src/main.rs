//! cake: birthday email scheduler
//!
//! Main binary with subcommands:
//! - `daemon`: schedule everything at start, then run the daily trigger
//! - `sweep`: run one entry point and wait for its timers (for external cron)
//! - `next-send`: print when a birthday email would go out

use std::path::PathBuf;

use chrono::{NaiveTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cake_scheduler::calendar::{parse_birth_date, parse_timezone};
use cake_scheduler::{
    BirthdaySchedule, DEFAULT_MAX_RETRY_COUNT, DEFAULT_PAGE_SIZE, DailyTrigger, HostZone,
    SchedulerConfig,
};

mod daemon;

use daemon::{DaemonConfig, DirectorySource};

/// Parse boolean from environment variable, accepting common truthy values.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

#[derive(Parser)]
#[command(name = "cake")]
#[command(about = "Birthday email scheduler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until Ctrl-C
    Daemon {
        #[command(flatten)]
        service: ServiceArgs,
    },

    /// Run one sweep, then wait for the timers it armed
    Sweep {
        /// Which sweep to run
        #[arg(value_enum)]
        kind: SweepKind,

        #[command(flatten)]
        service: ServiceArgs,
    },

    /// Print the next send instant for a birth date
    NextSend {
        /// Birth date (YYYY-MM-DD)
        #[arg(long)]
        birth_date: String,

        /// IANA timezone, e.g. America/Sao_Paulo
        #[arg(long)]
        timezone: String,

        /// Local hour emails go out
        #[arg(long, env = "CAKE_SEND_HOUR", default_value = "9", value_parser = clap::value_parser!(u32).range(0..24))]
        send_hour: u32,
    },
}

/// Which entry point `cake sweep` runs.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum SweepKind {
    /// Arm this year's send for every user
    Full,
    /// Arm today's sends
    Daily,
    /// Retry overdue sends for never-emailed users
    Unsent,
}

/// Settings shared by `daemon` and `sweep`.
#[derive(Args)]
struct ServiceArgs {
    /// User-management service URL
    #[arg(long, env = "CAKE_DIRECTORY_URL", conflicts_with = "users_file")]
    directory_url: Option<String>,

    /// Bearer token for the user-management service
    #[arg(long, env = "CAKE_DIRECTORY_TOKEN", hide_env_values = true)]
    directory_token: Option<String>,

    /// JSON file of users to use instead of the service
    #[arg(long, env = "CAKE_USERS_FILE")]
    users_file: Option<PathBuf>,

    /// Write delivery state back into the users file.
    /// Accepts "1", "true", "yes", or "on".
    #[arg(long, env = "CAKE_WRITE_BACK", value_parser = parse_bool_env, default_value = "false")]
    write_back: bool,

    /// Email provider base URL; `/send-email` is appended
    #[arg(long, env = "EMAIL_PROVIDER_API_URL")]
    email_provider_url: Option<String>,

    /// Retries after the first failed send
    #[arg(long, env = "MAX_RETRY_COUNT", default_value_t = DEFAULT_MAX_RETRY_COUNT)]
    max_retry_count: u32,

    /// Users per directory page
    #[arg(long, env = "CAKE_PAGE_SIZE", default_value_t = DEFAULT_PAGE_SIZE, value_parser = clap::value_parser!(u32).range(1..))]
    page_size: u32,

    /// Seconds between delivery attempts
    #[arg(long, env = "CAKE_RETRY_INTERVAL_SECS", default_value = "3600")]
    retry_interval_secs: u64,

    /// Local hour emails go out
    #[arg(long, env = "CAKE_SEND_HOUR", default_value = "9", value_parser = clap::value_parser!(u32).range(0..24))]
    send_hour: u32,

    /// Seconds before a delivery attempt is abandoned
    #[arg(long, env = "CAKE_ATTEMPT_TIMEOUT_SECS", default_value = "30")]
    attempt_timeout_secs: u64,

    /// When the daily check runs (MIN HOUR * * *)
    #[arg(long, env = "CAKE_DAILY_CRON", default_value = "0 0 * * *")]
    daily_cron: String,

    /// Zone the daily cron is read in (defaults to the system zone)
    #[arg(long, env = "CAKE_HOST_TIMEZONE")]
    host_timezone: Option<String>,
}

impl ServiceArgs {
    fn into_config(self) -> Result<DaemonConfig> {
        let directory = match (self.directory_url, self.users_file) {
            (Some(url), None) => DirectorySource::Http {
                url,
                token: self.directory_token,
            },
            (None, Some(path)) => DirectorySource::File {
                path,
                write_back: self.write_back,
            },
            _ => {
                return Err(miette::miette!(
                    "set exactly one of --directory-url (CAKE_DIRECTORY_URL) or --users-file"
                ));
            }
        };

        let daily_trigger: DailyTrigger = self
            .daily_cron
            .parse()
            .map_err(|e| miette::miette!("{}", e))?;

        let host_zone = match self.host_timezone.as_deref() {
            None => HostZone::Local,
            Some(name) => HostZone::Named(
                parse_timezone(name)
                    .ok_or_else(|| miette::miette!("unknown host timezone: {}", name))?,
            ),
        };

        Ok(DaemonConfig {
            directory,
            email_provider_url: self.email_provider_url,
            scheduler: SchedulerConfig {
                max_retry_count: self.max_retry_count,
                retry_interval: std::time::Duration::from_secs(self.retry_interval_secs),
                send_time: send_time(self.send_hour)?,
                page_size: self.page_size,
                attempt_timeout: std::time::Duration::from_secs(self.attempt_timeout_secs),
                daily_trigger,
                host_zone,
            },
        })
    }
}

fn send_time(hour: u32) -> Result<NaiveTime> {
    NaiveTime::from_hms_opt(hour, 0, 0).ok_or_else(|| miette::miette!("invalid send hour: {}", hour))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "cake=info,cake_scheduler=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon { service } => daemon::run(service.into_config()?).await,

        Commands::Sweep { kind, service } => daemon::sweep_once(service.into_config()?, kind).await,

        Commands::NextSend {
            birth_date,
            timezone,
            send_hour,
        } => next_send(&birth_date, &timezone, send_hour),
    }
}

/// Print the next send instant, in UTC and in the given zone.
fn next_send(birth_date: &str, timezone: &str, send_hour: u32) -> Result<()> {
    let birth = parse_birth_date(birth_date)
        .ok_or_else(|| miette::miette!("invalid birth date: {}", birth_date))?;
    let tz = parse_timezone(timezone).ok_or_else(|| miette::miette!("unknown timezone: {}", timezone))?;

    let schedule = BirthdaySchedule::new(birth, tz);
    let at = schedule.next_send(Utc::now(), send_time(send_hour)?);

    println!("{}", at.to_rfc3339());
    println!("{} ({})", at.with_timezone(&tz).format("%Y-%m-%d %H:%M %Z"), tz.name());
    Ok(())
}
