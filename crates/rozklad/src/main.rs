//! Rozklad: local mirror of the university schedule
//!
//! Main binary with subcommands:
//! - `daemon`: Scheduled refreshes plus the read/refresh HTTP API
//! - `refresh`: One refresh operation, then exit

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use miette::Result;
use rozklad_scheduler::Cadence;
use rozklad_sync::{DEFAULT_LESSON_CONCURRENCY, RefreshOp, StalePolicy};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod daemon;

use daemon::{DaemonConfig, StackConfig};

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
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
#[command(name = "rozklad")]
#[command(about = "Local mirror of the university schedule", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every command that touches the mirror.
#[derive(Args)]
struct StackArgs {
    /// SQLite database path
    #[arg(long, env = "ROZKLAD_DB_PATH", default_value = "rozklad.db")]
    db_path: PathBuf,

    /// Upstream curriculum API endpoint
    #[arg(long, env = "ROZKLAD_BASE_URL", default_value = rozklad_source::DEFAULT_BASE_URL)]
    base_url: String,

    /// What to do with rows that disappeared upstream: prune or retain-and-flag
    #[arg(long, env = "ROZKLAD_STALE_POLICY", default_value = "retain-and-flag")]
    stale_policy: StalePolicy,

    /// Maximum concurrent lesson fetches
    #[arg(long, env = "ROZKLAD_LESSON_CONCURRENCY", default_value_t = DEFAULT_LESSON_CONCURRENCY)]
    lesson_concurrency: usize,

    /// Upstream request timeout in seconds
    #[arg(long, env = "ROZKLAD_FETCH_TIMEOUT", default_value = "30")]
    fetch_timeout: u64,
}

impl From<StackArgs> for StackConfig {
    fn from(args: StackArgs) -> Self {
        StackConfig {
            db_path: args.db_path,
            base_url: args.base_url,
            stale_policy: args.stale_policy,
            lesson_concurrency: args.lesson_concurrency,
            fetch_timeout: args.fetch_timeout,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run scheduled refreshes and serve the HTTP API
    Daemon {
        #[command(flatten)]
        stack: StackArgs,

        /// Address the HTTP API listens on
        #[arg(long, env = "ROZKLAD_LISTEN", default_value = "0.0.0.0:8080")]
        listen: String,

        /// Main cadence of the faculty refresh (`6h`, `daily@03:00`, `sun@02:00`)
        #[arg(long, env = "ROZKLAD_FACULTIES_CADENCE", default_value = "sun@02:00")]
        faculties_cadence: Cadence,

        /// Main cadence of the group refresh
        #[arg(long, env = "ROZKLAD_GROUPS_CADENCE", default_value = "sun@02:30")]
        groups_cadence: Cadence,

        /// Main cadence of the teacher refresh
        #[arg(long, env = "ROZKLAD_TEACHERS_CADENCE", default_value = "sun@03:00")]
        teachers_cadence: Cadence,

        /// Main cadence of the lesson refresh
        #[arg(long, env = "ROZKLAD_LESSONS_CADENCE", default_value = "daily@04:00")]
        lessons_cadence: Cadence,

        /// Retry cadence armed for a task after it fails
        #[arg(long, env = "ROZKLAD_RETRY_CADENCE", default_value = "10m")]
        retry_cadence: Cadence,

        /// Lifetime of a refresh guard in seconds
        #[arg(long, env = "ROZKLAD_GUARD_TTL", default_value = "900")]
        guard_ttl: u64,

        /// Lifetime of cached projections in seconds
        #[arg(long, env = "ROZKLAD_CACHE_TTL", default_value = "3600")]
        cache_ttl: u64,

        /// Refresh everything once at startup, in dependency order.
        /// Accepts "1", "true", "yes", or "on".
        #[arg(long, env = "ROZKLAD_REFRESH_ON_START", value_parser = parse_bool_env, default_value = "true")]
        refresh_on_start: bool,
    },

    /// Run one refresh and exit
    Refresh {
        #[command(flatten)]
        stack: StackArgs,

        /// What to refresh: faculties, groups, teachers, lessons, all or group:<id>
        #[arg(value_name = "SCOPE", default_value = "all")]
        scope: RefreshOp,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| {
                "rozklad=info,rozklad_sync=info,rozklad_scheduler=info,rozklad_store=info"
                    .to_string()
            }),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            stack,
            listen,
            faculties_cadence,
            groups_cadence,
            teachers_cadence,
            lessons_cadence,
            retry_cadence,
            guard_ttl,
            cache_ttl,
            refresh_on_start,
        } => {
            daemon::run(DaemonConfig {
                stack: stack.into(),
                listen,
                faculties_cadence,
                groups_cadence,
                teachers_cadence,
                lessons_cadence,
                retry_cadence,
                guard_ttl,
                cache_ttl,
                refresh_on_start,
            })
            .await
        }

        Commands::Refresh { stack, scope } => daemon::refresh_once(stack.into(), scope).await,
    }
}
