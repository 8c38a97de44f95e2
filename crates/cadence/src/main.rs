//! Cadence: recurring task scheduler
//!
//! Main binary with subcommands:
//! - `daemon`: Beat loop plus the observation endpoints
//! - `next-runs`: Preview upcoming run times
//! - `run`: Start a single task immediately

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod daemon;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Recurring task scheduler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler loop and the observation endpoints
    Daemon {
        /// Settings file (JSON)
        #[arg(long, env = "CADENCE_SETTINGS_FILE")]
        settings: PathBuf,

        /// Port for the event stream and JSON endpoints
        #[arg(long, env = "CADENCE_WEB_PORT", default_value = "1988")]
        port: u16,

        /// Override the tick interval in seconds
        #[arg(long)]
        tick_interval: Option<u64>,

        /// Override the task refresh interval in minutes
        #[arg(long)]
        refresh_interval: Option<u64>,
    },

    /// Print upcoming run times for a cron expression or for configured tasks
    NextRuns {
        /// Settings file (JSON); every enabled task with a trigger is listed
        #[arg(long, env = "CADENCE_SETTINGS_FILE")]
        settings: Option<PathBuf>,

        /// A single cron expression to preview instead
        #[arg(long)]
        cron: Option<String>,

        /// How many run times to print
        #[arg(long, default_value = "5")]
        count: usize,

        /// Start from this instant (RFC 3339) instead of now
        #[arg(long)]
        after: Option<DateTime<Utc>>,
    },

    /// Start one run of a task now
    Run {
        /// Settings file (JSON)
        #[arg(long, env = "CADENCE_SETTINGS_FILE")]
        settings: PathBuf,

        /// Task name
        task: String,

        /// Wait for the run to finish and print its logs
        #[arg(long)]
        wait: bool,

        /// Status poll interval in seconds while waiting
        #[arg(long, default_value = "2")]
        poll_interval: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "cadence=info,cadence_scheduler=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            settings,
            port,
            tick_interval,
            refresh_interval,
        } => daemon::run(&settings, port, tick_interval, refresh_interval).await,

        Commands::NextRuns {
            settings,
            cron,
            count,
            after,
        } => {
            commands::next_runs(
                settings.as_deref(),
                cron.as_deref(),
                count,
                after.unwrap_or_else(Utc::now),
            )
            .await
        }

        Commands::Run {
            settings,
            task,
            wait,
            poll_interval,
        } => commands::run_once(&settings, &task, wait, poll_interval).await,
    }
}
