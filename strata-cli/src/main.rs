//! Strata CLI: triggers pipeline runs and inspects ledger, schema and gold
//! state.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Strata: exactly-once ingestion, data quality and incremental rollups
#[derive(Parser, Debug)]
#[command(name = "strata", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (holds strata.toml and relative storage paths)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the pipeline once
    Run {
        /// Only this dataset (default: all)
        #[arg(short, long)]
        dataset: Option<String>,
        /// Recompute gold windows after the run
        #[arg(long)]
        force_refresh: bool,
        /// Start of the forced refresh range (RFC 3339)
        #[arg(long, requires = "force_refresh")]
        since: Option<String>,
        /// End of the forced refresh range (RFC 3339, exclusive)
        #[arg(long, requires = "force_refresh")]
        until: Option<String>,
    },
    /// Run all datasets on an interval until Ctrl-C
    Watch {
        /// Seconds between rounds (default: schedule.interval_secs)
        #[arg(short, long)]
        interval: Option<u64>,
    },
    /// Show dataset state and recent runs
    Status {
        #[arg(short, long)]
        dataset: Option<String>,
        /// Number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Inspect and reconcile the file ledger
    Ledger {
        #[command(subcommand)]
        action: LedgerAction,
    },
    /// Inspect schema versions
    Schema {
        #[command(subcommand)]
        action: SchemaAction,
    },
    /// Inspect gold aggregates
    Gold {
        #[command(subcommand)]
        action: GoldAction,
    },
    /// Write sample sensor readings, equipment logs and quality metrics to the landing area
    Generate {
        /// First day (YYYY-MM-DD)
        #[arg(long)]
        start: Option<String>,
        #[arg(long, default_value = "7")]
        days: u32,
        /// Readings per sensor per day
        #[arg(long, default_value = "1440")]
        readings_per_day: u32,
        /// Log entries per equipment per day
        #[arg(long, default_value = "100")]
        logs: u32,
        #[arg(long, default_value = "42")]
        seed: u64,
    },
    /// Write a starter strata.toml into the workspace
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(clap::Subcommand, Debug)]
enum LedgerAction {
    /// List ledger entries of a dataset
    List {
        dataset: String,
        /// Filter by status (pending, committed, failed)
        #[arg(short, long)]
        status: Option<String>,
    },
    /// Queue a Failed file for re-ingestion
    Retry { dataset: String, file: String },
    /// List open ledger conflicts
    Conflicts {
        dataset: String,
        /// Include acknowledged conflicts
        #[arg(long)]
        all: bool,
    },
    /// Acknowledge a conflict, keeping the committed data
    Resolve { dataset: String, file: String },
}

#[derive(clap::Subcommand, Debug)]
enum SchemaAction {
    /// Show the current (or a given) schema version
    Show {
        dataset: String,
        #[arg(long)]
        version: Option<u32>,
    },
    /// List every published version with its changes
    History { dataset: String },
}

#[derive(clap::Subcommand, Debug)]
enum GoldAction {
    /// Show gold rows of a dataset
    Show {
        dataset: String,
        #[arg(short, long)]
        entity: Option<String>,
        /// hour or day
        #[arg(short, long)]
        granularity: Option<String>,
    },
    /// Show rows rejected as too late
    Late { dataset: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "strata", "strata")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "strata.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace, cli.config.as_deref()).await
}
