//! # Main — CLI Entry Point
//!
//! Routes subcommands to the monitor, config checking, history reporting and
//! slot control. Handles shared concerns: `.env` loading, logging setup and
//! the tokio runtime.
//!
//! ## Subcommands
//!
//! - `monitor`: connect to every configured client and keep history and
//!   benchmarks current until Ctrl-C (or for one pass with `--once`).
//! - `check-config`: parse and validate the config file.
//! - `history`: query stored work unit history.
//! - `control`: send fold/pause/finish to one client.
//!
//! ## Global Options
//!
//! - `--config` / `FOLDWATCH_CONFIG`: monitor TOML file.
//! - `--database-url` / `DATABASE_URL`: PostgreSQL for work unit history.
//!   Without it the monitor keeps history in memory.

mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "foldwatch", about = "Monitor Folding@home clients and track their production")]
struct Cli {
    /// Monitor configuration file
    #[arg(long, env = "FOLDWATCH_CONFIG", default_value = "foldwatch.toml")]
    config: PathBuf,

    /// PostgreSQL connection URL (or set DATABASE_URL env var)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch every enabled client until interrupted
    Monitor {
        /// Run a single connect/retrieve pass, print slot status and exit
        #[arg(long)]
        once: bool,
        /// Seconds to wait for clients to report during a `--once` pass
        #[arg(long, default_value_t = 10)]
        settle_secs: u64,
    },
    /// Validate the configuration file and print a summary
    CheckConfig,
    /// Show stored work unit history, newest first
    History {
        /// Only this client
        #[arg(long)]
        client: Option<String>,
        /// Only this slot id
        #[arg(long)]
        slot: Option<i32>,
        /// Only this project number
        #[arg(long)]
        project: Option<u32>,
        /// Only units with this result (e.g. FINISHED_UNIT, BAD_WORK_UNIT)
        #[arg(long)]
        result: Option<String>,
        /// Only units that ended on or after this date (YYYY-MM-DD or RFC 3339)
        #[arg(long)]
        since: Option<String>,
        /// Maximum rows
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Bonus basis for PPD and credit (defaults to the config's)
        #[arg(long, value_enum)]
        bonus: Option<BonusArg>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Send a slot command to one client
    Control {
        /// Client name from the config
        client: String,
        #[arg(value_enum)]
        action: ControlAction,
        /// Slot id (all slots when omitted)
        #[arg(long)]
        slot: Option<i32>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BonusArg {
    FrameTime,
    DownloadTime,
    None,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ControlAction {
    Fold,
    Pause,
    Finish,
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // LOG_FORMAT=json for log shippers, human-readable otherwise
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();

    match &cli.command {
        Commands::Monitor { once, settle_secs } => cli::run_monitor(&cli, *once, *settle_secs),
        Commands::CheckConfig => cli::run_check_config(&cli),
        Commands::History { .. } => cli::run_history(&cli),
        Commands::Control {
            client,
            action,
            slot,
        } => cli::run_control(&cli, client, *action, *slot),
    }
}
