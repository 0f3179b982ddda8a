//! Mogile CLI - Command-line interface
//!
//! Talks to a MogileFS tracker: lookups, listing, plain and chunked
//! uploads and downloads.

mod commands;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use mogile_core::tracing_setup::{CliLogLevel, init_tracing};
use mogile_core::{HostEndpoint, MogileConfig, MogileError};

#[derive(Parser)]
#[command(name = "mogile")]
#[command(about = "MogileFS command-line client")]
#[command(version)]
struct Cli {
    /// Tracker as host or host:port; repeat for failover candidates
    #[arg(short, long = "tracker", global = true)]
    trackers: Vec<String>,

    /// Domain to operate in
    #[arg(short, long, global = true)]
    domain: Option<String>,

    /// Console log level
    #[arg(long, value_enum, default_value_t = CliLogLevel::Warn, global = true)]
    log_level: CliLogLevel,

    /// Directory for a full trace of this run
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        match e.downcast_ref::<MogileError>() {
            Some(mogile_error) => eprintln!("Error: {}\n  {e:#}", mogile_error.user_message()),
            None => eprintln!("Error: {e:#}"),
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())
        .context("failed to set up logging")?;

    let mut config = MogileConfig::from_env();
    if !cli.trackers.is_empty() {
        config.tracker.hosts = cli
            .trackers
            .iter()
            .map(|tracker| tracker.parse::<HostEndpoint>())
            .collect::<Result<_, _>>()?;
    }
    if let Some(domain) = cli.domain {
        config.tracker.domain = Some(domain);
    }

    commands::handle_command(cli.command, config).await
}
