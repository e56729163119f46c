//! ## eddy-cli
//! **Operational interface for KFC nodes**
//! Runs an echo server for a group, drives a group with concurrent client
//! agents while reporting throughput, and checks membership files.
//!
//! ### Expectations:
//! - POSIX-compliant argument parsing
//! - Configuration from `config/eddy.yaml`, `EDDY_*` variables or `--config`
//! - Clean drain on Ctrl-C

use anyhow::anyhow;
use clap::Parser;
use eddy_config::EddyConfig;
use eddy_telemetry::logging::EventLogger;

mod commands;

use commands::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EddyConfig::load_from_path(path)?,
        None => EddyConfig::load()?,
    };
    EventLogger::init(&config.telemetry.log_level).map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Serve(args) => commands::serve(args, config).await,
        Commands::Bench(args) => commands::bench(args, config).await,
        Commands::Check(args) => commands::check(args),
    }
}
