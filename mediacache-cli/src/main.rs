//! Mediacache CLI - inspect media cache storage directories.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use mediacache_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "mediacache")]
#[command(about = "Inspect torrent media cache storages")]
#[command(version)]
struct Cli {
    /// Console log level
    #[arg(long, value_enum, default_value_t = CliLogLevel::Warn, global = true)]
    log_level: CliLogLevel,

    /// Directory for the full debug log
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())?;

    commands::handle_command(cli.command).await
}
