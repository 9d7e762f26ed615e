use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::args::{Cli, Commands};

mod args;
mod commands;
mod graph;
mod image;
mod keys;
mod outputs;
mod plan;
mod readiness;
mod state;
mod templates;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    match &cli.command {
        Commands::Up => commands::up::up(&cli).await,
        Commands::Plan => commands::plan::plan(&cli).await,
        Commands::Outputs(args) => commands::outputs::outputs(&cli, args).await,
        Commands::Destroy => commands::destroy::destroy(&cli).await,
    }
}
