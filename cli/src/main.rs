use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod commands;
mod config;

use commands::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => commands::serve::run(args).await,
        Commands::Migrate(args) => commands::migrate::run(args).await,
        Commands::Sync(args) => commands::sync::run(args).await,
        Commands::Check(args) => commands::check::run(args).await,
        Commands::Jobs(args) => commands::jobs::run(args).await,
        Commands::Service(cmd) => commands::service::run(cmd).await,
    }
}
