pub mod check;
pub mod jobs;
pub mod migrate;
pub mod serve;
pub mod service;
pub mod sync;

use crate::config::CatalogConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use storage::{LicenseGate, PgStore};

#[derive(Parser)]
#[command(
    name = "catalogd",
    author,
    version,
    about = "Repository catalog reconciliation daemon",
    long_about = "Ingests repository metadata from configured code hosts and reconciles it into \
                  a single canonical catalog. `serve` runs the scheduling loop; the remaining \
                  commands are operator tools."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Run the sync scheduler, workers, pruner and metrics endpoint")]
    Serve(serve::ServeArgs),

    #[command(about = "Create or update the database schema")]
    Migrate(migrate::MigrateArgs),

    #[command(about = "Sync one external service now")]
    Sync(sync::SyncArgs),

    #[command(about = "Validate connectivity of a configured external service")]
    Check(check::CheckArgs),

    #[command(about = "List sync jobs")]
    Jobs(jobs::JobsArgs),

    #[command(subcommand, about = "Manage external services")]
    Service(service::ServiceCommand),
}

/// Shared flag for every command that needs the daemon configuration.
#[derive(Debug, clap::Args)]
pub struct ConfigArgs {
    /// Path to the TOML configuration file.
    #[arg(long, env = "CATALOGD_CONFIG")]
    pub config: Option<PathBuf>,
}

impl ConfigArgs {
    pub fn load(&self) -> anyhow::Result<CatalogConfig> {
        CatalogConfig::load(self.config.as_deref())
    }
}

pub(crate) async fn open_store(cfg: &CatalogConfig) -> anyhow::Result<Arc<PgStore>> {
    let gate = Arc::new(LicenseGate::new(cfg.max_private_repos));
    let store = PgStore::connect(&cfg.database_url, gate).await?;
    Ok(Arc::new(store))
}
