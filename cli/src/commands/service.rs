use super::{ConfigArgs, open_store};
use anyhow::{Context, Result};
use catalog_core::{CatalogStore, ExternalService, ExternalServiceKind};
use chrono::Utc;
use clap::Subcommand;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Subcommand)]
pub enum ServiceCommand {
    #[command(about = "Register a new external service")]
    Add(AddArgs),

    #[command(about = "List configured external services")]
    List(ListArgs),
}

#[derive(Debug, clap::Args)]
pub struct AddArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Service kind, e.g. GITHUB or GITLAB.
    #[arg(long)]
    pub kind: String,

    #[arg(long)]
    pub display_name: String,

    /// Path to the JSON connection config (url, token, repo selection).
    #[arg(long)]
    pub service_config: PathBuf,
}

#[derive(Debug, clap::Args)]
pub struct ListArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

pub async fn run(cmd: ServiceCommand) -> Result<()> {
    match cmd {
        ServiceCommand::Add(args) => add(args).await,
        ServiceCommand::List(args) => list(args).await,
    }
}

async fn add(args: AddArgs) -> Result<()> {
    let cfg = args.config.load()?;
    let store = open_store(&cfg).await?;

    let kind = ExternalServiceKind::from_str(&args.kind.to_uppercase())
        .map_err(|_| anyhow::anyhow!("unknown service kind: {}", args.kind))?;
    let raw = std::fs::read_to_string(&args.service_config)
        .with_context(|| format!("reading {}", args.service_config.display()))?;
    let service_config: serde_json::Value =
        serde_json::from_str(&raw).context("parsing service config JSON")?;

    let mut svc = ExternalService {
        kind,
        display_name: args.display_name,
        config: service_config,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        ..Default::default()
    };
    store.create_external_service(&mut svc).await?;

    println!("created external service {} ({})", svc.id, svc.kind);
    Ok(())
}

async fn list(args: ListArgs) -> Result<()> {
    let cfg = args.config.load()?;
    let store = open_store(&cfg).await?;

    let services = store.list_external_services().await?;
    if services.is_empty() {
        println!("no external services configured");
        return Ok(());
    }

    for svc in services {
        println!(
            "{:>6}  {:<16}  {:<24}  next sync: {}",
            svc.id,
            svc.kind.to_string(),
            svc.display_name,
            svc.next_sync_at
                .map_or_else(|| "due".to_string(), |at| at.to_rfc3339())
        );
    }
    Ok(())
}
