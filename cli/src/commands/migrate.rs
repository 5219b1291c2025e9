use super::{ConfigArgs, open_store};
use anyhow::Result;
use tracing::info;

#[derive(Debug, clap::Args)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

pub async fn run(args: MigrateArgs) -> Result<()> {
    let cfg = args.config.load()?;
    let store = open_store(&cfg).await?;
    store.initialize_schema().await?;
    info!("schema up to date");
    Ok(())
}
