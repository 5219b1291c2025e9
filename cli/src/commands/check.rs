use super::{ConfigArgs, open_store};
use anyhow::Result;
use catalog_core::CatalogStore;
use sources::{DefaultSourcer, Sourcer};

#[derive(Debug, clap::Args)]
pub struct CheckArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// External service id.
    pub service_id: i64,
}

pub async fn run(args: CheckArgs) -> Result<()> {
    let cfg = args.config.load()?;
    let store = open_store(&cfg).await?;
    let svc = store.external_service(args.service_id).await?;

    let sourcer = DefaultSourcer::new()?;
    let source = sourcer.source_for(&svc)?;
    source.check_connection().await?;
    println!("{} ({}): connection ok", svc.display_name, svc.kind);

    if let Some(probe) = source.version_probe()
        && let Ok(version) = probe.version().await
    {
        println!("host version: {version}");
    }

    Ok(())
}
