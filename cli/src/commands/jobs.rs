use super::{ConfigArgs, open_store};
use anyhow::Result;
use catalog_core::CatalogStore;

#[derive(Debug, clap::Args)]
pub struct JobsArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

pub async fn run(args: JobsArgs) -> Result<()> {
    let cfg = args.config.load()?;
    let store = open_store(&cfg).await?;

    let jobs = store.list_sync_jobs().await?;
    if jobs.is_empty() {
        println!("no sync jobs");
        return Ok(());
    }

    println!("{:>6}  {:>8}  {:<10}  {}", "job", "service", "state", "failure");
    for job in jobs {
        println!(
            "{:>6}  {:>8}  {:<10}  {}",
            job.id,
            job.external_service_id,
            job.state.to_string(),
            job.failure_message.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
