use super::{ConfigArgs, open_store};
use anyhow::Result;
use sources::DefaultSourcer;
use std::sync::Arc;
use syncer::{NoopObserver, Syncer};
use tracing::info;

#[derive(Debug, clap::Args)]
pub struct SyncArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// External service id.
    pub service_id: i64,

    /// Queue a job for the scheduler instead of running the pass inline.
    #[arg(long)]
    pub enqueue: bool,
}

pub async fn run(args: SyncArgs) -> Result<()> {
    let cfg = args.config.load()?;
    let store = open_store(&cfg).await?;
    let sourcer = Arc::new(DefaultSourcer::new()?);
    let syncer = Syncer::new(store, sourcer, Arc::new(NoopObserver), cfg.public_only);

    if args.enqueue {
        syncer.trigger_external_service_sync(args.service_id).await?;
        println!("sync job queued for service {}", args.service_id);
        return Ok(());
    }

    syncer
        .sync_external_service(args.service_id, cfg.min_sync_interval(), |progress, done| {
            if !done {
                info!(synced = progress.synced, "sync in progress");
            }
        })
        .await?;

    println!("service {} synced", args.service_id);
    Ok(())
}
