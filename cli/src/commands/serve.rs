use super::{ConfigArgs, open_store};
use anyhow::{Context, Result};
use governor::{Quota, RateLimiter};
use metrics_exporter_prometheus::PrometheusBuilder;
use sources::DefaultSourcer;
use std::num::NonZeroU32;
use std::sync::Arc;
use syncer::{MetricsObserver, RunConfig, Syncer, pruner};
use tokio::sync::watch;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

#[derive(Debug, clap::Args)]
pub struct ServeArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

pub async fn run(args: ServeArgs) -> Result<()> {
    let cfg = args.config.load()?;

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], cfg.metrics_port))
        .install()
        .context("installing metrics exporter")?;

    let store = open_store(&cfg).await?;
    store.initialize_schema().await?;

    let sourcer = Arc::new(DefaultSourcer::new()?);
    let syncer = Syncer::new(store, sourcer, Arc::new(MetricsObserver), cfg.public_only);

    let rate = NonZeroU32::new(cfg.prune.requests_per_second.max(1)).unwrap_or(NonZeroU32::MIN);
    let limiter = Arc::new(RateLimiter::direct(Quota::per_second(rate)));
    let deadline = cfg.prune_wait_deadline();

    let mut scheduler = JobScheduler::new().await?;
    let prune_syncer = syncer.clone();
    let prune_job = Job::new_async(cfg.prune.cron.as_str(), move |_id, _scheduler| {
        let syncer = prune_syncer.clone();
        let limiter = Arc::clone(&limiter);
        Box::pin(async move {
            match pruner::sync_repos_with_last_errors(&syncer, &limiter, deadline).await {
                Ok(pruned) if pruned > 0 => info!(pruned, "prune pass deleted repositories"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "prune pass failed"),
            }
        })
    })?;
    scheduler.add(prune_job).await?;
    scheduler.start().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let run_cfg = RunConfig {
        enqueue_interval: cfg.enqueue_interval(),
        dequeue_interval: cfg.dequeue_interval(),
        workers: cfg.workers,
        min_sync_interval: cfg.min_sync_interval(),
    };
    info!(
        workers = run_cfg.workers,
        metrics_port = cfg.metrics_port,
        "catalogd serving"
    );
    syncer::run(syncer, run_cfg, shutdown_rx).await?;

    scheduler.shutdown().await?;
    Ok(())
}
