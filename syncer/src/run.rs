//! The background scheduling loop: one enqueue ticker plus a bounded pool
//! of workers dequeuing and executing sync jobs.

use crate::error::SyncResult;
use crate::syncer::Syncer;
use catalog_core::{CatalogStore, SyncJobState};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct RunConfig {
    /// How often due services are swept into the job queue.
    pub enqueue_interval: std::time::Duration,
    /// How often an idle worker polls for a claimable job.
    pub dequeue_interval: std::time::Duration,
    /// Bounded worker pool size.
    pub workers: usize,
    /// Floor for per-service scheduling.
    pub min_sync_interval: chrono::Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            enqueue_interval: std::time::Duration::from_secs(60),
            dequeue_interval: std::time::Duration::from_secs(10),
            workers: 3,
            min_sync_interval: chrono::Duration::minutes(1),
        }
    }
}

/// Runs the scheduling loop until every task observes a `true` on the
/// shutdown channel. Emits the initial catalog snapshot before the first
/// tick.
pub async fn run<S: CatalogStore>(
    syncer: Syncer<S>,
    cfg: RunConfig,
    shutdown: watch::Receiver<bool>,
) -> SyncResult<()> {
    syncer.emit_catalog_snapshot().await?;

    let mut tasks = JoinSet::new();

    {
        let syncer = syncer.clone();
        let mut shutdown = shutdown.clone();
        tasks.spawn(async move {
            let mut tick = tokio::time::interval(cfg.enqueue_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = syncer.store().enqueue_sync_jobs(false).await {
                            warn!(error = %e, "enqueue pass failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    for worker in 0..cfg.workers {
        let syncer = syncer.clone();
        let mut shutdown = shutdown.clone();
        tasks.spawn(async move {
            let mut tick = tokio::time::interval(cfg.dequeue_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        process_next(&syncer, cfg.min_sync_interval, worker).await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    while tasks.join_next().await.is_some() {}
    info!("sync run loop stopped");
    Ok(())
}

async fn process_next<S: CatalogStore>(
    syncer: &Syncer<S>,
    min_sync_interval: chrono::Duration,
    worker: usize,
) {
    let job = match syncer.store().dequeue_sync_job().await {
        Ok(Some(job)) => job,
        Ok(None) => return,
        Err(e) => {
            warn!(worker, error = %e, "dequeue failed");
            return;
        }
    };

    info!(
        worker,
        job_id = job.id,
        service_id = job.external_service_id,
        "processing sync job"
    );

    let outcome = syncer
        .sync_external_service(job.external_service_id, min_sync_interval, |_, _| {})
        .await;

    let (state, message) = match outcome {
        Ok(()) => (SyncJobState::Completed, None),
        Err(e) => {
            warn!(job_id = job.id, error = %e, "sync job failed");
            (SyncJobState::Errored, Some(e.to_string()))
        }
    };

    if let Err(e) = syncer.store().finish_sync_job(job.id, state, message).await {
        warn!(job_id = job.id, error = %e, "failed to record job outcome");
    }
}
