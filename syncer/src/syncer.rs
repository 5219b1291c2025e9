//! One reconciliation pass per external service, plus the on-demand
//! single-repository path.

use crate::diff::diff;
use crate::error::{SyncError, SyncResult};
use crate::observe::SyncObserver;
use catalog_core::{CatalogStore, Diff, ExternalService, Repo, StoreError, StoreTx};
use chrono::{DateTime, Duration, Utc};
use sources::Sourcer;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Partial counts reported to the progress callback while a stream is being
/// consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncProgress {
    pub synced: u64,
    pub errors: u64,
}

const PROGRESS_EVERY: u64 = 100;

/// Orchestrates reconciliation passes: builds the source for a service,
/// consumes its stream, runs the diff engine and applies the result in one
/// store transaction.
pub struct Syncer<S: CatalogStore> {
    pub(crate) store: Arc<S>,
    pub(crate) sourcer: Arc<dyn Sourcer>,
    pub(crate) observer: Arc<dyn SyncObserver>,
    /// When set, any sourced private repository fails the pass.
    pub(crate) public_only: bool,
}

impl<S: CatalogStore> Clone for Syncer<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            sourcer: Arc::clone(&self.sourcer),
            observer: Arc::clone(&self.observer),
            public_only: self.public_only,
        }
    }
}

impl<S: CatalogStore> Syncer<S> {
    pub fn new(
        store: Arc<S>,
        sourcer: Arc<dyn Sourcer>,
        observer: Arc<dyn SyncObserver>,
        public_only: bool,
    ) -> Self {
        Self {
            store,
            sourcer,
            observer,
            public_only,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Admin "sync now": enqueues a single job for the service, subject to
    /// the queue's admission rules.
    pub async fn trigger_external_service_sync(&self, service_id: i64) -> SyncResult<()> {
        self.store.enqueue_single_sync_job(service_id).await?;
        Ok(())
    }

    /// Emits the current catalog as an all-unmodified diff so downstream
    /// consumers see existing repositories before the first pass completes.
    pub async fn emit_catalog_snapshot(&self) -> SyncResult<()> {
        let repos = self.store.list_repos().await?;
        let snapshot = Diff {
            unmodified: repos,
            ..Default::default()
        };
        debug!(repos = snapshot.unmodified.len(), "emitting catalog snapshot");
        self.observer.diff_applied("catalog", &snapshot);
        Ok(())
    }

    /// Runs one full reconciliation pass for the given service.
    ///
    /// Access errors follow a strict matrix: a hard `Unauthorized`/
    /// `Forbidden`, or `AccountSuspended` in any wrapping, aborts the pass
    /// with no catalog changes (scheduling metadata still advances). The
    /// warning-wrapped variants mean the source authoritatively lost access:
    /// the pass diffs against the partial batch so the source's repositories
    /// are removed. Any other error aborts without destructive changes.
    pub async fn sync_external_service(
        &self,
        service_id: i64,
        min_sync_interval: Duration,
        mut progress: impl FnMut(&SyncProgress, bool) + Send,
    ) -> SyncResult<()> {
        let mut svc = self.store.external_service(service_id).await?;
        if svc.cloud_default {
            return Err(SyncError::CloudDefault(service_id));
        }

        let source = self.sourcer.source_for(&svc)?;
        let (tx, mut rx) = mpsc::channel(1);
        let producer = {
            let source = Arc::clone(&source);
            tokio::spawn(async move { source.list_repos(tx).await })
        };

        let mut observed = Vec::new();
        let mut counts = SyncProgress::default();
        let mut access_lost = None;
        let mut hard_abort = None;

        while let Some(item) = rx.recv().await {
            match item {
                Ok(repo) => {
                    if self.public_only && repo.private {
                        hard_abort = Some(SyncError::PrivateRepoForbidden { name: repo.name });
                        break;
                    }
                    observed.push(repo);
                    counts.synced += 1;
                    if counts.synced % PROGRESS_EVERY == 0 {
                        progress(&counts, false);
                    }
                }
                Err(e) => {
                    counts.errors += 1;
                    if e.is_account_suspended()
                        || (!e.is_warning() && (e.is_unauthorized() || e.is_forbidden()))
                    {
                        hard_abort = Some(SyncError::Source(e));
                        break;
                    }
                    if e.is_warning() && (e.is_unauthorized() || e.is_forbidden()) {
                        // Authoritative access loss: the batch ends here and
                        // the diff removes what this source can no longer
                        // see.
                        access_lost = Some(e);
                        break;
                    }
                    // Transient or unclassified: never destructive.
                    let err = SyncError::Source(e);
                    self.observer.sync_errored(service_id, &err);
                    return Err(err);
                }
            }
        }
        drop(rx);

        if let Some(err) = hard_abort {
            if matches!(err, SyncError::Source(_)) {
                self.advance_sync_times(&mut svc, min_sync_interval).await?;
            }
            warn!(service_id, error = %err, "sync pass aborted");
            self.observer.sync_errored(service_id, &err);
            return Err(err);
        }
        let _ = producer.await;

        let now = Utc::now();
        let urn = svc.urn();
        let mut tx = self.store.transact().await?;
        let applied = self
            .apply_pass(&mut tx, &mut svc, service_id, observed, min_sync_interval, now)
            .await;

        let d = match applied {
            Ok(d) => {
                tx.done(true).await?;
                d
            }
            Err(e) => {
                let _ = tx.done(false).await;
                self.observer.sync_errored(service_id, &e);
                return Err(e);
            }
        };

        info!(
            service_id,
            added = d.added.len(),
            modified = d.modified.len(),
            deleted = d.deleted.len(),
            unmodified = d.unmodified.len(),
            "sync pass completed"
        );
        self.observer.diff_applied(&urn, &d);
        progress(&counts, true);

        match access_lost {
            Some(e) => {
                let err = SyncError::Source(e);
                self.observer.sync_errored(service_id, &err);
                Err(err)
            }
            None => Ok(()),
        }
    }

    async fn apply_pass(
        &self,
        tx: &mut S::Tx,
        svc: &mut ExternalService,
        service_id: i64,
        observed: Vec<Repo>,
        min_sync_interval: Duration,
        now: DateTime<Utc>,
    ) -> SyncResult<Diff> {
        let urn = svc.urn();
        let mut stored = tx.list_external_service_repos(service_id).await?;

        // The diff must also see rows other services own whose identity or
        // name the observed batch claims: an identity match merges into the
        // existing row instead of inserting a duplicate, and a name clash
        // resolves against the real occupier.
        let known: HashSet<i64> = stored.iter().map(|r| r.id).collect();
        for repo in tx.list_conflicting_repos(&observed).await? {
            if !known.contains(&repo.id) {
                stored.push(repo);
            }
        }

        let mut d = diff(&urn, stored, observed, now);

        // Deletes go first so freed names are available to inserts.
        tx.soft_delete_repos(&d.deleted, now).await?;
        tx.upsert_repos(&mut d.added).await?;
        tx.upsert_sources(&urn, &d.added).await?;

        let mut modified: Vec<Repo> = d.modified.iter().map(|m| m.repo.clone()).collect();
        tx.upsert_repos(&mut modified).await?;
        tx.upsert_sources(&urn, &modified).await?;

        let interval = calc_sync_interval(now, svc.last_sync_at, min_sync_interval, d.is_unchanged());
        svc.last_sync_at = Some(now);
        svc.next_sync_at = Some(now + interval);
        tx.upsert_external_service(svc).await?;

        Ok(d)
    }

    /// Advances scheduling metadata without touching the catalog; used by
    /// aborted passes whose access errors are still authoritative for
    /// scheduling.
    async fn advance_sync_times(
        &self,
        svc: &mut ExternalService,
        min_sync_interval: Duration,
    ) -> SyncResult<()> {
        let now = Utc::now();
        svc.last_sync_at = Some(now);
        svc.next_sync_at = Some(now + min_sync_interval);

        let mut tx = self.store.transact().await?;
        let result = tx.upsert_external_service(svc).await;
        tx.done(result.is_ok()).await?;
        result?;
        Ok(())
    }

    /// Resolves one repository by name via the owning source and reconciles
    /// just that record.
    ///
    /// With `background` set and a stored value present, the previous value
    /// is returned immediately and the update runs in a spawned task, its
    /// result observable only through the observer. Source entries
    /// contributed by other services are never touched either way.
    pub async fn sync_repo(&self, name: &str, background: bool) -> SyncResult<Repo> {
        let stored = self.store.repo_by_name(name).await?;

        if background && let Some(previous) = stored.clone() {
            let syncer = self.clone();
            let name = name.to_string();
            tokio::spawn(async move {
                if let Err(e) = syncer.sync_single(&name, stored).await {
                    warn!(repo = %name, error = %e, "background repo sync failed");
                }
            });
            return Ok(previous);
        }

        self.sync_single(name, stored).await
    }

    async fn sync_single(&self, name: &str, stored: Option<Repo>) -> SyncResult<Repo> {
        let svc = self.owning_service(name, stored.as_ref()).await?;
        let source = self.sourcer.source_for(&svc)?;
        let Some(getter) = source.repo_getter() else {
            return Err(SyncError::RepoNotFound(name.to_string()));
        };

        let now = Utc::now();
        let urn = svc.urn();

        match getter.get_repo(name).await {
            Ok(observed) => {
                if self.public_only && observed.private {
                    return Err(SyncError::PrivateRepoForbidden {
                        name: observed.name,
                    });
                }

                let mut tx = self.store.transact().await?;
                let applied = self
                    .apply_repo(&mut tx, &urn, stored, observed, now)
                    .await;

                match applied {
                    Ok((d, repo)) => {
                        tx.done(true).await?;
                        self.observer.diff_applied(&urn, &d);
                        Ok(repo)
                    }
                    Err(e) => {
                        let _ = tx.done(false).await;
                        Err(e)
                    }
                }
            }
            Err(e) if e.is_not_found() => match stored {
                Some(mut repo) => {
                    let mut tx = self.store.transact().await?;
                    let deleted = tx.soft_delete_repos(std::slice::from_ref(&repo), now).await;
                    tx.done(deleted.is_ok()).await?;
                    deleted?;

                    repo.soft_delete(now);
                    let d = Diff {
                        deleted: vec![repo.clone()],
                        ..Default::default()
                    };
                    info!(repo = %repo.name, "repository gone from source, deleted");
                    self.observer.diff_applied(&urn, &d);
                    Ok(repo)
                }
                None => Err(SyncError::RepoNotFound(name.to_string())),
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_repo(
        &self,
        tx: &mut S::Tx,
        urn: &str,
        stored: Option<Repo>,
        observed: Repo,
        now: DateTime<Utc>,
    ) -> SyncResult<(Diff, Repo)> {
        let spec = observed.external_repo.clone();
        let mut stored: Vec<Repo> = stored.into_iter().collect();
        let known: HashSet<i64> = stored.iter().map(|r| r.id).collect();
        for repo in tx
            .list_conflicting_repos(std::slice::from_ref(&observed))
            .await?
        {
            if !known.contains(&repo.id) {
                stored.push(repo);
            }
        }
        let mut d = diff(urn, stored, vec![observed], now);

        tx.soft_delete_repos(&d.deleted, now).await?;
        tx.upsert_repos(&mut d.added).await?;
        tx.upsert_sources(urn, &d.added).await?;
        let mut modified: Vec<Repo> = d.modified.iter().map(|m| m.repo.clone()).collect();
        tx.upsert_repos(&mut modified).await?;
        tx.upsert_sources(urn, &modified).await?;

        let repo = d
            .added
            .first()
            .or_else(|| modified.iter().find(|r| r.external_repo == spec))
            .or_else(|| d.unmodified.iter().find(|r| r.external_repo == spec))
            .cloned()
            .ok_or_else(|| SyncError::RepoNotFound(urn.to_string()))?;

        Ok((d, repo))
    }

    /// Picks the service responsible for a repository: the smallest service
    /// id among its stored source entries, falling back to a host-prefix
    /// match against configured services.
    async fn owning_service(
        &self,
        name: &str,
        stored: Option<&Repo>,
    ) -> SyncResult<ExternalService> {
        if let Some(repo) = stored {
            let mut ids: Vec<i64> = repo
                .sources
                .keys()
                .filter_map(|urn| urn.rsplit(':').next()?.parse().ok())
                .collect();
            ids.sort_unstable();

            for id in ids {
                match self.store.external_service(id).await {
                    Ok(svc) => return Ok(svc),
                    Err(StoreError::ServiceNotFound(_)) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }

        for svc in self.store.list_external_services().await? {
            if let Some(host) = config_host(&svc)
                && name.starts_with(&host)
            {
                return Ok(svc);
            }
        }

        Err(SyncError::RepoNotFound(name.to_string()))
    }
}

fn config_host(svc: &ExternalService) -> Option<String> {
    let url = svc.config.get("url")?.as_str()?;
    let host = url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .split('/')
        .next()?;
    (!host.is_empty()).then(|| host.to_string())
}

/// The next sync interval: the configured minimum normally, doubling the
/// time since the last sync when a pass produced no changes, capped at
/// eight hours.
pub fn calc_sync_interval(
    now: DateTime<Utc>,
    last_sync_at: Option<DateTime<Utc>>,
    min_sync_interval: Duration,
    unchanged: bool,
) -> Duration {
    let max = Duration::hours(8);
    let mut interval = min_sync_interval;

    if unchanged && let Some(last) = last_sync_at {
        interval = (now - last) * 2;
    }

    // Not Ord::clamp: a configured minimum above the cap must not panic,
    // and the cap wins.
    interval.max(min_sync_interval).min(max)
}
