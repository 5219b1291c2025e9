//! Contracts between the reconciliation engine and its persistence layer.

use crate::error::StoreResult;
use crate::types::{ExternalService, Repo, SyncJob, SyncJobState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Transactional persistence for services, repositories, source
/// associations and sync jobs.
///
/// All catalog mutation goes through [`StoreTx`] units of work obtained from
/// [`CatalogStore::transact`]; the queue operations below run outside any
/// caller-visible transaction and rely on row locks for admission control.
#[async_trait]
pub trait CatalogStore: Send + Sync + 'static {
    type Tx: StoreTx;

    /// Begins a scoped unit of work. Commit or roll back via
    /// [`StoreTx::done`].
    async fn transact(&self) -> StoreResult<Self::Tx>;

    async fn external_service(&self, id: i64) -> StoreResult<ExternalService>;

    /// Live (non-deleted) services.
    async fn list_external_services(&self) -> StoreResult<Vec<ExternalService>>;

    /// Looks a live repository up by case-folded name.
    async fn repo_by_name(&self, name: &str) -> StoreResult<Option<Repo>>;

    /// Every live repository. Used for the initial catalog snapshot emitted
    /// on startup.
    async fn list_repos(&self) -> StoreResult<Vec<Repo>>;

    /// Live repositories carrying a non-empty clone/fetch error, oldest
    /// first, capped at `limit`.
    async fn list_repos_with_last_errors(&self, limit: i64) -> StoreResult<Vec<Repo>>;

    /// Inserts a queued job for every due external service
    /// (`next_sync_at <= now`), skipping services that already have a
    /// non-terminal job, are mid-deletion, or whose row cannot be locked.
    async fn enqueue_sync_jobs(&self, ignore_site_admin: bool) -> StoreResult<()>;

    /// Inserts one queued job for the given service. A no-op when a
    /// non-terminal job exists, the service row is locked by a concurrent
    /// transaction, or the service is cloud-default.
    async fn enqueue_single_sync_job(&self, service_id: i64) -> StoreResult<()>;

    /// Claims the oldest queued job and flips it to processing. Returns
    /// `None` when nothing is claimable.
    async fn dequeue_sync_job(&self) -> StoreResult<Option<SyncJob>>;

    async fn finish_sync_job(
        &self,
        job_id: i64,
        state: SyncJobState,
        failure_message: Option<String>,
    ) -> StoreResult<()>;

    async fn list_sync_jobs(&self) -> StoreResult<Vec<SyncJob>>;
}

/// A scoped unit of work over the catalog tables.
///
/// Row locks taken by the upsert and delete statements serialize concurrent
/// reconciliations of overlapping repositories: the second transaction
/// blocks until the first commits and then proceeds against the now-current
/// rows.
#[async_trait]
pub trait StoreTx: Send {
    /// Every live repository associated with the given external service.
    async fn list_external_service_repos(&mut self, service_id: i64) -> StoreResult<Vec<Repo>>;

    /// Live repositories from the whole catalog, regardless of service
    /// association, whose external identity or case-folded name matches any
    /// of the given repositories. Feeding these into a sync's diff is what
    /// keeps one logical repository on one catalog row when a second
    /// service starts observing it.
    async fn list_conflicting_repos(&mut self, observed: &[Repo]) -> StoreResult<Vec<Repo>>;

    async fn repo_by_name(&mut self, name: &str) -> StoreResult<Option<Repo>>;

    /// Inserts or updates the given repositories, assigning ids to inserted
    /// records in place. Invokes the private-repo gate for every record
    /// that is, or becomes, private; a gate failure aborts the transaction.
    async fn upsert_repos(&mut self, repos: &mut [Repo]) -> StoreResult<()>;

    /// Writes each repository's source association for `urn` only: upserted
    /// when present in the repo's sources map, deleted when absent. Rows
    /// contributed by other services are never touched, so a concurrent
    /// sync's committed associations survive this transaction.
    async fn upsert_sources(&mut self, urn: &str, repos: &[Repo]) -> StoreResult<()>;

    /// Soft-deletes the given repositories: the delete timestamp is set,
    /// source associations are removed, and the name is freed for reuse.
    async fn soft_delete_repos(&mut self, repos: &[Repo], now: DateTime<Utc>) -> StoreResult<()>;

    /// Persists sync scheduling metadata and mutable service fields.
    async fn upsert_external_service(&mut self, svc: &ExternalService) -> StoreResult<()>;

    /// Commits when `ok` is true, rolls back otherwise.
    async fn done(self, ok: bool) -> StoreResult<()>;
}

/// Gate invoked by the store immediately before committing a repository
/// that is, or is becoming, private.
pub trait PrivateRepoGate: Send + Sync {
    /// `current_private` is the number of live private repositories
    /// excluding `repo` itself; `was_private` reflects the persisted row
    /// before this transaction.
    fn check(&self, current_private: u64, repo: &Repo, was_private: bool) -> StoreResult<()>;
}

/// Gate that admits everything; used by unrestricted deployments.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnrestrictedGate;

impl PrivateRepoGate for UnrestrictedGate {
    fn check(&self, _current_private: u64, _repo: &Repo, _was_private: bool) -> StoreResult<()> {
        Ok(())
    }
}
