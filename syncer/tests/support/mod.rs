//! In-memory store and scripted sources shared by the syncer test binaries.

use async_trait::async_trait;
use catalog_core::{
    CatalogStore, Diff, ExternalService, PrivateRepoGate, Repo, StoreError, StoreResult, StoreTx,
    SyncJob, SyncJobState, UnrestrictedGate,
};
use chrono::{DateTime, Utc};
use sources::{RepoGetter, Source, SourceError, SourceItem, SourceResult, Sourcer};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use syncer::{SyncError, SyncObserver};
use tokio::sync::mpsc;

#[derive(Debug, Default, Clone)]
pub struct State {
    pub repos: Vec<Repo>,
    pub services: Vec<ExternalService>,
    pub jobs: Vec<SyncJob>,
    next_repo_id: i64,
    next_job_id: i64,
}

/// Transactional in-memory implementation of the store contract. A
/// transaction works on a snapshot and publishes it on commit.
pub struct MemStore {
    state: Arc<Mutex<State>>,
    gate: Arc<dyn PrivateRepoGate>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::with_gate(Arc::new(UnrestrictedGate))
    }

    pub fn with_gate(gate: Arc<dyn PrivateRepoGate>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            gate,
        }
    }

    pub fn add_service(&self, mut svc: ExternalService) -> ExternalService {
        let mut state = self.state.lock().unwrap();
        svc.id = (state.services.len() as i64) + 1;
        state.services.push(svc.clone());
        svc
    }

    pub fn add_repo(&self, mut repo: Repo) -> Repo {
        let mut state = self.state.lock().unwrap();
        state.next_repo_id += 1;
        repo.id = state.next_repo_id;
        state.repos.push(repo.clone());
        repo
    }

    pub fn live_repos(&self) -> Vec<Repo> {
        self.state
            .lock()
            .unwrap()
            .repos
            .iter()
            .filter(|r| !r.is_deleted())
            .cloned()
            .collect()
    }

    pub fn repo(&self, name: &str) -> Option<Repo> {
        self.state
            .lock()
            .unwrap()
            .repos
            .iter()
            .find(|r| r.folded_name() == name.to_lowercase())
            .cloned()
    }

    pub fn service(&self, id: i64) -> Option<ExternalService> {
        self.state
            .lock()
            .unwrap()
            .services
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }
}

fn urn_service_id(urn: &str) -> Option<i64> {
    urn.rsplit(':').next()?.parse().ok()
}

#[async_trait]
impl CatalogStore for MemStore {
    type Tx = MemTx;

    async fn transact(&self) -> StoreResult<MemTx> {
        let work = self.state.lock().unwrap().clone();
        Ok(MemTx {
            state: Arc::clone(&self.state),
            gate: Arc::clone(&self.gate),
            work,
        })
    }

    async fn external_service(&self, id: i64) -> StoreResult<ExternalService> {
        self.state
            .lock()
            .unwrap()
            .services
            .iter()
            .find(|s| s.id == id && s.deleted_at.is_none())
            .cloned()
            .ok_or(StoreError::ServiceNotFound(id))
    }

    async fn list_external_services(&self) -> StoreResult<Vec<ExternalService>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .services
            .iter()
            .filter(|s| s.deleted_at.is_none())
            .cloned()
            .collect())
    }

    async fn repo_by_name(&self, name: &str) -> StoreResult<Option<Repo>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .repos
            .iter()
            .find(|r| !r.is_deleted() && r.folded_name() == name.to_lowercase())
            .cloned())
    }

    async fn list_repos(&self) -> StoreResult<Vec<Repo>> {
        Ok(self.live_repos())
    }

    async fn list_repos_with_last_errors(&self, limit: i64) -> StoreResult<Vec<Repo>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .repos
            .iter()
            .filter(|r| !r.is_deleted() && r.last_error.as_deref().is_some_and(|e| !e.is_empty()))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn enqueue_sync_jobs(&self, ignore_site_admin: bool) -> StoreResult<()> {
        let now = Utc::now();
        let mut state = self.state.lock().unwrap();
        let due: Vec<i64> = state
            .services
            .iter()
            .filter(|s| s.deleted_at.is_none())
            .filter(|s| ignore_site_admin || !s.cloud_default)
            .filter(|s| s.next_sync_at.is_none_or(|at| at <= now))
            .map(|s| s.id)
            .collect();

        for service_id in due {
            let busy = state
                .jobs
                .iter()
                .any(|j| j.external_service_id == service_id && !j.state.is_terminal());
            if busy {
                continue;
            }
            state.next_job_id += 1;
            let id = state.next_job_id;
            state.jobs.push(SyncJob {
                id,
                external_service_id: service_id,
                state: SyncJobState::Queued,
                failure_message: None,
                started_at: None,
                finished_at: None,
            });
        }
        Ok(())
    }

    async fn enqueue_single_sync_job(&self, service_id: i64) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        let Some(svc) = state
            .services
            .iter()
            .find(|s| s.id == service_id && s.deleted_at.is_none())
        else {
            return Ok(());
        };
        if svc.cloud_default {
            return Ok(());
        }
        let busy = state
            .jobs
            .iter()
            .any(|j| j.external_service_id == service_id && !j.state.is_terminal());
        if !busy {
            state.next_job_id += 1;
            let id = state.next_job_id;
            state.jobs.push(SyncJob {
                id,
                external_service_id: service_id,
                state: SyncJobState::Queued,
                failure_message: None,
                started_at: None,
                finished_at: None,
            });
        }
        Ok(())
    }

    async fn dequeue_sync_job(&self) -> StoreResult<Option<SyncJob>> {
        let mut state = self.state.lock().unwrap();
        let job = state
            .jobs
            .iter_mut()
            .find(|j| j.state == SyncJobState::Queued);
        Ok(job.map(|j| {
            j.state = SyncJobState::Processing;
            j.started_at = Some(Utc::now());
            j.clone()
        }))
    }

    async fn finish_sync_job(
        &self,
        job_id: i64,
        state: SyncJobState,
        failure_message: Option<String>,
    ) -> StoreResult<()> {
        let mut guard = self.state.lock().unwrap();
        if let Some(job) = guard.jobs.iter_mut().find(|j| j.id == job_id) {
            job.state = state;
            job.failure_message = failure_message;
            job.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn list_sync_jobs(&self) -> StoreResult<Vec<SyncJob>> {
        Ok(self.state.lock().unwrap().jobs.clone())
    }
}

pub struct MemTx {
    state: Arc<Mutex<State>>,
    gate: Arc<dyn PrivateRepoGate>,
    work: State,
}

#[async_trait]
impl StoreTx for MemTx {
    async fn list_external_service_repos(&mut self, service_id: i64) -> StoreResult<Vec<Repo>> {
        Ok(self
            .work
            .repos
            .iter()
            .filter(|r| !r.is_deleted())
            .filter(|r| {
                r.sources
                    .keys()
                    .any(|urn| urn_service_id(urn) == Some(service_id))
            })
            .cloned()
            .collect())
    }

    async fn list_conflicting_repos(&mut self, observed: &[Repo]) -> StoreResult<Vec<Repo>> {
        Ok(self
            .work
            .repos
            .iter()
            .filter(|r| !r.is_deleted())
            .filter(|r| {
                observed.iter().any(|o| {
                    o.external_repo == r.external_repo || o.folded_name() == r.folded_name()
                })
            })
            .cloned()
            .collect())
    }

    async fn repo_by_name(&mut self, name: &str) -> StoreResult<Option<Repo>> {
        Ok(self
            .work
            .repos
            .iter()
            .find(|r| !r.is_deleted() && r.folded_name() == name.to_lowercase())
            .cloned())
    }

    async fn upsert_repos(&mut self, repos: &mut [Repo]) -> StoreResult<()> {
        let mut private_count = self
            .work
            .repos
            .iter()
            .filter(|r| !r.is_deleted() && r.private)
            .count() as u64;

        for repo in repos.iter_mut() {
            if repo.id == 0 {
                self.gate.check(private_count, repo, false)?;
                self.work.next_repo_id += 1;
                repo.id = self.work.next_repo_id;
                self.work.repos.push(repo.clone());
                if repo.private {
                    private_count += 1;
                }
            } else {
                let was_private = self
                    .work
                    .repos
                    .iter()
                    .find(|r| r.id == repo.id)
                    .is_some_and(|r| r.private);
                self.gate
                    .check(private_count - u64::from(was_private), repo, was_private)?;

                if let Some(row) = self.work.repos.iter_mut().find(|r| r.id == repo.id) {
                    let sources = row.sources.clone();
                    *row = repo.clone();
                    row.sources = sources;
                }
                private_count = private_count - u64::from(was_private) + u64::from(repo.private);
            }
        }
        Ok(())
    }

    async fn upsert_sources(&mut self, urn: &str, repos: &[Repo]) -> StoreResult<()> {
        for repo in repos {
            if let Some(row) = self.work.repos.iter_mut().find(|r| r.id == repo.id) {
                match repo.sources.get(urn) {
                    Some(info) => {
                        row.sources.insert(urn.to_string(), info.clone());
                    }
                    None => {
                        row.sources.remove(urn);
                    }
                }
            }
        }
        Ok(())
    }

    async fn soft_delete_repos(&mut self, repos: &[Repo], now: DateTime<Utc>) -> StoreResult<()> {
        for repo in repos {
            if let Some(row) = self.work.repos.iter_mut().find(|r| r.id == repo.id) {
                row.soft_delete(now);
            }
        }
        Ok(())
    }

    async fn upsert_external_service(&mut self, svc: &ExternalService) -> StoreResult<()> {
        if let Some(row) = self.work.services.iter_mut().find(|s| s.id == svc.id) {
            *row = svc.clone();
        }
        Ok(())
    }

    async fn done(self, ok: bool) -> StoreResult<()> {
        if ok {
            *self.state.lock().unwrap() = self.work;
        }
        Ok(())
    }
}

/// Gate capping private repositories, mirroring the production license gate.
pub struct CapGate(pub u64);

impl PrivateRepoGate for CapGate {
    fn check(&self, current_private: u64, repo: &Repo, was_private: bool) -> StoreResult<()> {
        if repo.private && !was_private && current_private >= self.0 {
            return Err(StoreError::PrivateRepoLimit {
                name: repo.name.clone(),
                max: self.0,
            });
        }
        Ok(())
    }
}

/// A scripted source: streams `items` once, resolves single repos from
/// `get_results` (missing names resolve to `NotFound`).
pub struct FakeSource {
    svc: ExternalService,
    items: Mutex<Vec<SourceItem>>,
    get_results: Mutex<HashMap<String, SourceResult<Repo>>>,
}

impl FakeSource {
    pub fn new(svc: ExternalService, items: Vec<SourceItem>) -> Self {
        Self {
            svc,
            items: Mutex::new(items),
            get_results: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_repo(self, repo: Repo) -> Self {
        self.get_results
            .lock()
            .unwrap()
            .insert(repo.name.clone(), Ok(repo));
        self
    }
}

#[async_trait]
impl Source for FakeSource {
    async fn list_repos(&self, results: mpsc::Sender<SourceItem>) {
        let items = std::mem::take(&mut *self.items.lock().unwrap());
        for item in items {
            if results.send(item).await.is_err() {
                return;
            }
        }
    }

    async fn check_connection(&self) -> SourceResult<()> {
        Ok(())
    }

    fn external_services(&self) -> Vec<ExternalService> {
        vec![self.svc.clone()]
    }

    fn repo_getter(&self) -> Option<&dyn RepoGetter> {
        Some(self)
    }
}

#[async_trait]
impl RepoGetter for FakeSource {
    async fn get_repo(&self, name: &str) -> SourceResult<Repo> {
        self.get_results
            .lock()
            .unwrap()
            .remove(name)
            .unwrap_or_else(|| Err(SourceError::NotFound(name.to_string())))
    }
}

#[derive(Default)]
pub struct FakeSourcer {
    sources: Mutex<HashMap<i64, Arc<FakeSource>>>,
}

impl FakeSourcer {
    pub fn insert(&self, service_id: i64, source: FakeSource) {
        self.sources
            .lock()
            .unwrap()
            .insert(service_id, Arc::new(source));
    }
}

impl Sourcer for FakeSourcer {
    fn source_for(&self, svc: &ExternalService) -> SourceResult<Arc<dyn Source>> {
        self.sources
            .lock()
            .unwrap()
            .get(&svc.id)
            .cloned()
            .map(|s| s as Arc<dyn Source>)
            .ok_or_else(|| SourceError::UnsupportedKind(svc.kind.to_string()))
    }
}

/// Captures everything the syncer emits for assertions.
#[derive(Default)]
pub struct CapturingObserver {
    pub diffs: Mutex<Vec<(String, Diff)>>,
    pub errors: Mutex<Vec<i64>>,
    pub pruned: Mutex<Vec<String>>,
}

impl SyncObserver for CapturingObserver {
    fn diff_applied(&self, service_urn: &str, diff: &Diff) {
        self.diffs
            .lock()
            .unwrap()
            .push((service_urn.to_string(), diff.clone()));
    }

    fn sync_errored(&self, service_id: i64, _error: &SyncError) {
        self.errors.lock().unwrap().push(service_id);
    }

    fn repo_pruned(&self, name: &str) {
        self.pruned.lock().unwrap().push(name.to_string());
    }
}
