//! Pruner tests: rate-limited revalidation of errored repositories.

mod support;

use catalog_core::{ExternalRepoSpec, ExternalService, ExternalServiceKind, Repo, SourceInfo};
use governor::{Quota, RateLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use support::{CapturingObserver, FakeSource, FakeSourcer, MemStore};
use syncer::{SyncError, Syncer, pruner};

fn github_service() -> ExternalService {
    ExternalService {
        kind: ExternalServiceKind::Github,
        config: serde_json::json!({"url": "https://github.com/"}),
        ..Default::default()
    }
}

fn errored_repo(urn: &str, name: &str, ext_id: &str) -> Repo {
    let mut sources = HashMap::new();
    sources.insert(
        urn.to_string(),
        SourceInfo {
            id: ext_id.to_string(),
            clone_url: format!("https://{name}.git"),
        },
    );
    Repo {
        name: name.to_string(),
        external_repo: ExternalRepoSpec::new(ext_id, "github", "https://github.com/"),
        sources,
        last_error: Some("fatal: repository not found".to_string()),
        ..Default::default()
    }
}

struct Harness {
    store: Arc<MemStore>,
    sourcer: Arc<FakeSourcer>,
    observer: Arc<CapturingObserver>,
    syncer: Syncer<MemStore>,
}

fn harness() -> Harness {
    let store = Arc::new(MemStore::new());
    let sourcer = Arc::new(FakeSourcer::default());
    let observer = Arc::new(CapturingObserver::default());
    let syncer = Syncer::new(
        Arc::clone(&store),
        sourcer.clone(),
        observer.clone(),
        false
    );
    Harness {
        store,
        sourcer,
        observer,
        syncer
    }
}

#[tokio::test]
async fn test_pruner_deletes_confirmed_missing_repo() {
    let h = harness();
    let svc = h.store.add_service(github_service());
    let urn = svc.urn();

    h.store.add_repo(errored_repo(&urn, "github.com/a/gone", "1"));
    // No scripted get result: the source confirms the repo is missing.
    h.sourcer
        .insert(svc.id, FakeSource::new(svc.clone(), vec![]));

    let limiter = RateLimiter::direct(Quota::per_second(NonZeroU32::new(10).unwrap()));
    let pruned = pruner::sync_repos_with_last_errors(&h.syncer, &limiter, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(pruned, 1);
    assert!(h.store.repo("github.com/a/gone").unwrap().is_deleted());
    assert_eq!(
        *h.observer.pruned.lock().unwrap(),
        vec!["github.com/a/gone".to_string()]
    );
}

#[tokio::test]
async fn test_pruner_keeps_repos_that_still_resolve() {
    let h = harness();
    let svc = h.store.add_service(github_service());
    let urn = svc.urn();

    h.store
        .add_repo(errored_repo(&urn, "github.com/a/alive", "1"));
    h.sourcer.insert(
        svc.id,
        FakeSource::new(svc.clone(), vec![]).with_repo(errored_repo(&urn, "github.com/a/alive", "1"))
    );

    let limiter = RateLimiter::direct(Quota::per_second(NonZeroU32::new(10).unwrap()));
    let pruned = pruner::sync_repos_with_last_errors(&h.syncer, &limiter, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(pruned, 0);
    assert!(!h.store.repo("github.com/a/alive").unwrap().is_deleted());
    assert!(h.observer.pruned.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_pruner_skips_repos_without_errors() {
    let h = harness();
    let svc = h.store.add_service(github_service());
    let urn = svc.urn();

    let mut healthy = errored_repo(&urn, "github.com/a/fine", "1");
    healthy.last_error = None;
    h.store.add_repo(healthy);

    let limiter = RateLimiter::direct(Quota::per_second(NonZeroU32::new(10).unwrap()));
    let pruned = pruner::sync_repos_with_last_errors(&h.syncer, &limiter, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(pruned, 0);
}

#[tokio::test]
async fn test_pruner_limiter_deadline_is_surfaced() {
    let h = harness();
    let svc = h.store.add_service(github_service());
    let urn = svc.urn();

    h.store.add_repo(errored_repo(&urn, "github.com/a/one", "1"));
    h.store.add_repo(errored_repo(&urn, "github.com/a/two", "2"));
    h.sourcer
        .insert(svc.id, FakeSource::new(svc.clone(), vec![]));

    // One token per hour: the second candidate cannot acquire within the
    // deadline.
    let limiter = RateLimiter::direct(Quota::per_hour(NonZeroU32::new(1).unwrap()));
    let err = pruner::sync_repos_with_last_errors(&h.syncer, &limiter, Duration::from_millis(50))
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::LimiterTimeout));
}
