//! Injected observability sink for reconciliation outcomes.

use crate::error::SyncError;
use catalog_core::Diff;
use metrics::counter;

/// Receives every applied diff and sync outcome. Injected into the
/// [`Syncer`](crate::Syncer) so library code never touches global metric
/// registries; tests supply a capturing implementation.
pub trait SyncObserver: Send + Sync {
    /// Called with every diff the syncer applies, including the initial
    /// catalog snapshot emitted by the run loop.
    fn diff_applied(&self, service_urn: &str, diff: &Diff) {
        let _ = (service_urn, diff);
    }

    fn sync_errored(&self, service_id: i64, error: &SyncError) {
        let _ = (service_id, error);
    }

    fn repo_pruned(&self, name: &str) {
        let _ = name;
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl SyncObserver for NoopObserver {}

/// Records counters through the `metrics` facade. The binary installs the
/// Prometheus exporter that gives these a scrape endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsObserver;

impl SyncObserver for MetricsObserver {
    fn diff_applied(&self, _service_urn: &str, diff: &Diff) {
        counter!("catalog_repos_added_total").increment(diff.added.len() as u64);
        counter!("catalog_repos_modified_total").increment(diff.modified.len() as u64);
        counter!("catalog_repos_deleted_total").increment(diff.deleted.len() as u64);
        counter!("catalog_syncs_total").increment(1);
    }

    fn sync_errored(&self, _service_id: i64, _error: &SyncError) {
        counter!("catalog_sync_errors_total").increment(1);
    }

    fn repo_pruned(&self, _name: &str) {
        counter!("catalog_repos_pruned_total").increment(1);
    }
}
