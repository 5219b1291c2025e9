//! Rate-limited revalidation of repositories carrying a recorded
//! clone/fetch error; those confirmed gone are deleted.

use crate::error::{SyncError, SyncResult};
use crate::syncer::Syncer;
use catalog_core::CatalogStore;
use governor::DefaultDirectRateLimiter;
use std::time::Duration;
use tracing::{debug, info, warn};

const PRUNE_BATCH: i64 = 100;

/// Re-resolves each errored repository against its source, one limiter
/// token per repo. Exceeding `wait_deadline` while queued on the limiter
/// surfaces as [`SyncError::LimiterTimeout`] rather than being swallowed.
/// Returns the number of repositories pruned.
pub async fn sync_repos_with_last_errors<S: CatalogStore>(
    syncer: &Syncer<S>,
    limiter: &DefaultDirectRateLimiter,
    wait_deadline: Duration,
) -> SyncResult<u64> {
    let candidates = syncer.store().list_repos_with_last_errors(PRUNE_BATCH).await?;
    if candidates.is_empty() {
        return Ok(0);
    }

    let mut pruned = 0;
    for candidate in candidates {
        tokio::time::timeout(wait_deadline, limiter.until_ready())
            .await
            .map_err(|_| SyncError::LimiterTimeout)?;

        match syncer.sync_repo(&candidate.name, false).await {
            Ok(repo) if repo.is_deleted() => {
                pruned += 1;
                syncer.observer.repo_pruned(&repo.name);
            }
            Ok(repo) => {
                debug!(repo = %repo.name, "errored repository still resolves");
            }
            Err(e) if e.is_not_found() => {
                debug!(repo = %candidate.name, "repository already gone");
            }
            Err(e) => {
                warn!(repo = %candidate.name, error = %e, "prune revalidation failed");
            }
        }
    }

    info!(pruned, "prune pass completed");
    Ok(pruned)
}
