use catalog_core::StoreError;
use sources::SourceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Platform-managed services must never be synced by user-triggered
    /// paths.
    #[error("external service {0} is cloud-managed and cannot be synced directly")]
    CloudDefault(i64),

    #[error("repository {0} not found on any configured source")]
    RepoNotFound(String),

    /// This deployment only hosts public repositories; a sourced private
    /// repo fails the whole pass.
    #[error("repository {name} is private and cannot be synced to this deployment")]
    PrivateRepoForbidden { name: String },

    /// The pruner's deadline expired while waiting on the rate limiter.
    #[error("timed out waiting for the prune rate limiter")]
    LimiterTimeout,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Source(#[from] SourceError),
}

impl SyncError {
    pub fn is_cloud_default(&self) -> bool {
        matches!(self, SyncError::CloudDefault(_))
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            SyncError::RepoNotFound(_) => true,
            SyncError::Source(e) => e.is_not_found(),
            _ => false,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
