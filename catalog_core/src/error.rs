use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("external service {0} not found")]
    ServiceNotFound(i64),

    #[error("repository not found: {0}")]
    RepoNotFound(String),

    #[error("private repository limit of {max} reached, rejecting {name}")]
    PrivateRepoLimit { name: String, max: u64 },

    #[error("transaction already finished")]
    TransactionFinished,
}

impl StoreError {
    /// Quota violations roll the surrounding transaction back but are an
    /// admin-visible condition, not an internal fault.
    pub fn is_quota_violation(&self) -> bool {
        matches!(self, Self::PrivateRepoLimit { .. })
    }
}
