use thiserror::Error;

pub type SourceResult<T> = Result<T, SourceError>;

/// The error taxonomy surfaced by a source.
///
/// The access errors (`Unauthorized`, `Forbidden`, `AccountSuspended`) are
/// security-significant and drive the syncer's abort-vs-proceed decision.
/// Wrapping one in [`SourceError::Warning`] signals "continue the pass, but
/// treat this as an authoritative access change" rather than a fatal abort;
/// the classification helpers look through the wrapping.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("bad credentials")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("account suspended")]
    AccountSuspended,

    #[error("repository not found: {0}")]
    NotFound(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("host API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("rate limited: retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error("invalid external service config: {0}")]
    Config(String),

    #[error("unsupported external service kind: {0}")]
    UnsupportedKind(String),

    #[error("warning: {0}")]
    Warning(Box<SourceError>),
}

impl SourceError {
    /// Wraps this error as a warning. Idempotent.
    pub fn into_warning(self) -> SourceError {
        match self {
            warning @ SourceError::Warning(_) => warning,
            other => SourceError::Warning(Box::new(other)),
        }
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, SourceError::Warning(_))
    }

    /// The innermost error, with any warning wrapping peeled off.
    pub fn root(&self) -> &SourceError {
        match self {
            SourceError::Warning(inner) => inner.root(),
            other => other,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self.root(), SourceError::Unauthorized)
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self.root(), SourceError::Forbidden)
    }

    pub fn is_account_suspended(&self) -> bool {
        matches!(self.root(), SourceError::AccountSuspended)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), SourceError::NotFound(_))
    }

    /// Access errors revoke visibility; everything else is transient and
    /// must never cause destructive catalog changes.
    pub fn is_access_error(&self) -> bool {
        self.is_unauthorized() || self.is_forbidden() || self.is_account_suspended()
    }
}
