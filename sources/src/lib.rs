//! Source adapters: each turns one external service's API into a stream of
//! repository observations consumed by the reconciliation engine.
//!
//! The engine only depends on the [`Source`] contract and the
//! [`SourceError`] taxonomy; the concrete adapters here (GitHub, GitLab)
//! exist to exercise the factory seam. Adding a host means implementing
//! [`Source`] and extending [`DefaultSourcer`].

pub mod error;
pub mod github;
pub mod gitlab;
pub mod source;

pub use error::{SourceError, SourceResult};
pub use github::GithubSource;
pub use gitlab::GitlabSource;
pub use source::{DefaultSourcer, RepoGetter, Source, SourceItem, Sourcer, VersionSource};
