use crate::error::{SourceError, SourceResult};
use crate::github::GithubSource;
use crate::gitlab::GitlabSource;
use async_trait::async_trait;
use catalog_core::{ExternalService, ExternalServiceKind, Repo};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// One item of a source stream. Errors may appear interleaved with valid
/// repositories and do not necessarily terminate the stream early.
pub type SourceItem = Result<Repo, SourceError>;

/// A streaming adapter that turns one external service's API into a
/// sequence of repository observations.
///
/// Implementations send into the provided channel and return when the
/// listing is exhausted or the receiver is gone; dropping the sender closes
/// the stream. The channel is intentionally small so a slow consumer
/// throttles a fast producer.
#[async_trait]
pub trait Source: Send + Sync {
    async fn list_repos(&self, results: mpsc::Sender<SourceItem>);

    /// Liveness probe. Not used by reconciliation itself.
    async fn check_connection(&self) -> SourceResult<()>;

    /// The owning service(s), used to attribute errors and source entries.
    fn external_services(&self) -> Vec<ExternalService>;

    /// Optional capability: single-repo resolution, required by the
    /// on-demand sync path.
    fn repo_getter(&self) -> Option<&dyn RepoGetter> {
        None
    }

    /// Optional capability: host version probe.
    fn version_probe(&self) -> Option<&dyn VersionSource> {
        None
    }
}

#[async_trait]
pub trait RepoGetter: Send + Sync {
    /// Resolves one repository by its catalog name (host-prefixed path).
    async fn get_repo(&self, name: &str) -> SourceResult<Repo>;
}

#[async_trait]
pub trait VersionSource: Send + Sync {
    async fn version(&self) -> SourceResult<String>;
}

/// Factory resolving a [`Source`] for an external service, keyed by kind.
pub trait Sourcer: Send + Sync {
    fn source_for(&self, svc: &ExternalService) -> SourceResult<Arc<dyn Source>>;
}

/// The production factory: one shared HTTP client, one adapter per
/// supported kind.
pub struct DefaultSourcer {
    http: Client,
}

impl DefaultSourcer {
    pub fn new() -> SourceResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("catalogd")
            .build()?;

        Ok(Self { http })
    }
}

impl Sourcer for DefaultSourcer {
    fn source_for(&self, svc: &ExternalService) -> SourceResult<Arc<dyn Source>> {
        match svc.kind {
            ExternalServiceKind::Github => {
                Ok(Arc::new(GithubSource::new(self.http.clone(), svc.clone())?))
            }
            ExternalServiceKind::Gitlab => {
                Ok(Arc::new(GitlabSource::new(self.http.clone(), svc.clone())?))
            }
            kind => Err(SourceError::UnsupportedKind(kind.to_string())),
        }
    }
}

/// Parses the `Link` response header and returns the `rel="next"` URL, if
/// present. GitHub and GitLab both paginate this way.
pub(crate) fn extract_next_link(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get("link")
        .and_then(|v| v.to_str().ok())
        .and_then(|link| {
            for part in link.split(',') {
                if part.contains("rel=\"next\"") {
                    let url_part = part.split(';').next()?;
                    let url = url_part
                        .trim()
                        .trim_start_matches('<')
                        .trim_end_matches('>');
                    return Some(url.to_string());
                }
            }
            None
        })
}
