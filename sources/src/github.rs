use crate::error::{SourceError, SourceResult};
use crate::source::{RepoGetter, Source, SourceItem, extract_next_link};
use async_trait::async_trait;
use catalog_core::{ExternalRepoSpec, ExternalService, Repo, SourceInfo};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Connection settings carried in the external service's config payload.
#[derive(Debug, Clone, Deserialize)]
pub struct GithubConfig {
    pub url: Option<String>,
    pub token: Option<String>,
    /// Organizations to mirror completely.
    #[serde(default)]
    pub orgs: Vec<String>,
    /// Explicit `owner/name` entries. Admins append new entries at the end,
    /// so these are streamed in request order.
    #[serde(default)]
    pub repos: Vec<String>,
}

pub struct GithubSource {
    client: Client,
    svc: ExternalService,
    config: GithubConfig,
    base: Url,
    api: String,
    host: String,
}

impl GithubSource {
    pub fn new(client: Client, svc: ExternalService) -> SourceResult<Self> {
        let config: GithubConfig = serde_json::from_value(svc.config.clone())
            .map_err(|e| SourceError::Config(e.to_string()))?;

        let base_url = config.url.as_deref().unwrap_or("https://github.com");
        let base = Url::parse(base_url).map_err(|e| SourceError::Config(e.to_string()))?;
        let host = base
            .host_str()
            .ok_or_else(|| SourceError::Config(format!("url has no host: {base_url}")))?
            .to_string();

        // github.com uses a separate API host; GitHub Enterprise serves the
        // API under /api/v3 on the instance itself.
        let api = if host == "github.com" {
            "https://api.github.com".to_string()
        } else {
            format!("{base}api/v3")
        };

        Ok(Self {
            client,
            svc,
            config,
            base,
            api,
            host,
        })
    }

    async fn get<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
    ) -> SourceResult<(T, Option<String>)> {
        debug!(url = %url, "GitHub API request");

        let mut req = self
            .client
            .get(url)
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = &self.config.token {
            req = req.header("Authorization", format!("token {token}"));
        }

        let response = req.send().await?;
        let next_link = extract_next_link(response.headers());

        match response.status() {
            StatusCode::OK => {
                let body = response.json::<T>().await?;
                Ok((body, next_link))
            }
            StatusCode::UNAUTHORIZED => Err(SourceError::Unauthorized),
            StatusCode::FORBIDDEN => {
                let body = response.text().await.unwrap_or_default();
                if body.contains("suspended") {
                    Err(SourceError::AccountSuspended)
                } else if body.contains("rate limit") {
                    Err(SourceError::RateLimited {
                        retry_after_seconds: 60,
                    })
                } else {
                    Err(SourceError::Forbidden)
                }
            }
            StatusCode::NOT_FOUND => Err(SourceError::NotFound(url.to_string())),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(60);
                Err(SourceError::RateLimited {
                    retry_after_seconds: retry_after,
                })
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(SourceError::Api {
                    status: status.as_u16(),
                    message: body,
                })
            }
        }
    }

    fn to_repo(&self, gr: GithubRepoResponse) -> Repo {
        let metadata = serde_json::to_value(&gr).unwrap_or(serde_json::Value::Null);
        let name = format!("{}/{}", self.host, gr.full_name);
        let mut repo = Repo {
            name: name.clone(),
            uri: name,
            description: gr.description.unwrap_or_default(),
            external_repo: ExternalRepoSpec::new(gr.node_id.clone(), "github", self.base.as_str()),
            private: gr.private,
            archived: gr.archived,
            fork: gr.fork,
            stars: gr.stargazers_count,
            metadata,
            ..Default::default()
        };
        repo.sources.insert(
            self.svc.urn(),
            SourceInfo {
                id: gr.node_id,
                clone_url: gr.clone_url,
            },
        );
        repo
    }

    async fn fetch_repo(&self, name_with_owner: &str) -> SourceResult<Repo> {
        let url = format!("{}/repos/{}", self.api, name_with_owner);
        let (gr, _) = self.get::<GithubRepoResponse>(&url).await?;
        Ok(self.to_repo(gr))
    }
}

#[async_trait]
impl Source for GithubSource {
    async fn list_repos(&self, results: mpsc::Sender<SourceItem>) {
        for org in &self.config.orgs {
            let mut url = format!("{}/orgs/{}/repos?per_page=100", self.api, org);
            loop {
                match self.get::<Vec<GithubRepoResponse>>(&url).await {
                    Ok((page, next)) => {
                        for gr in page {
                            if results.send(Ok(self.to_repo(gr))).await.is_err() {
                                return;
                            }
                        }
                        match next {
                            Some(n) => url = n,
                            None => break,
                        }
                    }
                    Err(e) => {
                        let fatal = e.is_access_error();
                        if results.send(Err(e)).await.is_err() || fatal {
                            return;
                        }
                        break;
                    }
                }
            }
        }

        for name in &self.config.repos {
            match self.fetch_repo(name).await {
                Ok(repo) => {
                    if results.send(Ok(repo)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let fatal = e.is_access_error();
                    if results.send(Err(e)).await.is_err() || fatal {
                        return;
                    }
                }
            }
        }
    }

    async fn check_connection(&self) -> SourceResult<()> {
        let url = format!("{}/rate_limit", self.api);
        self.get::<serde_json::Value>(&url).await?;
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
impl RepoGetter for GithubSource {
    async fn get_repo(&self, name: &str) -> SourceResult<Repo> {
        let prefix = format!("{}/", self.host);
        let name_with_owner = name
            .strip_prefix(&prefix)
            .ok_or_else(|| SourceError::NotFound(name.to_string()))?;
        self.fetch_repo(name_with_owner).await
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GithubRepoResponse {
    node_id: String,
    full_name: String,
    description: Option<String>,
    private: bool,
    fork: bool,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    stargazers_count: i64,
    clone_url: String,
}
