use crate::error::{SourceError, SourceResult};
use crate::source::{RepoGetter, Source, SourceItem, VersionSource, extract_next_link};
use async_trait::async_trait;
use catalog_core::{ExternalRepoSpec, ExternalService, Repo, SourceInfo};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
pub struct GitlabConfig {
    pub url: Option<String>,
    pub token: Option<String>,
    /// Project listing scope, e.g. "membership" or "all".
    #[serde(default)]
    pub project_query: Option<String>,
}

pub struct GitlabSource {
    client: Client,
    svc: ExternalService,
    config: GitlabConfig,
    base: Url,
    host: String,
}

impl GitlabSource {
    pub fn new(client: Client, svc: ExternalService) -> SourceResult<Self> {
        let config: GitlabConfig = serde_json::from_value(svc.config.clone())
            .map_err(|e| SourceError::Config(e.to_string()))?;

        let base_url = config.url.as_deref().unwrap_or("https://gitlab.com");
        let base = Url::parse(base_url).map_err(|e| SourceError::Config(e.to_string()))?;
        let host = base
            .host_str()
            .ok_or_else(|| SourceError::Config(format!("url has no host: {base_url}")))?
            .to_string();

        Ok(Self {
            client,
            svc,
            config,
            base,
            host,
        })
    }

    fn api(&self) -> String {
        format!("{}api/v4", self.base)
    }

    async fn get<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
    ) -> SourceResult<(T, Option<String>)> {
        debug!(url = %url, "GitLab API request");

        let mut req = self.client.get(url);
        if let Some(token) = &self.config.token {
            req = req.header("PRIVATE-TOKEN", token);
        }

        let response = req.send().await?;
        let next_link = extract_next_link(response.headers());

        match response.status() {
            StatusCode::OK => {
                let body = response.json::<T>().await?;
                Ok((body, next_link))
            }
            StatusCode::UNAUTHORIZED => Err(SourceError::Unauthorized),
            StatusCode::FORBIDDEN => Err(SourceError::Forbidden),
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

    fn to_repo(&self, gp: GitlabProjectResponse) -> Repo {
        let metadata = serde_json::to_value(&gp).unwrap_or(serde_json::Value::Null);
        let name = format!("{}/{}", self.host, gp.path_with_namespace);
        let mut repo = Repo {
            name: name.clone(),
            uri: name,
            description: gp.description.unwrap_or_default(),
            external_repo: ExternalRepoSpec::new(
                gp.id.to_string(),
                "gitlab",
                self.base.as_str(),
            ),
            private: gp.visibility != "public",
            archived: gp.archived,
            fork: gp.forked_from_project.is_some(),
            stars: gp.star_count,
            metadata,
            ..Default::default()
        };
        repo.sources.insert(
            self.svc.urn(),
            SourceInfo {
                id: gp.id.to_string(),
                clone_url: gp.http_url_to_repo,
            },
        );
        repo
    }
}

#[async_trait]
impl Source for GitlabSource {
    async fn list_repos(&self, results: mpsc::Sender<SourceItem>) {
        let scope = self.config.project_query.as_deref().unwrap_or("membership");
        let mut url = format!(
            "{}/projects?per_page=100&{}=true&order_by=id&sort=desc",
            self.api(),
            scope
        );

        loop {
            match self.get::<Vec<GitlabProjectResponse>>(&url).await {
                Ok((page, next)) => {
                    for gp in page {
                        if results.send(Ok(self.to_repo(gp))).await.is_err() {
                            return;
                        }
                    }
                    match next {
                        Some(n) => url = n,
                        None => break,
                    }
                }
                Err(e) => {
                    let _ = results.send(Err(e)).await;
                    return;
                }
            }
        }
    }

    async fn check_connection(&self) -> SourceResult<()> {
        let url = format!("{}/projects?per_page=1", self.api());
        self.get::<serde_json::Value>(&url).await?;
        Ok(())
    }

    fn external_services(&self) -> Vec<ExternalService> {
        vec![self.svc.clone()]
    }

    fn repo_getter(&self) -> Option<&dyn RepoGetter> {
        Some(self)
    }

    fn version_probe(&self) -> Option<&dyn VersionSource> {
        Some(self)
    }
}

#[async_trait]
impl RepoGetter for GitlabSource {
    async fn get_repo(&self, name: &str) -> SourceResult<Repo> {
        let prefix = format!("{}/", self.host);
        let project_path = name
            .strip_prefix(&prefix)
            .ok_or_else(|| SourceError::NotFound(name.to_string()))?;

        let url = format!(
            "{}/projects/{}",
            self.api(),
            urlencoding::encode(project_path)
        );
        let (gp, _) = self.get::<GitlabProjectResponse>(&url).await?;
        Ok(self.to_repo(gp))
    }
}

#[async_trait]
impl VersionSource for GitlabSource {
    async fn version(&self) -> SourceResult<String> {
        let url = format!("{}/version", self.api());
        let (v, _) = self.get::<GitlabVersionResponse>(&url).await?;
        Ok(v.version)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GitlabProjectResponse {
    id: i64,
    path_with_namespace: String,
    description: Option<String>,
    #[serde(default = "default_visibility")]
    visibility: String,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    star_count: i64,
    http_url_to_repo: String,
    #[serde(default)]
    forked_from_project: Option<serde_json::Value>,
}

fn default_visibility() -> String {
    "private".to_string()
}

#[derive(Debug, Deserialize)]
struct GitlabVersionResponse {
    version: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_core::ExternalServiceKind;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn service(url: &str) -> ExternalService {
        ExternalService {
            id: 2,
            kind: ExternalServiceKind::Gitlab,
            config: serde_json::json!({ "url": url, "token": "glpat-test" }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_list_projects_maps_visibility() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec![serde_json::json!({
                "id": 42,
                "path_with_namespace": "group/project",
                "description": null,
                "visibility": "internal",
                "archived": true,
                "star_count": 7,
                "http_url_to_repo": "https://example.com/group/project.git",
            })]))
            .mount(&server)
            .await;

        let source = GitlabSource::new(Client::new(), service(&server.uri())).unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        let mut items = Vec::new();
        tokio::join!(source.list_repos(tx), async {
            while let Some(item) = rx.recv().await {
                items.push(item);
            }
        });

        assert_eq!(items.len(), 1);
        let repo = items.remove(0).unwrap();
        assert!(repo.private, "internal visibility maps to private");
        assert!(repo.archived);
        assert_eq!(repo.stars, 7);
        assert_eq!(repo.external_repo.id, "42");
        assert!(repo.sources.contains_key("extsvc:gitlab:2"));
    }

    #[tokio::test]
    async fn test_get_repo_urlencodes_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/group%2Fproject"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 42,
                "path_with_namespace": "group/project",
                "visibility": "public",
                "http_url_to_repo": "https://example.com/group/project.git",
            })))
            .mount(&server)
            .await;

        let source = GitlabSource::new(Client::new(), service(&server.uri())).unwrap();
        let host = source.host.clone();
        let repo = source
            .repo_getter()
            .unwrap()
            .get_repo(&format!("{host}/group/project"))
            .await
            .unwrap();

        assert!(!repo.private);
        assert_eq!(repo.name, format!("{host}/group/project"));
    }
}
