use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Daemon configuration, loaded from a TOML file with environment
/// overrides for the secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub database_url: String,
    #[serde(default = "default_enqueue_interval")]
    pub enqueue_interval_seconds: u64,
    #[serde(default = "default_dequeue_interval")]
    pub dequeue_interval_seconds: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_min_sync_interval")]
    pub min_sync_interval_seconds: u64,
    /// Reject any sourced private repository.
    #[serde(default)]
    pub public_only: bool,
    /// `None` means the license is unrestricted.
    #[serde(default)]
    pub max_private_repos: Option<u64>,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_prune_config")]
    pub prune: PruneConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneConfig {
    /// Six-field cron expression driving the prune pass.
    pub cron: String,
    /// Token bucket refill rate for source revalidation calls.
    pub requests_per_second: u32,
    /// Deadline for a single limiter wait before the pass aborts.
    pub wait_deadline_seconds: u64,
}

fn default_enqueue_interval() -> u64 {
    60
}

fn default_dequeue_interval() -> u64 {
    10
}

fn default_workers() -> usize {
    3
}

fn default_min_sync_interval() -> u64 {
    60
}

fn default_metrics_port() -> u16 {
    9098
}

fn default_prune_config() -> PruneConfig {
    PruneConfig {
        cron: "0 0 * * * *".to_string(),
        requests_per_second: 1,
        wait_deadline_seconds: 30,
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            enqueue_interval_seconds: default_enqueue_interval(),
            dequeue_interval_seconds: default_dequeue_interval(),
            workers: default_workers(),
            min_sync_interval_seconds: default_min_sync_interval(),
            public_only: false,
            max_private_repos: None,
            metrics_port: default_metrics_port(),
            prune: default_prune_config(),
        }
    }
}

impl CatalogConfig {
    /// Reads the TOML file when given, otherwise starts from defaults;
    /// `DATABASE_URL` in the environment wins either way.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut cfg = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Self::default(),
        };

        if let Ok(url) = std::env::var("DATABASE_URL") {
            cfg.database_url = url;
        }

        if cfg.database_url.is_empty() {
            anyhow::bail!("no database URL configured (set database_url or DATABASE_URL)");
        }

        Ok(cfg)
    }

    pub fn enqueue_interval(&self) -> Duration {
        Duration::from_secs(self.enqueue_interval_seconds)
    }

    pub fn dequeue_interval(&self) -> Duration {
        Duration::from_secs(self.dequeue_interval_seconds)
    }

    pub fn min_sync_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.min_sync_interval_seconds as i64)
    }

    pub fn prune_wait_deadline(&self) -> Duration {
        Duration::from_secs(self.prune.wait_deadline_seconds)
    }
}
