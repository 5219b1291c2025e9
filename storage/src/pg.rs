use crate::error::{db_err, is_lock_not_available};
use async_trait::async_trait;
use catalog_core::{
    CatalogStore, ExternalService, ExternalServiceKind, PrivateRepoGate, Repo, SourceInfo,
    StoreError, StoreResult, StoreTx, SyncJob, SyncJobState,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, Postgres};
use sqlx::{AssertSqlSafe, Row, Transaction};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Postgres-backed implementation of the catalog store contract.
pub struct PgStore {
    pool: PgPool,
    gate: Arc<dyn PrivateRepoGate>,
}

impl PgStore {
    pub fn new(pool: PgPool, gate: Arc<dyn PrivateRepoGate>) -> Self {
        Self { pool, gate }
    }

    pub async fn connect(url: &str, gate: Arc<dyn PrivateRepoGate>) -> StoreResult<Self> {
        let pool = PgPool::connect(url).await.map_err(db_err)?;
        Ok(Self::new(pool, gate))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the catalog tables. Idempotent.
    pub async fn initialize_schema(&self) -> StoreResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS external_services (
                id BIGSERIAL PRIMARY KEY,
                kind TEXT NOT NULL,
                display_name TEXT NOT NULL DEFAULT '',
                config JSONB NOT NULL DEFAULT '{}',
                cloud_default BOOLEAN NOT NULL DEFAULT false,
                unrestricted BOOLEAN NOT NULL DEFAULT false,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                next_sync_at TIMESTAMPTZ,
                last_sync_at TIMESTAMPTZ,
                deleted_at TIMESTAMPTZ
            )"
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS repos (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL,
                uri TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                external_id TEXT NOT NULL,
                external_service_type TEXT NOT NULL,
                external_service_id TEXT NOT NULL,
                private BOOLEAN NOT NULL DEFAULT false,
                archived BOOLEAN NOT NULL DEFAULT false,
                fork BOOLEAN NOT NULL DEFAULT false,
                stars BIGINT NOT NULL DEFAULT 0,
                metadata JSONB NOT NULL DEFAULT 'null',
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                deleted_at TIMESTAMPTZ,
                last_error TEXT
            )"
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        // Name uniqueness is case-insensitive and only applies to live rows:
        // tombstones keep their name for audit without blocking reuse.
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS repos_name_unique
             ON repos (lower(name)) WHERE deleted_at IS NULL"
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS repos_external_identity
             ON repos (external_service_id, external_service_type, external_id)
             WHERE deleted_at IS NULL"
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS external_service_repos (
                external_service_id BIGINT NOT NULL
                    REFERENCES external_services(id) ON DELETE CASCADE,
                repo_id BIGINT NOT NULL REFERENCES repos(id) ON DELETE CASCADE,
                source_id TEXT NOT NULL,
                clone_url TEXT NOT NULL,
                PRIMARY KEY (external_service_id, repo_id)
            )"
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS external_service_sync_jobs (
                id BIGSERIAL PRIMARY KEY,
                external_service_id BIGINT NOT NULL
                    REFERENCES external_services(id) ON DELETE CASCADE,
                state TEXT NOT NULL DEFAULT 'queued',
                failure_message TEXT,
                started_at TIMESTAMPTZ,
                finished_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS sync_jobs_state
             ON external_service_sync_jobs (state, external_service_id)"
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    /// Inserts a new external service, assigning its id in place.
    pub async fn create_external_service(&self, svc: &mut ExternalService) -> StoreResult<()> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO external_services
                 (kind, display_name, config, cloud_default, unrestricted, next_sync_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id"
        )
        .bind(svc.kind.to_string())
        .bind(&svc.display_name)
        .bind(&svc.config)
        .bind(svc.cloud_default)
        .bind(svc.unrestricted)
        .bind(svc.next_sync_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        svc.id = id;
        Ok(())
    }

    /// Soft-deletes an external service, locking it against further job
    /// enqueue while the deletion is in flight.
    pub async fn delete_external_service(&self, id: i64) -> StoreResult<()> {
        sqlx::query(
            "UPDATE external_services SET deleted_at = now(), updated_at = now()
             WHERE id = $1 AND deleted_at IS NULL"
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    type Tx = PgTx;

    async fn transact(&self) -> StoreResult<PgTx> {
        let tx = self.pool.begin().await.map_err(db_err)?;
        Ok(PgTx {
            tx,
            gate: self.gate.clone(),
        })
    }

    async fn external_service(&self, id: i64) -> StoreResult<ExternalService> {
        let row = sqlx::query_as::<_, ServiceRow>(AssertSqlSafe(format!(
            "SELECT {SERVICE_COLUMNS} FROM external_services
             WHERE id = $1 AND deleted_at IS NULL"
        )))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.ok_or(StoreError::ServiceNotFound(id))?.try_into()
    }

    async fn list_external_services(&self) -> StoreResult<Vec<ExternalService>> {
        let rows = sqlx::query_as::<_, ServiceRow>(AssertSqlSafe(format!(
            "SELECT {SERVICE_COLUMNS} FROM external_services
             WHERE deleted_at IS NULL ORDER BY id"
        )))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn repo_by_name(&self, name: &str) -> StoreResult<Option<Repo>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        repo_by_name(&mut conn, name).await
    }

    async fn list_repos(&self) -> StoreResult<Vec<Repo>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        let rows = sqlx::query_as::<_, RepoRow>(AssertSqlSafe(format!(
            "SELECT {REPO_COLUMNS} FROM repos WHERE deleted_at IS NULL ORDER BY id"
        )))
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;

        let mut repos: Vec<Repo> = rows.into_iter().map(Into::into).collect();
        attach_sources(&mut conn, &mut repos).await?;
        Ok(repos)
    }

    async fn list_repos_with_last_errors(&self, limit: i64) -> StoreResult<Vec<Repo>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        let rows = sqlx::query_as::<_, RepoRow>(AssertSqlSafe(format!(
            "SELECT {REPO_COLUMNS} FROM repos
             WHERE deleted_at IS NULL AND last_error IS NOT NULL AND last_error <> ''
             ORDER BY updated_at
             LIMIT $1"
        )))
        .bind(limit)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;

        let mut repos: Vec<Repo> = rows.into_iter().map(Into::into).collect();
        attach_sources(&mut conn, &mut repos).await?;
        Ok(repos)
    }

    async fn enqueue_sync_jobs(&self, ignore_site_admin: bool) -> StoreResult<()> {
        // Platform-managed (cloud default) services are excluded unless the
        // caller is the platform's own scheduler. Services mid-deletion or
        // locked by a concurrent transaction are skipped silently.
        let filter = if ignore_site_admin {
            "TRUE"
        } else {
            "cloud_default = false"
        };

        let query = format!(
            "WITH due AS (
                SELECT id FROM external_services
                WHERE (next_sync_at <= now() OR next_sync_at IS NULL)
                  AND deleted_at IS NULL
                  AND {filter}
                FOR UPDATE SKIP LOCKED
            ),
            busy AS (
                SELECT DISTINCT external_service_id AS id
                FROM external_service_sync_jobs
                WHERE state IN ('queued', 'processing')
            )
            INSERT INTO external_service_sync_jobs (external_service_id)
            SELECT id FROM due EXCEPT SELECT id FROM busy"
        );

        sqlx::query(AssertSqlSafe(query))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn enqueue_single_sync_job(&self, service_id: i64) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let locked = sqlx::query_scalar::<_, bool>(
            "SELECT cloud_default FROM external_services
             WHERE id = $1 AND deleted_at IS NULL
             FOR UPDATE NOWAIT"
        )
        .bind(service_id)
        .fetch_optional(&mut *tx)
        .await;

        let cloud_default = match locked {
            Ok(Some(cloud_default)) => cloud_default,
            // Service gone or mid-deletion: nothing to enqueue.
            Ok(None) => return Ok(()),
            // Locked by a concurrent transaction (e.g. being deleted):
            // skip silently, the next scheduler tick sorts it out.
            Err(e) if is_lock_not_available(&e) => {
                debug!(service_id, "service row locked, skipping enqueue");
                return Ok(());
            }
            Err(e) => return Err(db_err(e)),
        };

        if cloud_default {
            return Ok(());
        }

        sqlx::query(
            "INSERT INTO external_service_sync_jobs (external_service_id)
             SELECT $1
             WHERE NOT EXISTS (
                 SELECT 1 FROM external_service_sync_jobs
                 WHERE external_service_id = $1
                   AND state IN ('queued', 'processing')
             )"
        )
        .bind(service_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn dequeue_sync_job(&self) -> StoreResult<Option<SyncJob>> {
        let row = sqlx::query_as::<_, JobRow>(
            "UPDATE external_service_sync_jobs
             SET state = 'processing', started_at = now()
             WHERE id = (
                 SELECT id FROM external_service_sync_jobs
                 WHERE state = 'queued'
                 ORDER BY id
                 FOR UPDATE SKIP LOCKED
                 LIMIT 1
             )
             RETURNING id, external_service_id, state, failure_message,
                       started_at, finished_at"
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(TryInto::try_into).transpose()
    }

    async fn finish_sync_job(
        &self,
        job_id: i64,
        state: SyncJobState,
        failure_message: Option<String>,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE external_service_sync_jobs
             SET state = $2, failure_message = $3, finished_at = now()
             WHERE id = $1"
        )
        .bind(job_id)
        .bind(state.to_string())
        .bind(failure_message)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_sync_jobs(&self) -> StoreResult<Vec<SyncJob>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT id, external_service_id, state, failure_message, started_at, finished_at
             FROM external_service_sync_jobs ORDER BY id"
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

/// One transactional unit of work. Row locks taken by the update and
/// delete statements here are what serialize concurrent reconciliations of
/// overlapping repositories.
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
    gate: Arc<dyn PrivateRepoGate>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn list_external_service_repos(&mut self, service_id: i64) -> StoreResult<Vec<Repo>> {
        let rows = sqlx::query_as::<_, RepoRow>(AssertSqlSafe(format!(
            "SELECT {REPO_COLUMNS} FROM repos
             WHERE deleted_at IS NULL AND id IN (
                 SELECT repo_id FROM external_service_repos WHERE external_service_id = $1
             )
             ORDER BY id"
        )))
        .bind(service_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;

        let mut repos: Vec<Repo> = rows.into_iter().map(Into::into).collect();
        attach_sources(&mut self.tx, &mut repos).await?;
        Ok(repos)
    }

    async fn list_conflicting_repos(&mut self, observed: &[Repo]) -> StoreResult<Vec<Repo>> {
        if observed.is_empty() {
            return Ok(Vec::new());
        }

        let mut ext_ids = Vec::with_capacity(observed.len());
        let mut ext_types = Vec::with_capacity(observed.len());
        let mut ext_service_ids = Vec::with_capacity(observed.len());
        let mut names = Vec::with_capacity(observed.len());
        for repo in observed {
            ext_ids.push(repo.external_repo.id.clone());
            ext_types.push(repo.external_repo.service_type.clone());
            ext_service_ids.push(repo.external_repo.service_id.clone());
            names.push(repo.folded_name());
        }

        let rows = sqlx::query_as::<_, RepoRow>(AssertSqlSafe(format!(
            "SELECT {REPO_COLUMNS} FROM repos
             WHERE deleted_at IS NULL
               AND ((external_id, external_service_type, external_service_id) IN (
                        SELECT * FROM unnest($1::text[], $2::text[], $3::text[])
                    )
                    OR lower(name) = ANY($4))
             ORDER BY id"
        )))
        .bind(&ext_ids)
        .bind(&ext_types)
        .bind(&ext_service_ids)
        .bind(&names)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;

        let mut repos: Vec<Repo> = rows.into_iter().map(Into::into).collect();
        attach_sources(&mut self.tx, &mut repos).await?;
        Ok(repos)
    }

    async fn repo_by_name(&mut self, name: &str) -> StoreResult<Option<Repo>> {
        repo_by_name(&mut self.tx, name).await
    }

    async fn upsert_repos(&mut self, repos: &mut [Repo]) -> StoreResult<()> {
        if repos.is_empty() {
            return Ok(());
        }

        let mut private_count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM repos WHERE private AND deleted_at IS NULL"
        )
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;

        // A batch may swap names between rows. The unique index is checked
        // per statement, so existing rows get a collision-free placeholder
        // first and their real names in the per-repo updates below. This
        // also takes the row locks up front.
        let update_ids: Vec<i64> = repos.iter().filter(|r| r.id != 0).map(|r| r.id).collect();
        if !update_ids.is_empty() {
            sqlx::query("UPDATE repos SET name = chr(1) || id::text WHERE id = ANY($1)")
                .bind(&update_ids)
                .execute(&mut *self.tx)
                .await
                .map_err(db_err)?;
        }

        for repo in repos.iter_mut() {
            if repo.id == 0 {
                self.gate.check(private_count as u64, repo, false)?;

                // Two passes can race to insert the same identity; the
                // arbiter merges the loser into the existing live row.
                let id: i64 = sqlx::query_scalar(
                    "INSERT INTO repos
                         (name, uri, description, external_id, external_service_type,
                          external_service_id, private, archived, fork, stars, metadata,
                          created_at, updated_at, last_error)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                     ON CONFLICT (external_service_id, external_service_type, external_id)
                         WHERE deleted_at IS NULL
                     DO UPDATE SET
                         name = EXCLUDED.name, uri = EXCLUDED.uri,
                         description = EXCLUDED.description, private = EXCLUDED.private,
                         archived = EXCLUDED.archived, fork = EXCLUDED.fork,
                         stars = EXCLUDED.stars, metadata = EXCLUDED.metadata,
                         updated_at = EXCLUDED.updated_at, last_error = EXCLUDED.last_error
                     RETURNING id"
                )
                .bind(&repo.name)
                .bind(&repo.uri)
                .bind(&repo.description)
                .bind(&repo.external_repo.id)
                .bind(&repo.external_repo.service_type)
                .bind(&repo.external_repo.service_id)
                .bind(repo.private)
                .bind(repo.archived)
                .bind(repo.fork)
                .bind(repo.stars)
                .bind(&repo.metadata)
                .bind(repo.created_at)
                .bind(repo.updated_at)
                .bind(&repo.last_error)
                .fetch_one(&mut *self.tx)
                .await
                .map_err(db_err)?;

                repo.id = id;
                if repo.private {
                    private_count += 1;
                }
            } else {
                // The row lock taken here is what serializes two syncers
                // reconciling the same repository.
                let was_private: bool =
                    sqlx::query_scalar("SELECT private FROM repos WHERE id = $1 FOR UPDATE")
                        .bind(repo.id)
                        .fetch_optional(&mut *self.tx)
                        .await
                        .map_err(db_err)?
                        .unwrap_or(false);

                let others = private_count - i64::from(was_private);
                self.gate.check(others as u64, repo, was_private)?;

                sqlx::query(
                    "UPDATE repos
                     SET name = $2, uri = $3, description = $4, external_id = $5,
                         external_service_type = $6, external_service_id = $7,
                         private = $8, archived = $9, fork = $10, stars = $11,
                         metadata = $12, updated_at = $13
                     WHERE id = $1"
                )
                .bind(repo.id)
                .bind(&repo.name)
                .bind(&repo.uri)
                .bind(&repo.description)
                .bind(&repo.external_repo.id)
                .bind(&repo.external_repo.service_type)
                .bind(&repo.external_repo.service_id)
                .bind(repo.private)
                .bind(repo.archived)
                .bind(repo.fork)
                .bind(repo.stars)
                .bind(&repo.metadata)
                .bind(repo.updated_at)
                .execute(&mut *self.tx)
                .await
                .map_err(db_err)?;

                private_count = private_count - i64::from(was_private) + i64::from(repo.private);
            }
        }

        Ok(())
    }

    async fn upsert_sources(&mut self, urn: &str, repos: &[Repo]) -> StoreResult<()> {
        let Some(service_id) = parse_urn_service_id(urn) else {
            warn!(urn = %urn, "unparseable source URN, skipping");
            return Ok(());
        };

        for repo in repos {
            if repo.id == 0 {
                continue;
            }

            // Only this service's row is written; associations committed by
            // concurrent syncs of other services stay untouched.
            match repo.sources.get(urn) {
                Some(info) => {
                    sqlx::query(
                        "INSERT INTO external_service_repos
                             (external_service_id, repo_id, source_id, clone_url)
                         VALUES ($1, $2, $3, $4)
                         ON CONFLICT (external_service_id, repo_id)
                         DO UPDATE SET source_id = $3, clone_url = $4"
                    )
                    .bind(service_id)
                    .bind(repo.id)
                    .bind(&info.id)
                    .bind(&info.clone_url)
                    .execute(&mut *self.tx)
                    .await
                    .map_err(db_err)?;
                }
                None => {
                    sqlx::query(
                        "DELETE FROM external_service_repos
                         WHERE external_service_id = $1 AND repo_id = $2"
                    )
                    .bind(service_id)
                    .bind(repo.id)
                    .execute(&mut *self.tx)
                    .await
                    .map_err(db_err)?;
                }
            }
        }

        Ok(())
    }

    async fn soft_delete_repos(&mut self, repos: &[Repo], now: DateTime<Utc>) -> StoreResult<()> {
        let ids: Vec<i64> = repos.iter().map(|r| r.id).filter(|id| *id != 0).collect();
        if ids.is_empty() {
            return Ok(());
        }

        sqlx::query(
            "UPDATE repos SET deleted_at = $2, updated_at = $2
             WHERE id = ANY($1) AND deleted_at IS NULL"
        )
        .bind(&ids)
        .bind(now)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;

        sqlx::query("DELETE FROM external_service_repos WHERE repo_id = ANY($1)")
            .bind(&ids)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;

        Ok(())
    }

    async fn upsert_external_service(&mut self, svc: &ExternalService) -> StoreResult<()> {
        sqlx::query(
            "UPDATE external_services
             SET display_name = $2, config = $3, cloud_default = $4, unrestricted = $5,
                 next_sync_at = $6, last_sync_at = $7, updated_at = now()
             WHERE id = $1"
        )
        .bind(svc.id)
        .bind(&svc.display_name)
        .bind(&svc.config)
        .bind(svc.cloud_default)
        .bind(svc.unrestricted)
        .bind(svc.next_sync_at)
        .bind(svc.last_sync_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn done(self, ok: bool) -> StoreResult<()> {
        if ok {
            self.tx.commit().await.map_err(db_err)
        } else {
            self.tx.rollback().await.map_err(db_err)
        }
    }
}

const REPO_COLUMNS: &str = "id, name, uri, description, external_id, external_service_type, \
     external_service_id, private, archived, fork, stars, metadata, created_at, updated_at, \
     deleted_at, last_error";

const SERVICE_COLUMNS: &str = "id, kind, display_name, config, cloud_default, unrestricted, \
     created_at, updated_at, next_sync_at, last_sync_at, deleted_at";

async fn repo_by_name(conn: &mut PgConnection, name: &str) -> StoreResult<Option<Repo>> {
    let row = sqlx::query_as::<_, RepoRow>(AssertSqlSafe(format!(
        "SELECT {REPO_COLUMNS} FROM repos
         WHERE deleted_at IS NULL AND lower(name) = lower($1)"
    )))
    .bind(name)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?;

    let Some(row) = row else {
        return Ok(None);
    };

    let mut repos = vec![Repo::from(row)];
    attach_sources(conn, &mut repos).await?;
    Ok(repos.pop())
}

async fn attach_sources(conn: &mut PgConnection, repos: &mut [Repo]) -> StoreResult<()> {
    if repos.is_empty() {
        return Ok(());
    }

    let ids: Vec<i64> = repos.iter().map(|r| r.id).collect();
    let rows = sqlx::query(
        "SELECT esr.repo_id, esr.external_service_id, es.kind, esr.source_id, esr.clone_url
         FROM external_service_repos esr
         JOIN external_services es ON es.id = esr.external_service_id
         WHERE esr.repo_id = ANY($1)"
    )
    .bind(&ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err)?;

    let mut by_repo: HashMap<i64, HashMap<String, SourceInfo>> = HashMap::new();
    for row in rows {
        let repo_id: i64 = row.get("repo_id");
        let service_id: i64 = row.get("external_service_id");
        let kind: String = row.get("kind");
        let urn = format!("extsvc:{}:{}", kind.to_lowercase(), service_id);
        by_repo.entry(repo_id).or_default().insert(
            urn,
            SourceInfo {
                id: row.get("source_id"),
                clone_url: row.get("clone_url"),
            },
        );
    }

    for repo in repos {
        repo.sources = by_repo.remove(&repo.id).unwrap_or_default();
    }

    Ok(())
}

/// Extracts the service id from a `extsvc:<kind>:<id>` URN.
fn parse_urn_service_id(urn: &str) -> Option<i64> {
    urn.rsplit(':').next()?.parse().ok()
}

#[derive(sqlx::FromRow)]
struct RepoRow {
    id: i64,
    name: String,
    uri: String,
    description: String,
    external_id: String,
    external_service_type: String,
    external_service_id: String,
    private: bool,
    archived: bool,
    fork: bool,
    stars: i64,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl From<RepoRow> for Repo {
    fn from(row: RepoRow) -> Self {
        Repo {
            id: row.id,
            name: row.name,
            uri: row.uri,
            description: row.description,
            external_repo: catalog_core::ExternalRepoSpec::new(
                row.external_id,
                row.external_service_type,
                row.external_service_id,
            ),
            private: row.private,
            archived: row.archived,
            fork: row.fork,
            stars: row.stars,
            metadata: row.metadata,
            sources: HashMap::new(),
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
            last_error: row.last_error,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ServiceRow {
    id: i64,
    kind: String,
    display_name: String,
    config: serde_json::Value,
    cloud_default: bool,
    unrestricted: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    next_sync_at: Option<DateTime<Utc>>,
    last_sync_at: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<ServiceRow> for ExternalService {
    type Error = StoreError;

    fn try_from(row: ServiceRow) -> StoreResult<Self> {
        let kind = ExternalServiceKind::from_str(&row.kind)
            .map_err(|_| StoreError::Database(format!("unknown service kind: {}", row.kind)))?;

        Ok(ExternalService {
            id: row.id,
            kind,
            display_name: row.display_name,
            config: row.config,
            cloud_default: row.cloud_default,
            unrestricted: row.unrestricted,
            created_at: row.created_at,
            updated_at: row.updated_at,
            next_sync_at: row.next_sync_at,
            last_sync_at: row.last_sync_at,
            deleted_at: row.deleted_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    external_service_id: i64,
    state: String,
    failure_message: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for SyncJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> StoreResult<Self> {
        let state = SyncJobState::from_str(&row.state)
            .map_err(|_| StoreError::Database(format!("unknown job state: {}", row.state)))?;

        Ok(SyncJob {
            id: row.id,
            external_service_id: row.external_service_id,
            state,
            failure_message: row.failure_message,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}
