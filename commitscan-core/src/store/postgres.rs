//! Postgres-backed job store and ledgers.
//!
//! Claims are a single `UPDATE ... FROM (SELECT ... FOR UPDATE SKIP LOCKED)`
//! so concurrent workers, in this process or others, never receive the same
//! job. Completions lock the row, re-check the lease and write the new state
//! in one transaction.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    FromRow, PgPool, Postgres, QueryBuilder, postgres::PgPoolOptions,
    types::Json,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    JobCompletion, JobSort, JobStore, apply_completion, check_retryable,
};
use crate::{
    error::{OrchestratorError, Result},
    job::{
        AttemptError, CommitSpec, ConfigOverride, EnqueueSummary, JobFilter,
        JobId, JobStatus, Page, PageRequest, ProjectId, ScanJob, StatusCounts,
    },
    lease::{ClaimRequest, ClaimedJob, LeaseId, LeaseRenewal},
    ledger::{
        FailedRecordId, FailedScanRecord, FailureFilter, FailureLedger,
        FailureSort, FailureStatus, RecordOutcome, ResultLedger, ScanResult,
    },
    outcome::FailureReason,
};

const JOB_COLUMNS: &str = "id, project_id, commit_sha, project_key, \
    repository_url, status, retry_count, max_retries, attempts, last_error, \
    error_history, assigned_instance, component_key, config_override, \
    config_source, lease_id, lease_owner, lease_expires_at, claimed_from, \
    available_at, created_at, updated_at, last_started_at, last_finished_at";

const FAILURE_COLUMNS: &str = "id, job_id, project_id, commit_sha, \
    project_key, repository_url, reason, classification, retry_count, \
    max_retries, attempts, history, status, config_override, config_source, \
    requeued_job_id, created_at, updated_at, resolved_at";

const ACTIVE_STATUSES: &str = "('PENDING', 'RUNNING', 'FAILED_TEMP')";

/// Durable store backed by Postgres.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresStore {
    /// Wrap an existing pool after a health check.
    pub async fn new(pool: PgPool) -> Result<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| {
                OrchestratorError::Store(format!(
                    "job store failed Postgres health check: {e}"
                ))
            })?;
        info!("job store connected to Postgres");
        Ok(Self { pool })
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| {
                OrchestratorError::Store(format!("connect to Postgres: {e}"))
            })?;
        Self::new(pool).await
    }

    /// Apply embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        crate::MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    async fn load_job_for_update(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        job_id: JobId,
    ) -> Result<ScanJob> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM scan_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(job_id.0)
        .fetch_optional(&mut **tx)
        .await?;
        row.ok_or_else(|| OrchestratorError::NotFound(format!("job {job_id}")))?
            .try_into()
    }

    async fn insert_job(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        job: &ScanJob,
    ) -> Result<()> {
        let (override_content, override_source) = split_override(&job.config_override);
        sqlx::query(
            r#"
            INSERT INTO scan_jobs (
                id, project_id, commit_sha, project_key, repository_url,
                status, retry_count, max_retries, attempts, config_override,
                config_source, available_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, $9, $10, $11, $12, $12)
            "#,
        )
        .bind(job.id.0)
        .bind(job.project_id.0)
        .bind(&job.commit_sha)
        .bind(&job.project_key)
        .bind(&job.repository_url)
        .bind(job.status.as_str())
        .bind(to_i32(job.retry_count))
        .bind(to_i32(job.max_retries))
        .bind(override_content)
        .bind(override_source)
        .bind(job.available_at)
        .bind(job.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Serialise writers that create or revive jobs of one project, so the
    /// one-active-job-per-commit check holds until commit.
    async fn lock_project(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        project_id: ProjectId,
    ) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1::text))")
            .bind(project_id.0.to_string())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn active_job(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        project_id: ProjectId,
        commit_sha: &str,
        except: Option<JobId>,
    ) -> Result<Option<Uuid>> {
        let id: Option<Uuid> = sqlx::query_scalar(&format!(
            r#"
            SELECT id FROM scan_jobs
            WHERE project_id = $1 AND commit_sha = $2
              AND status IN {ACTIVE_STATUSES}
              AND ($3::uuid IS NULL OR id <> $3)
            LIMIT 1
            "#
        ))
        .bind(project_id.0)
        .bind(commit_sha)
        .bind(except.map(|id| id.0))
        .fetch_optional(&mut **tx)
        .await?;
        Ok(id)
    }
}

#[derive(FromRow)]
struct JobRow {
    id: Uuid,
    project_id: Uuid,
    commit_sha: String,
    project_key: String,
    repository_url: Option<String>,
    status: String,
    retry_count: i32,
    max_retries: i32,
    attempts: i32,
    last_error: Option<String>,
    error_history: Json<Vec<AttemptError>>,
    assigned_instance: Option<String>,
    component_key: Option<String>,
    config_override: Option<String>,
    config_source: Option<String>,
    lease_id: Option<Uuid>,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    claimed_from: Option<String>,
    available_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_started_at: Option<DateTime<Utc>>,
    last_finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for ScanJob {
    type Error = OrchestratorError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(ScanJob {
            id: JobId(row.id),
            project_id: ProjectId(row.project_id),
            commit_sha: row.commit_sha,
            project_key: row.project_key,
            repository_url: row.repository_url,
            status: row.status.parse()?,
            retry_count: from_i32(row.retry_count),
            max_retries: from_i32(row.max_retries),
            attempts: from_i32(row.attempts),
            last_error: row.last_error,
            error_history: row.error_history.0,
            assigned_instance: row.assigned_instance,
            component_key: row.component_key,
            config_override: join_override(row.config_override, row.config_source),
            lease_id: row.lease_id.map(LeaseId),
            lease_owner: row.lease_owner,
            lease_expires_at: row.lease_expires_at,
            claimed_from: row
                .claimed_from
                .map(|s| s.parse::<JobStatus>())
                .transpose()?,
            available_at: row.available_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_started_at: row.last_started_at,
            last_finished_at: row.last_finished_at,
        })
    }
}

#[derive(FromRow)]
struct ResultRow {
    job_id: Uuid,
    project_id: Uuid,
    commit_sha: String,
    component_key: String,
    instance: Option<String>,
    attempt: i32,
    measures: Json<std::collections::BTreeMap<String, String>>,
    created_at: DateTime<Utc>,
}

impl From<ResultRow> for ScanResult {
    fn from(row: ResultRow) -> Self {
        ScanResult {
            job_id: JobId(row.job_id),
            project_id: ProjectId(row.project_id),
            commit_sha: row.commit_sha,
            component_key: row.component_key,
            instance: row.instance,
            attempt: from_i32(row.attempt),
            measures: row.measures.0,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct FailureRow {
    id: Uuid,
    job_id: Uuid,
    project_id: Uuid,
    commit_sha: String,
    project_key: String,
    repository_url: Option<String>,
    reason: String,
    classification: String,
    retry_count: i32,
    max_retries: i32,
    attempts: i32,
    history: Json<Vec<AttemptError>>,
    status: String,
    config_override: Option<String>,
    config_source: Option<String>,
    requeued_job_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl TryFrom<FailureRow> for FailedScanRecord {
    type Error = OrchestratorError;

    fn try_from(row: FailureRow) -> Result<Self> {
        Ok(FailedScanRecord {
            id: FailedRecordId(row.id),
            job_id: JobId(row.job_id),
            project_id: ProjectId(row.project_id),
            commit_sha: row.commit_sha,
            project_key: row.project_key,
            repository_url: row.repository_url,
            reason: row.reason,
            classification: row.classification,
            retry_count: from_i32(row.retry_count),
            max_retries: from_i32(row.max_retries),
            attempts: from_i32(row.attempts),
            history: row.history.0,
            status: row.status.parse()?,
            config_override: join_override(row.config_override, row.config_source),
            requeued_job_id: row.requeued_job_id.map(JobId),
            created_at: row.created_at,
            updated_at: row.updated_at,
            resolved_at: row.resolved_at,
        })
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn from_i32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn split_override(
    config_override: &Option<ConfigOverride>,
) -> (Option<String>, Option<String>) {
    match config_override {
        Some(o) => (Some(o.content.clone()), Some(o.source.clone())),
        None => (None, None),
    }
}

fn join_override(
    content: Option<String>,
    source: Option<String>,
) -> Option<ConfigOverride> {
    content.map(|content| ConfigOverride::new(content, source))
}

fn push_job_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &JobFilter) {
    qb.push(" WHERE TRUE");
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(project) = filter.project_id {
        qb.push(" AND project_id = ").push_bind(project.0);
    }
}

fn push_failure_filter(
    qb: &mut QueryBuilder<'_, Postgres>,
    filter: &FailureFilter,
) {
    qb.push(" WHERE TRUE");
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(project) = filter.project_id {
        qb.push(" AND project_id = ").push_bind(project.0);
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn enqueue_commits(
        &self,
        project_id: ProjectId,
        commits: Vec<CommitSpec>,
        max_retries: u32,
    ) -> Result<EnqueueSummary> {
        for commit in &commits {
            commit.validate()?;
        }

        let mut tx = self.pool.begin().await.map_err(|e| {
            OrchestratorError::Store(format!("begin enqueue tx failed: {e}"))
        })?;

        Self::lock_project(&mut tx, project_id).await?;

        let mut summary = EnqueueSummary::default();
        let mut batch = std::collections::HashSet::new();
        for commit in commits {
            let job = ScanJob::pending(project_id, &commit, max_retries);
            if !batch.insert(job.commit_sha.clone()) {
                summary.merged += 1;
                continue;
            }
            let inserted = sqlx::query(&format!(
                r#"
                INSERT INTO scan_jobs (
                    id, project_id, commit_sha, project_key, repository_url,
                    status, retry_count, max_retries, available_at,
                    created_at, updated_at
                )
                SELECT $1, $2, $3, $4, $5, 'PENDING', 0, $6, NOW(), NOW(), NOW()
                WHERE NOT EXISTS (
                    SELECT 1 FROM scan_jobs
                    WHERE project_id = $2
                      AND commit_sha = $3
                      AND status IN {ACTIVE_STATUSES}
                )
                "#
            ))
            .bind(job.id.0)
            .bind(project_id.0)
            .bind(&job.commit_sha)
            .bind(&job.project_key)
            .bind(&job.repository_url)
            .bind(to_i32(max_retries))
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if inserted == 1 {
                summary.created.push(job.id);
            } else {
                summary.merged += 1;
            }
        }

        tx.commit().await.map_err(|e| {
            OrchestratorError::Store(format!("enqueue tx commit failed: {e}"))
        })?;
        debug!(
            project = %project_id,
            created = summary.created.len(),
            merged = summary.merged,
            "enqueued commits"
        );
        Ok(summary)
    }

    async fn claim_next(&self, request: ClaimRequest) -> Result<Vec<ClaimedJob>> {
        let statuses: Vec<&str> =
            request.statuses.iter().map(JobStatus::as_str).collect();
        let ttl_ms = request.lease_ttl.num_milliseconds();

        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            r#"
            WITH picked AS (
                SELECT id
                FROM scan_jobs
                WHERE (status = ANY($1) AND available_at <= NOW())
                   OR (status = 'RUNNING'
                       AND lease_expires_at <= NOW()
                       AND claimed_from = ANY($1))
                ORDER BY available_at, created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE scan_jobs j
            SET claimed_from = CASE
                    WHEN j.status = 'RUNNING' THEN j.claimed_from
                    ELSE j.status
                END,
                status = 'RUNNING',
                lease_id = gen_random_uuid(),
                lease_owner = $3,
                lease_expires_at = NOW() + ($4::bigint) * INTERVAL '1 millisecond',
                attempts = j.attempts + 1,
                last_started_at = NOW(),
                updated_at = NOW()
            FROM picked
            WHERE j.id = picked.id
            RETURNING {}
            "#,
            JOB_COLUMNS
                .split(", ")
                .map(|c| format!("j.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(&statuses)
        .bind(i64::try_from(request.limit).unwrap_or(i64::MAX))
        .bind(&request.worker_id)
        .bind(ttl_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OrchestratorError::Store(format!("claim failed: {e}")))?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let job: ScanJob = row.try_into()?;
            let (Some(lease_id), Some(expires_at)) =
                (job.lease_id, job.lease_expires_at)
            else {
                return Err(OrchestratorError::Internal(format!(
                    "claimed job {} came back without a lease",
                    job.id
                )));
            };
            claimed.push(ClaimedJob {
                lease_id,
                lease_owner: request.worker_id.clone(),
                expires_at,
                job,
            });
        }
        claimed.sort_by(|a, b| {
            a.job
                .available_at
                .cmp(&b.job.available_at)
                .then(a.job.created_at.cmp(&b.job.created_at))
        });
        Ok(claimed)
    }

    async fn renew_lease(&self, renewal: LeaseRenewal) -> Result<DateTime<Utc>> {
        let expires_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            UPDATE scan_jobs
            SET lease_expires_at = NOW() + ($3::bigint) * INTERVAL '1 millisecond',
                updated_at = NOW()
            WHERE id = $1
              AND lease_id = $2
              AND status = 'RUNNING'
              AND lease_expires_at > NOW()
            RETURNING lease_expires_at
            "#,
        )
        .bind(renewal.job_id.0)
        .bind(renewal.lease_id.0)
        .bind(renewal.extend_by.num_milliseconds())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| OrchestratorError::Store(format!("renew failed: {e}")))?;

        expires_at.ok_or(OrchestratorError::LeaseLost(renewal.job_id))
    }

    async fn release_claim(
        &self,
        job_id: JobId,
        lease_id: LeaseId,
        delay: Duration,
    ) -> Result<()> {
        let released = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET status = COALESCE(claimed_from, 'PENDING'),
                attempts = GREATEST(attempts - 1, 0),
                available_at = NOW() + ($3::bigint) * INTERVAL '1 millisecond',
                lease_id = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL,
                claimed_from = NULL,
                updated_at = NOW()
            WHERE id = $1 AND lease_id = $2 AND status = 'RUNNING'
            "#,
        )
        .bind(job_id.0)
        .bind(lease_id.0)
        .bind(millis(delay))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if released == 0 {
            return Err(OrchestratorError::LeaseLost(job_id));
        }
        Ok(())
    }

    async fn complete(&self, completion: JobCompletion) -> Result<ScanJob> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            OrchestratorError::Store(format!("begin complete tx failed: {e}"))
        })?;
        let mut job = Self::load_job_for_update(&mut tx, completion.job_id).await?;

        let holds_lease = job.status == JobStatus::Running
            && job.lease_id == Some(completion.lease_id);
        if !holds_lease {
            let target = completion.transition.status;
            if target.is_terminal() && job.status == target {
                debug!(job = %job.id, status = %target, "completion already applied");
                return Ok(job);
            }
            return Err(OrchestratorError::LeaseLost(completion.job_id));
        }

        apply_completion(&mut job, &completion, Utc::now());
        sqlx::query(
            r#"
            UPDATE scan_jobs
            SET status = $2,
                retry_count = $3,
                last_error = $4,
                error_history = $5,
                component_key = $6,
                assigned_instance = $7,
                available_at = $8,
                lease_id = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL,
                claimed_from = NULL,
                last_finished_at = $9,
                updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(job.id.0)
        .bind(job.status.as_str())
        .bind(to_i32(job.retry_count))
        .bind(&job.last_error)
        .bind(Json(&job.error_history))
        .bind(&job.component_key)
        .bind(&job.assigned_instance)
        .bind(job.available_at)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| OrchestratorError::Store(format!("complete update failed: {e}")))?;

        if job.status == JobStatus::Success {
            sqlx::query(
                r#"
                UPDATE failed_commits
                SET status = 'resolved', resolved_at = NOW(), updated_at = NOW()
                WHERE job_id = $1 AND status = 'pending'
                "#,
            )
            .bind(job.id.0)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await.map_err(|e| {
            OrchestratorError::Store(format!("complete tx commit failed: {e}"))
        })?;
        Ok(job)
    }

    async fn reclaim_expired_leases(&self) -> Result<u64> {
        let reclaimed = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET status = COALESCE(claimed_from, 'PENDING'),
                last_error = 'lease expired (owner '
                    || COALESCE(lease_owner, 'unknown') || ')',
                available_at = NOW(),
                lease_id = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL,
                claimed_from = NULL,
                updated_at = NOW()
            WHERE status = 'RUNNING'
              AND lease_expires_at IS NOT NULL
              AND lease_expires_at <= NOW()
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            OrchestratorError::Store(format!("lease expiry scan failed: {e}"))
        })?
        .rows_affected();

        if reclaimed > 0 {
            warn!(reclaimed, "returned jobs with expired leases to the queue");
        }
        Ok(reclaimed)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<ScanJob>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM scan_jobs WHERE id = $1"
        ))
        .bind(job_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ScanJob::try_from).transpose()
    }

    async fn list_jobs(
        &self,
        filter: JobFilter,
        page: PageRequest,
        sort: JobSort,
    ) -> Result<Page<ScanJob>> {
        let mut count = QueryBuilder::new("SELECT COUNT(*) FROM scan_jobs");
        push_job_filter(&mut count, &filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb = QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM scan_jobs"));
        push_job_filter(&mut qb, &filter);
        qb.push(format!(
            " ORDER BY {} {}, id {}",
            sort.field.column(),
            sort.direction.sql(),
            sort.direction.sql()
        ));
        qb.push(" LIMIT ")
            .push_bind(i64::from(page.page_size))
            .push(" OFFSET ")
            .push_bind(i64::try_from(page.offset()).unwrap_or(i64::MAX));

        let rows: Vec<JobRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        let items = rows
            .into_iter()
            .map(ScanJob::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page {
            items,
            total: u64::try_from(total).unwrap_or(0),
            page: page.page,
            page_size: page.page_size,
        })
    }

    async fn status_counts(
        &self,
        project_id: Option<ProjectId>,
    ) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*)
            FROM scan_jobs
            WHERE ($1::uuid IS NULL OR project_id = $1)
            GROUP BY status
            "#,
        )
        .bind(project_id.map(|p| p.0))
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            counts.add(status.parse()?, u64::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }

    async fn retry_job(
        &self,
        job_id: JobId,
        config_override: Option<ConfigOverride>,
        reset_retries: bool,
    ) -> Result<ScanJob> {
        let project: Option<Uuid> =
            sqlx::query_scalar("SELECT project_id FROM scan_jobs WHERE id = $1")
                .bind(job_id.0)
                .fetch_optional(&self.pool)
                .await?;
        let project = ProjectId(project.ok_or_else(|| {
            OrchestratorError::NotFound(format!("job {job_id}"))
        })?);

        let mut tx = self.pool.begin().await.map_err(|e| {
            OrchestratorError::Store(format!("begin retry tx failed: {e}"))
        })?;
        Self::lock_project(&mut tx, project).await?;

        let row: JobRow = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM scan_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(job_id.0)
        .fetch_one(&mut *tx)
        .await?;
        let job: ScanJob = row.try_into()?;
        check_retryable(&job)?;
        if Self::active_job(&mut tx, project, &job.commit_sha, Some(job_id))
            .await?
            .is_some()
        {
            return Err(OrchestratorError::Conflict(format!(
                "commit {} already has another active job",
                job.commit_sha
            )));
        }

        let (content, source) = split_override(&config_override);
        let row: JobRow = sqlx::query_as(&format!(
            r#"
            UPDATE scan_jobs
            SET status = 'PENDING',
                last_error = NULL,
                available_at = NOW(),
                retry_count = CASE WHEN $2 THEN 0 ELSE retry_count END,
                config_override = COALESCE($3, config_override),
                config_source = CASE WHEN $3 IS NULL THEN config_source ELSE $4 END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.0)
        .bind(reset_retries)
        .bind(content)
        .bind(source)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await.map_err(|e| {
            OrchestratorError::Store(format!("retry tx commit failed: {e}"))
        })?;
        row.try_into()
    }
}

#[async_trait]
impl ResultLedger for PostgresStore {
    async fn record_result(&self, result: ScanResult) -> Result<RecordOutcome> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO scan_results (
                job_id, project_id, commit_sha, component_key, instance,
                attempt, measures, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(result.job_id.0)
        .bind(result.project_id.0)
        .bind(&result.commit_sha)
        .bind(&result.component_key)
        .bind(&result.instance)
        .bind(to_i32(result.attempt))
        .bind(Json(&result.measures))
        .bind(result.created_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(RecordOutcome::Inserted);
        }
        if let Some(existing) = self.get_result(result.job_id).await?
            && existing.measures != result.measures
        {
            warn!(
                job = %result.job_id,
                "ignoring differing metrics for an already recorded result"
            );
        }
        Ok(RecordOutcome::AlreadyRecorded)
    }

    async fn get_result(&self, job_id: JobId) -> Result<Option<ScanResult>> {
        let row: Option<ResultRow> = sqlx::query_as(
            r#"
            SELECT job_id, project_id, commit_sha, component_key, instance,
                   attempt, measures, created_at
            FROM scan_results
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ScanResult::from))
    }

    async fn list_results(
        &self,
        project_id: ProjectId,
        after: Option<JobId>,
        limit: usize,
    ) -> Result<Vec<ScanResult>> {
        let rows: Vec<ResultRow> = sqlx::query_as(
            r#"
            SELECT job_id, project_id, commit_sha, component_key, instance,
                   attempt, measures, created_at
            FROM scan_results
            WHERE project_id = $1
              AND ($2::uuid IS NULL OR job_id > $2)
            ORDER BY job_id
            LIMIT $3
            "#,
        )
        .bind(project_id.0)
        .bind(after.map(|id| id.0))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ScanResult::from).collect())
    }
}

#[async_trait]
impl FailureLedger for PostgresStore {
    async fn record_failure(
        &self,
        job: &ScanJob,
        reason: &FailureReason,
    ) -> Result<FailedScanRecord> {
        let record = FailedScanRecord::from_job(job, reason);
        let (content, source) = split_override(&record.config_override);
        let row: FailureRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO failed_commits (
                id, job_id, project_id, commit_sha, project_key, repository_url,
                reason, classification, retry_count, max_retries, attempts,
                history, status, config_override, config_source,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                    'pending', $13, $14, $15, $15)
            ON CONFLICT (job_id) DO UPDATE
            SET reason = EXCLUDED.reason,
                classification = EXCLUDED.classification,
                retry_count = EXCLUDED.retry_count,
                max_retries = EXCLUDED.max_retries,
                attempts = EXCLUDED.attempts,
                history = EXCLUDED.history,
                status = 'pending',
                resolved_at = NULL,
                config_override = COALESCE(
                    EXCLUDED.config_override, failed_commits.config_override),
                config_source = CASE
                    WHEN EXCLUDED.config_override IS NULL
                        THEN failed_commits.config_source
                    ELSE EXCLUDED.config_source
                END,
                updated_at = EXCLUDED.updated_at
            RETURNING {FAILURE_COLUMNS}
            "#
        ))
        .bind(record.id.0)
        .bind(record.job_id.0)
        .bind(record.project_id.0)
        .bind(&record.commit_sha)
        .bind(&record.project_key)
        .bind(&record.repository_url)
        .bind(&record.reason)
        .bind(&record.classification)
        .bind(to_i32(record.retry_count))
        .bind(to_i32(record.max_retries))
        .bind(to_i32(record.attempts))
        .bind(Json(&record.history))
        .bind(content)
        .bind(source)
        .bind(record.created_at)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get_failure(
        &self,
        id: FailedRecordId,
    ) -> Result<Option<FailedScanRecord>> {
        let row: Option<FailureRow> = sqlx::query_as(&format!(
            "SELECT {FAILURE_COLUMNS} FROM failed_commits WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(FailedScanRecord::try_from).transpose()
    }

    async fn list_failures(
        &self,
        filter: FailureFilter,
        page: PageRequest,
        sort: FailureSort,
    ) -> Result<Page<FailedScanRecord>> {
        let mut count = QueryBuilder::new("SELECT COUNT(*) FROM failed_commits");
        push_failure_filter(&mut count, &filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb = QueryBuilder::new(format!(
            "SELECT {FAILURE_COLUMNS} FROM failed_commits"
        ));
        push_failure_filter(&mut qb, &filter);
        let dir = sort.direction.sql();
        qb.push(format!(" ORDER BY {} {dir}", sort.field.column()));
        if sort.field.column() != "created_at" {
            qb.push(format!(", created_at {dir}"));
        }
        qb.push(format!(", id {dir}"));
        qb.push(" LIMIT ")
            .push_bind(i64::from(page.page_size))
            .push(" OFFSET ")
            .push_bind(i64::try_from(page.offset()).unwrap_or(i64::MAX));

        let rows: Vec<FailureRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        let items = rows
            .into_iter()
            .map(FailedScanRecord::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page {
            items,
            total: u64::try_from(total).unwrap_or(0),
            page: page.page,
            page_size: page.page_size,
        })
    }

    async fn apply_override(
        &self,
        id: FailedRecordId,
        config_override: ConfigOverride,
    ) -> Result<FailedScanRecord> {
        let row: Option<FailureRow> = sqlx::query_as(&format!(
            r#"
            UPDATE failed_commits
            SET config_override = $2, config_source = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING {FAILURE_COLUMNS}
            "#
        ))
        .bind(id.0)
        .bind(&config_override.content)
        .bind(&config_override.source)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => match self.get_failure(id).await? {
                Some(_) => Err(OrchestratorError::Conflict(format!(
                    "failed record {id} is already resolved"
                ))),
                None => Err(OrchestratorError::NotFound(format!(
                    "failed record {id}"
                ))),
            },
        }
    }

    async fn requeue(
        &self,
        id: FailedRecordId,
        config_override: Option<ConfigOverride>,
    ) -> Result<(FailedScanRecord, ScanJob)> {
        let project: Option<Uuid> = sqlx::query_scalar(
            "SELECT project_id FROM failed_commits WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        let project = ProjectId(project.ok_or_else(|| {
            OrchestratorError::NotFound(format!("failed record {id}"))
        })?);

        let mut tx = self.pool.begin().await.map_err(|e| {
            OrchestratorError::Store(format!("begin requeue tx failed: {e}"))
        })?;
        Self::lock_project(&mut tx, project).await?;

        let row: Option<FailureRow> = sqlx::query_as(&format!(
            "SELECT {FAILURE_COLUMNS} FROM failed_commits WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let record: FailedScanRecord = row
            .ok_or_else(|| OrchestratorError::NotFound(format!("failed record {id}")))?
            .try_into()?;
        if record.status == FailureStatus::Resolved {
            return Err(OrchestratorError::Conflict(format!(
                "failed record {id} is already resolved"
            )));
        }

        let active =
            Self::active_job(&mut tx, record.project_id, &record.commit_sha, None)
                .await?;
        if active.is_some() {
            return Err(OrchestratorError::Conflict(format!(
                "commit {} already has an active job",
                record.commit_sha
            )));
        }

        let job = record.requeue_job(config_override);
        Self::insert_job(&mut tx, &job).await?;

        let (content, source) = split_override(&job.config_override);
        let row: FailureRow = sqlx::query_as(&format!(
            r#"
            UPDATE failed_commits
            SET status = 'resolved',
                resolved_at = NOW(),
                updated_at = NOW(),
                requeued_job_id = $2,
                config_override = $3,
                config_source = $4
            WHERE id = $1
            RETURNING {FAILURE_COLUMNS}
            "#
        ))
        .bind(id.0)
        .bind(job.id.0)
        .bind(content)
        .bind(source)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await.map_err(|e| {
            OrchestratorError::Store(format!("requeue tx commit failed: {e}"))
        })?;
        info!(record = %id, job = %job.id, "requeued failed commit");
        Ok((row.try_into()?, job))
    }
}
