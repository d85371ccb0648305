//! Operator-facing operations.
//!
//! Thin layer over the store that the HTTP handlers call: it turns "missing"
//! into `NotFound`, applies configured defaults and assembles the worker
//! statistics.

use std::{fmt, pin::Pin, sync::Arc};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    config::OrchestratorConfig,
    error::{OrchestratorError, Result},
    export,
    job::{
        CommitSpec, ConfigOverride, EnqueueSummary, JobFilter, JobId, Page,
        PageRequest, ProjectId, RetryRequest, ScanJob, StatusCounts,
    },
    ledger::{
        FailedRecordId, FailedScanRecord, FailureFilter, FailureSort,
        ScanResult,
    },
    registry::{InstancePool, InstanceSnapshot},
    store::{JobSort, ScanStore},
};

/// Rows fetched per export round trip.
const EXPORT_BATCH: usize = 500;

pub type CsvStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Snapshot served by the worker statistics endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerStatistics {
    pub total_workers: usize,
    /// Sum of enabled instance capacities.
    pub max_concurrency: usize,
    pub active_scan_tasks: u64,
    pub queued_scan_tasks: u64,
    pub jobs: StatusCounts,
    pub instances: Vec<InstanceSnapshot>,
}

/// Keyset page of a project's results, oldest job first.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResultPage {
    pub items: Vec<ScanResult>,
    /// Cursor for the following page, absent on the last one.
    pub next_after: Option<JobId>,
}

/// How far a project's ingested commits have got.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectProgress {
    pub project_id: ProjectId,
    pub total_jobs: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Pending, running or waiting out a backoff.
    pub remaining: u64,
    pub finished: bool,
    pub jobs: StatusCounts,
}

impl ProjectProgress {
    fn from_counts(project_id: ProjectId, jobs: StatusCounts) -> Self {
        let remaining = jobs.pending + jobs.running + jobs.failed_temp;
        let total_jobs = jobs.total();
        Self {
            project_id,
            total_jobs,
            succeeded: jobs.success,
            failed: jobs.failed_permanent,
            remaining,
            finished: total_jobs > 0 && remaining == 0,
            jobs,
        }
    }
}

#[derive(Clone)]
pub struct OperatorService {
    store: Arc<dyn ScanStore>,
    pool: InstancePool,
    config: Arc<OrchestratorConfig>,
}

impl fmt::Debug for OperatorService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorService")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl OperatorService {
    pub fn new(
        store: Arc<dyn ScanStore>,
        pool: InstancePool,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            pool,
            config: Arc::new(config),
        }
    }

    /// Create `Pending` jobs for a batch of commits. The whole batch is
    /// rejected when any entry is malformed.
    pub async fn ingest_commits(
        &self,
        project_id: ProjectId,
        commits: Vec<CommitSpec>,
    ) -> Result<EnqueueSummary> {
        let submitted = commits.len();
        let summary = self
            .store
            .enqueue_commits(
                project_id,
                commits,
                self.config.retry.default_max_retries,
            )
            .await?;
        info!(
            project = %project_id,
            submitted,
            created = summary.created.len(),
            merged = summary.merged,
            "ingested commits"
        );
        Ok(summary)
    }

    pub async fn list_jobs(
        &self,
        filter: JobFilter,
        page: PageRequest,
        sort: JobSort,
    ) -> Result<Page<ScanJob>> {
        self.store.list_jobs(filter, page, sort).await
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<ScanJob> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("job {job_id}")))
    }

    pub async fn retry_job(
        &self,
        job_id: JobId,
        request: RetryRequest,
    ) -> Result<ScanJob> {
        let config_override = request
            .config_override
            .map(|content| ConfigOverride::new(content, request.config_source));
        let job = self
            .store
            .retry_job(job_id, config_override, request.reset_retries)
            .await?;
        info!(job = %job_id, reset_retries = request.reset_retries, "job retried by operator");
        Ok(job)
    }

    pub async fn list_failures(
        &self,
        filter: FailureFilter,
        page: PageRequest,
        sort: FailureSort,
    ) -> Result<Page<FailedScanRecord>> {
        self.store.list_failures(filter, page, sort).await
    }

    pub async fn get_failure(&self, id: FailedRecordId) -> Result<FailedScanRecord> {
        self.store.get_failure(id).await?.ok_or_else(|| {
            OrchestratorError::NotFound(format!("failed record {id}"))
        })
    }

    pub async fn update_failure(
        &self,
        id: FailedRecordId,
        content: String,
        source: Option<String>,
    ) -> Result<FailedScanRecord> {
        if content.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "config_override must not be empty".into(),
            ));
        }
        self.store
            .apply_override(id, ConfigOverride::new(content, source))
            .await
    }

    pub async fn requeue_failure(
        &self,
        id: FailedRecordId,
        content: Option<String>,
        source: Option<String>,
    ) -> Result<(FailedScanRecord, ScanJob)> {
        let config_override =
            content.map(|content| ConfigOverride::new(content, source));
        let (record, job) = self.store.requeue(id, config_override).await?;
        info!(record = %id, job = %job.id, "failed commit requeued");
        Ok((record, job))
    }

    pub async fn list_results(
        &self,
        project_id: ProjectId,
        after: Option<JobId>,
        limit: Option<u32>,
    ) -> Result<ResultPage> {
        let limit = limit.unwrap_or(PageRequest::DEFAULT_PAGE_SIZE);
        if limit == 0 || limit > PageRequest::MAX_PAGE_SIZE {
            return Err(OrchestratorError::InvalidInput(format!(
                "limit must be within 1..={}",
                PageRequest::MAX_PAGE_SIZE
            )));
        }
        let limit = limit as usize;
        // One extra row tells whether another page exists.
        let mut items = self
            .store
            .list_results(project_id, after, limit + 1)
            .await?;
        let next_after = if items.len() > limit {
            items.truncate(limit);
            items.last().map(|result| result.job_id)
        } else {
            None
        };
        Ok(ResultPage { items, next_after })
    }

    pub async fn get_result(&self, job_id: JobId) -> Result<ScanResult> {
        self.store.get_result(job_id).await?.ok_or_else(|| {
            OrchestratorError::NotFound(format!("result of job {job_id}"))
        })
    }

    pub async fn project_progress(
        &self,
        project_id: ProjectId,
    ) -> Result<ProjectProgress> {
        let counts = self.store.status_counts(Some(project_id)).await?;
        Ok(ProjectProgress::from_counts(project_id, counts))
    }

    pub async fn worker_stats(&self) -> Result<WorkerStatistics> {
        let jobs = self.store.status_counts(None).await?;
        Ok(WorkerStatistics {
            total_workers: self.config.workers.count,
            max_concurrency: self.pool.max_concurrency(),
            active_scan_tasks: jobs.running,
            queued_scan_tasks: jobs.queued(),
            jobs,
            instances: self.pool.snapshot(),
        })
    }

    /// Stream every result of a project as CSV, header first.
    pub fn export_results_csv(&self, project_id: ProjectId) -> CsvStream {
        let store = Arc::clone(&self.store);
        let keys = self.config.measures.keys.clone();
        Box::pin(async_stream::try_stream! {
            yield export::header(&keys);
            let mut after = None;
            loop {
                let batch = store
                    .list_results(project_id, after, EXPORT_BATCH)
                    .await?;
                let Some(last) = batch.last() else { break };
                after = Some(last.job_id);
                let full = batch.len() == EXPORT_BATCH;
                let mut chunk = String::new();
                for result in &batch {
                    chunk.push_str(&export::row(result, &keys));
                }
                yield chunk;
                if !full {
                    break;
                }
            }
        })
    }
}
