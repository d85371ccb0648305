//! Job store contract and its backends.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::{OrchestratorError, Result},
    job::{
        AttemptError, CommitSpec, ConfigOverride, EnqueueSummary, JobFilter,
        JobId, JobSortField, JobStatus, Page, PageRequest, ProjectId, ScanJob,
        SortDirection, StatusCounts,
    },
    lease::{ClaimRequest, ClaimedJob, LeaseId, LeaseRenewal},
    ledger::{FailureLedger, ResultLedger},
    retry::Transition,
};

/// What a worker writes back once an attempt has been classified.
#[derive(Clone, Debug)]
pub struct JobCompletion {
    pub job_id: JobId,
    pub lease_id: LeaseId,
    pub transition: Transition,
    pub component_key: Option<String>,
    pub instance: Option<String>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JobSort {
    pub field: JobSortField,
    pub direction: SortDirection,
}

/// Durable record of every scan job. The only synchronisation point between
/// workers.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Bulk-create `Pending` jobs in one transaction. Commits already covered
    /// by an active job of the same project are merged.
    async fn enqueue_commits(
        &self,
        project_id: ProjectId,
        commits: Vec<CommitSpec>,
        max_retries: u32,
    ) -> Result<EnqueueSummary>;

    /// Atomically move up to `request.limit` eligible jobs to `Running` under
    /// fresh leases owned by `request.worker_id`.
    async fn claim_next(&self, request: ClaimRequest) -> Result<Vec<ClaimedJob>>;

    /// Extend a held lease. Returns the new expiry or `LeaseLost`.
    async fn renew_lease(&self, renewal: LeaseRenewal) -> Result<DateTime<Utc>>;

    /// Hand a claim back without consuming retry budget.
    async fn release_claim(
        &self,
        job_id: JobId,
        lease_id: LeaseId,
        delay: Duration,
    ) -> Result<()>;

    /// Conditional on the lease still being held. Repeating a completion whose
    /// terminal state is already stored returns the stored job. A `Success`
    /// completion also resolves pending failure records of the job.
    async fn complete(&self, completion: JobCompletion) -> Result<ScanJob>;

    /// Return jobs with expired leases to the status they were claimed from.
    async fn reclaim_expired_leases(&self) -> Result<u64>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<ScanJob>>;

    async fn list_jobs(
        &self,
        filter: JobFilter,
        page: PageRequest,
        sort: JobSort,
    ) -> Result<Page<ScanJob>>;

    async fn status_counts(
        &self,
        project_id: Option<ProjectId>,
    ) -> Result<StatusCounts>;

    /// Operator reset: back to `Pending`, error cleared, immediately eligible.
    /// Rejected while the job is `Running`, once it has succeeded, and when
    /// another active job already covers the same commit.
    async fn retry_job(
        &self,
        job_id: JobId,
        config_override: Option<ConfigOverride>,
        reset_retries: bool,
    ) -> Result<ScanJob>;
}

/// Everything a worker or the operator service needs from persistence.
pub trait ScanStore: JobStore + ResultLedger + FailureLedger {}

impl<T> ScanStore for T where T: JobStore + ResultLedger + FailureLedger {}

/// Apply a completion to an in-memory copy of the job.
///
/// Both backends build the stored row with it.
pub fn apply_completion(
    job: &mut ScanJob,
    completion: &JobCompletion,
    now: DateTime<Utc>,
) {
    let transition = &completion.transition;
    job.status = transition.status;
    job.retry_count = transition.retry_count;
    if transition.status == JobStatus::Success {
        job.last_error = None;
    }
    if let Some(error) = &transition.error {
        job.last_error = Some(error.to_string());
        job.error_history.push(AttemptError {
            attempt: job.attempts,
            class: error.class,
            message: error.message.clone(),
            instance: completion.instance.clone(),
            at: now,
        });
    }
    if let Some(key) = &completion.component_key {
        job.component_key = Some(key.clone());
    }
    if let Some(instance) = &completion.instance {
        job.assigned_instance = Some(instance.clone());
    }
    job.available_at =
        shift(now, transition.requeue_after.unwrap_or_default());
    job.clear_lease();
    job.last_finished_at = Some(now);
    job.updated_at = now;
}

/// Statuses an operator may not reset. Shared by both backends.
pub(crate) fn check_retryable(job: &ScanJob) -> Result<()> {
    match job.status {
        JobStatus::Running => Err(OrchestratorError::Conflict(format!(
            "job {} is running",
            job.id
        ))),
        JobStatus::Success => Err(OrchestratorError::Conflict(format!(
            "job {} already succeeded and its result is recorded",
            job.id
        ))),
        _ => Ok(()),
    }
}

/// `now + delay`, saturating instead of overflowing.
pub(crate) fn shift(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
