//! Single-process store. Every operation runs inside one critical section,
//! which is what makes `claim_next` and `requeue` atomic here.

use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
    fmt,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{
    JobCompletion, JobSort, JobStore, apply_completion, check_retryable, shift,
};
use crate::{
    error::{OrchestratorError, Result},
    job::{
        CommitSpec, ConfigOverride, EnqueueSummary, JobFilter, JobId,
        JobSortField, JobStatus, Page, PageRequest, ProjectId, ScanJob,
        SortDirection, StatusCounts,
    },
    lease::{ClaimRequest, ClaimedJob, LeaseId, LeaseRenewal},
    ledger::{
        FailedRecordId, FailedScanRecord, FailureFilter, FailureLedger,
        FailureSort, FailureSortField, FailureStatus, RecordOutcome,
        ResultLedger, ScanResult,
    },
    outcome::FailureReason,
};

#[derive(Default)]
struct StoreState {
    jobs: HashMap<JobId, ScanJob>,
    results: HashMap<JobId, ScanResult>,
    failures: HashMap<FailedRecordId, FailedScanRecord>,
    failures_by_job: HashMap<JobId, FailedRecordId>,
}

impl StoreState {
    fn has_active_job(&self, project_id: ProjectId, commit_sha: &str) -> bool {
        self.jobs.values().any(|job| {
            job.project_id == project_id
                && job.commit_sha == commit_sha
                && job.status.is_active()
        })
    }

    fn has_other_active_job(
        &self,
        project_id: ProjectId,
        commit_sha: &str,
        except: JobId,
    ) -> bool {
        self.jobs.values().any(|job| {
            job.id != except
                && job.project_id == project_id
                && job.commit_sha == commit_sha
                && job.status.is_active()
        })
    }

    fn resolve_failures_for(&mut self, job_id: JobId, now: DateTime<Utc>) {
        if let Some(record_id) = self.failures_by_job.get(&job_id)
            && let Some(record) = self.failures.get_mut(record_id)
            && record.status == FailureStatus::Pending
        {
            record.status = FailureStatus::Resolved;
            record.resolved_at = Some(now);
            record.updated_at = now;
        }
    }
}

/// In-process implementation of every persistence trait.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryStore");
        match self.state.try_lock() {
            Some(state) => {
                debug
                    .field("jobs", &state.jobs.len())
                    .field("results", &state.results.len())
                    .field("failures", &state.failures.len());
            }
            None => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn paginate<T>(items: Vec<T>, page: PageRequest) -> Page<T> {
    let total = items.len() as u64;
    let items = items
        .into_iter()
        .skip(page.offset() as usize)
        .take(page.page_size as usize)
        .collect();
    Page {
        items,
        total,
        page: page.page,
        page_size: page.page_size,
    }
}

fn directed(ordering: Ordering, direction: SortDirection) -> Ordering {
    match direction {
        SortDirection::Asc => ordering,
        SortDirection::Desc => ordering.reverse(),
    }
}

fn compare_jobs(a: &ScanJob, b: &ScanJob, sort: JobSort) -> Ordering {
    let primary = match sort.field {
        JobSortField::CreatedAt => a.created_at.cmp(&b.created_at),
        JobSortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
        JobSortField::Status => a.status.as_str().cmp(b.status.as_str()),
        JobSortField::RetryCount => a.retry_count.cmp(&b.retry_count),
        JobSortField::CommitSha => a.commit_sha.cmp(&b.commit_sha),
    };
    directed(primary.then_with(|| a.id.cmp(&b.id)), sort.direction)
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn enqueue_commits(
        &self,
        project_id: ProjectId,
        commits: Vec<CommitSpec>,
        max_retries: u32,
    ) -> Result<EnqueueSummary> {
        for commit in &commits {
            commit.validate()?;
        }

        let mut state = self.state.lock();
        let mut summary = EnqueueSummary::default();
        let mut batch: HashSet<String> = HashSet::new();
        for commit in commits {
            let job = ScanJob::pending(project_id, &commit, max_retries);
            if !batch.insert(job.commit_sha.clone())
                || state.has_active_job(project_id, &job.commit_sha)
            {
                summary.merged += 1;
                continue;
            }
            summary.created.push(job.id);
            state.jobs.insert(job.id, job);
        }
        debug!(
            project = %project_id,
            created = summary.created.len(),
            merged = summary.merged,
            "enqueued commits"
        );
        Ok(summary)
    }

    async fn claim_next(&self, request: ClaimRequest) -> Result<Vec<ClaimedJob>> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let mut candidates: Vec<&ScanJob> = state
            .jobs
            .values()
            .filter(|job| {
                let ready = request.statuses.contains(&job.status)
                    && job.available_at <= now;
                let abandoned = job.status == JobStatus::Running
                    && job.lease_expires_at.is_some_and(|at| at <= now)
                    && job
                        .claimed_from
                        .is_some_and(|from| request.statuses.contains(&from));
                ready || abandoned
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.available_at
                .cmp(&b.available_at)
                .then(a.created_at.cmp(&b.created_at))
        });
        let picked: Vec<JobId> = candidates
            .into_iter()
            .take(request.limit)
            .map(|job| job.id)
            .collect();

        let expires_at = now + request.lease_ttl;
        let mut claimed = Vec::with_capacity(picked.len());
        for id in picked {
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            let lease_id = LeaseId::new();
            if job.status != JobStatus::Running {
                job.claimed_from = Some(job.status);
            }
            job.status = JobStatus::Running;
            job.lease_id = Some(lease_id);
            job.lease_owner = Some(request.worker_id.clone());
            job.lease_expires_at = Some(expires_at);
            job.attempts += 1;
            job.last_started_at = Some(now);
            job.updated_at = now;

            claimed.push(ClaimedJob {
                lease_id,
                job: job.clone(),
                lease_owner: request.worker_id.clone(),
                expires_at,
            });
        }
        Ok(claimed)
    }

    async fn renew_lease(&self, renewal: LeaseRenewal) -> Result<DateTime<Utc>> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(&renewal.job_id)
            .filter(|job| {
                job.lease_id == Some(renewal.lease_id) && job.lease_is_live(now)
            })
            .ok_or(OrchestratorError::LeaseLost(renewal.job_id))?;

        let expires_at = now + renewal.extend_by;
        job.lease_expires_at = Some(expires_at);
        job.updated_at = now;
        Ok(expires_at)
    }

    async fn release_claim(
        &self,
        job_id: JobId,
        lease_id: LeaseId,
        delay: Duration,
    ) -> Result<()> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(&job_id)
            .filter(|job| {
                job.status == JobStatus::Running
                    && job.lease_id == Some(lease_id)
            })
            .ok_or(OrchestratorError::LeaseLost(job_id))?;

        job.status = job.claimed_from.unwrap_or(JobStatus::Pending);
        job.attempts = job.attempts.saturating_sub(1);
        job.available_at = shift(now, delay);
        job.clear_lease();
        job.updated_at = now;
        Ok(())
    }

    async fn complete(&self, completion: JobCompletion) -> Result<ScanJob> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let job = state.jobs.get_mut(&completion.job_id).ok_or_else(|| {
            OrchestratorError::NotFound(format!("job {}", completion.job_id))
        })?;

        let holds_lease = job.status == JobStatus::Running
            && job.lease_id == Some(completion.lease_id);
        if !holds_lease {
            let target = completion.transition.status;
            if target.is_terminal() && job.status == target {
                debug!(job = %job.id, status = %target, "completion already applied");
                return Ok(job.clone());
            }
            return Err(OrchestratorError::LeaseLost(completion.job_id));
        }

        apply_completion(job, &completion, now);
        let updated = job.clone();
        if updated.status == JobStatus::Success {
            state.resolve_failures_for(updated.id, now);
        }
        Ok(updated)
    }

    async fn reclaim_expired_leases(&self) -> Result<u64> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let mut reclaimed = 0u64;
        for job in state.jobs.values_mut() {
            let expired = job.status == JobStatus::Running
                && job.lease_expires_at.is_some_and(|at| at <= now);
            if !expired {
                continue;
            }
            warn!(
                job = %job.id,
                owner = job.lease_owner.as_deref().unwrap_or("unknown"),
                "reclaiming job with expired lease"
            );
            job.last_error = Some(format!(
                "lease expired (owner {})",
                job.lease_owner.as_deref().unwrap_or("unknown")
            ));
            job.status = job.claimed_from.unwrap_or(JobStatus::Pending);
            job.available_at = now;
            job.clear_lease();
            job.updated_at = now;
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<ScanJob>> {
        Ok(self.state.lock().jobs.get(&job_id).cloned())
    }

    async fn list_jobs(
        &self,
        filter: JobFilter,
        page: PageRequest,
        sort: JobSort,
    ) -> Result<Page<ScanJob>> {
        let state = self.state.lock();
        let mut jobs: Vec<ScanJob> = state
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| compare_jobs(a, b, sort));
        Ok(paginate(jobs, page))
    }

    async fn status_counts(
        &self,
        project_id: Option<ProjectId>,
    ) -> Result<StatusCounts> {
        let state = self.state.lock();
        let mut counts = StatusCounts::default();
        for job in state.jobs.values() {
            if project_id.is_none_or(|project| job.project_id == project) {
                counts.add(job.status, 1);
            }
        }
        Ok(counts)
    }

    async fn retry_job(
        &self,
        job_id: JobId,
        config_override: Option<ConfigOverride>,
        reset_retries: bool,
    ) -> Result<ScanJob> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get(&job_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("job {job_id}")))?;
        check_retryable(job)?;
        if state.has_other_active_job(job.project_id, &job.commit_sha, job_id) {
            return Err(OrchestratorError::Conflict(format!(
                "commit {} already has another active job",
                job.commit_sha
            )));
        }

        let job = state.jobs.get_mut(&job_id).ok_or_else(|| {
            OrchestratorError::Internal(format!("job {job_id} vanished"))
        })?;
        job.status = JobStatus::Pending;
        job.last_error = None;
        job.available_at = now;
        if reset_retries {
            job.retry_count = 0;
        }
        if config_override.is_some() {
            job.config_override = config_override;
        }
        job.updated_at = now;
        Ok(job.clone())
    }
}

#[async_trait]
impl ResultLedger for InMemoryStore {
    async fn record_result(&self, result: ScanResult) -> Result<RecordOutcome> {
        let mut state = self.state.lock();
        if let Some(existing) = state.results.get(&result.job_id) {
            if existing.measures != result.measures {
                warn!(
                    job = %result.job_id,
                    "ignoring differing metrics for an already recorded result"
                );
            }
            return Ok(RecordOutcome::AlreadyRecorded);
        }
        state.results.insert(result.job_id, result);
        Ok(RecordOutcome::Inserted)
    }

    async fn get_result(&self, job_id: JobId) -> Result<Option<ScanResult>> {
        Ok(self.state.lock().results.get(&job_id).cloned())
    }

    async fn list_results(
        &self,
        project_id: ProjectId,
        after: Option<JobId>,
        limit: usize,
    ) -> Result<Vec<ScanResult>> {
        let state = self.state.lock();
        let mut results: Vec<ScanResult> = state
            .results
            .values()
            .filter(|r| r.project_id == project_id)
            .filter(|r| after.is_none_or(|after| r.job_id > after))
            .cloned()
            .collect();
        results.sort_by_key(|r| r.job_id);
        results.truncate(limit);
        Ok(results)
    }
}

#[async_trait]
impl FailureLedger for InMemoryStore {
    async fn record_failure(
        &self,
        job: &ScanJob,
        reason: &FailureReason,
    ) -> Result<FailedScanRecord> {
        let mut state = self.state.lock();
        let fresh = FailedScanRecord::from_job(job, reason);
        if let Some(id) = state.failures_by_job.get(&job.id).copied()
            && let Some(record) = state.failures.get_mut(&id)
        {
            record.refresh_from(fresh);
            return Ok(record.clone());
        }
        state.failures_by_job.insert(job.id, fresh.id);
        state.failures.insert(fresh.id, fresh.clone());
        Ok(fresh)
    }

    async fn get_failure(
        &self,
        id: FailedRecordId,
    ) -> Result<Option<FailedScanRecord>> {
        Ok(self.state.lock().failures.get(&id).cloned())
    }

    async fn list_failures(
        &self,
        filter: FailureFilter,
        page: PageRequest,
        sort: FailureSort,
    ) -> Result<Page<FailedScanRecord>> {
        let state = self.state.lock();
        let mut records: Vec<FailedScanRecord> = state
            .failures
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            let primary = match sort.field {
                FailureSortField::CreatedAt => a.created_at.cmp(&b.created_at),
                FailureSortField::Status => a
                    .status
                    .as_str()
                    .cmp(b.status.as_str())
                    .then(a.created_at.cmp(&b.created_at)),
            };
            directed(primary.then_with(|| a.id.0.cmp(&b.id.0)), sort.direction)
        });
        Ok(paginate(records, page))
    }

    async fn apply_override(
        &self,
        id: FailedRecordId,
        config_override: ConfigOverride,
    ) -> Result<FailedScanRecord> {
        let mut state = self.state.lock();
        let record = state.failures.get_mut(&id).ok_or_else(|| {
            OrchestratorError::NotFound(format!("failed record {id}"))
        })?;
        if record.status == FailureStatus::Resolved {
            return Err(OrchestratorError::Conflict(format!(
                "failed record {id} is already resolved"
            )));
        }
        record.config_override = Some(config_override);
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn requeue(
        &self,
        id: FailedRecordId,
        config_override: Option<ConfigOverride>,
    ) -> Result<(FailedScanRecord, ScanJob)> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let record = state.failures.get(&id).ok_or_else(|| {
            OrchestratorError::NotFound(format!("failed record {id}"))
        })?;
        if record.status == FailureStatus::Resolved {
            return Err(OrchestratorError::Conflict(format!(
                "failed record {id} is already resolved"
            )));
        }
        if state.has_active_job(record.project_id, &record.commit_sha) {
            return Err(OrchestratorError::Conflict(format!(
                "commit {} already has an active job",
                record.commit_sha
            )));
        }

        let job = record.requeue_job(config_override);
        state.jobs.insert(job.id, job.clone());

        let record = state.failures.get_mut(&id).ok_or_else(|| {
            OrchestratorError::Internal(format!("failed record {id} vanished"))
        })?;
        record.status = FailureStatus::Resolved;
        record.resolved_at = Some(now);
        record.updated_at = now;
        record.requeued_job_id = Some(job.id);
        record.config_override = job.config_override.clone();
        Ok((record.clone(), job))
    }
}
