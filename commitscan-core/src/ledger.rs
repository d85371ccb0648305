//! Result and failure ledgers.
//!
//! Results are immutable, one per successful job. Failure records are one per
//! permanently failed job and are where operators attach a config override
//! and requeue the commit.

use std::{collections::BTreeMap, fmt, str::FromStr};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{OrchestratorError, Result},
    job::{
        AttemptError, ConfigOverride, JobId, Page, PageRequest, ProjectId,
        ScanJob, SortDirection,
    },
    outcome::{FailureReason, ScanMetrics},
};

/// Metrics snapshot of one successful scan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub job_id: JobId,
    pub project_id: ProjectId,
    pub commit_sha: String,
    pub component_key: String,
    pub instance: Option<String>,
    /// Attempt number that produced the metrics.
    pub attempt: u32,
    pub measures: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl ScanResult {
    pub fn from_attempt(
        job: &ScanJob,
        metrics: ScanMetrics,
        instance: Option<String>,
    ) -> Self {
        Self {
            job_id: job.id,
            project_id: job.project_id,
            commit_sha: job.commit_sha.clone(),
            component_key: metrics.component_key,
            instance,
            attempt: job.attempts,
            measures: metrics.measures,
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct FailedRecordId(pub Uuid);

impl FailedRecordId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for FailedRecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FailedRecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStatus {
    /// Waiting for an operator.
    Pending,
    Resolved,
}

impl FailureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStatus::Pending => "pending",
            FailureStatus::Resolved => "resolved",
        }
    }
}

impl FromStr for FailureStatus {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(FailureStatus::Pending),
            "resolved" => Ok(FailureStatus::Resolved),
            other => Err(OrchestratorError::InvalidInput(format!(
                "unknown failure status '{other}'"
            ))),
        }
    }
}

/// Snapshot of a job that reached `FailedPermanent`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailedScanRecord {
    pub id: FailedRecordId,
    pub job_id: JobId,
    pub project_id: ProjectId,
    pub commit_sha: String,
    pub project_key: String,
    pub repository_url: Option<String>,
    pub reason: String,
    pub classification: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub attempts: u32,
    pub history: Vec<AttemptError>,
    pub status: FailureStatus,
    pub config_override: Option<ConfigOverride>,
    /// Job created when the record was requeued.
    pub requeued_job_id: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl FailedScanRecord {
    pub fn from_job(job: &ScanJob, reason: &FailureReason) -> Self {
        let now = Utc::now();
        Self {
            id: FailedRecordId::new(),
            job_id: job.id,
            project_id: job.project_id,
            commit_sha: job.commit_sha.clone(),
            project_key: job.project_key.clone(),
            repository_url: job.repository_url.clone(),
            reason: reason.message.clone(),
            classification: reason.class.as_str().to_string(),
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            attempts: job.attempts,
            history: job.error_history.clone(),
            status: FailureStatus::Pending,
            config_override: job.config_override.clone(),
            requeued_job_id: None,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        }
    }

    /// Refresh the snapshot after the same job failed permanently again
    /// (operator retried it in place). Reopens a resolved record.
    pub(crate) fn refresh_from(&mut self, other: FailedScanRecord) {
        self.reason = other.reason;
        self.classification = other.classification;
        self.retry_count = other.retry_count;
        self.max_retries = other.max_retries;
        self.attempts = other.attempts;
        self.history = other.history;
        if other.config_override.is_some() {
            self.config_override = other.config_override;
        }
        self.status = FailureStatus::Pending;
        self.resolved_at = None;
        self.updated_at = other.updated_at;
    }

    /// Job that requeueing this record would create.
    pub(crate) fn requeue_job(
        &self,
        config_override: Option<ConfigOverride>,
    ) -> ScanJob {
        let commit = crate::job::CommitSpec {
            commit_sha: self.commit_sha.clone(),
            project_key: self.project_key.clone(),
            repository_url: self.repository_url.clone(),
        };
        let mut job =
            ScanJob::pending(self.project_id, &commit, self.max_retries);
        job.config_override =
            config_override.or_else(|| self.config_override.clone());
        job
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FailureFilter {
    pub status: Option<FailureStatus>,
    pub project_id: Option<ProjectId>,
}

impl FailureFilter {
    pub fn matches(&self, record: &FailedScanRecord) -> bool {
        self.status.is_none_or(|status| record.status == status)
            && self
                .project_id
                .is_none_or(|project| record.project_id == project)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSortField {
    #[default]
    CreatedAt,
    Status,
}

impl FailureSortField {
    pub fn column(&self) -> &'static str {
        match self {
            FailureSortField::CreatedAt => "created_at",
            FailureSortField::Status => "status",
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FailureSort {
    pub field: FailureSortField,
    pub direction: SortDirection,
}

/// Outcome of `record_result`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecordOutcome {
    Inserted,
    /// A result for the job already existed; nothing was written.
    AlreadyRecorded,
}

#[async_trait]
pub trait ResultLedger: Send + Sync {
    /// Idempotent by job id. The first write wins.
    async fn record_result(&self, result: ScanResult) -> Result<RecordOutcome>;

    async fn get_result(&self, job_id: JobId) -> Result<Option<ScanResult>>;

    /// Keyset page of a project's results ordered by job id.
    async fn list_results(
        &self,
        project_id: ProjectId,
        after: Option<JobId>,
        limit: usize,
    ) -> Result<Vec<ScanResult>>;
}

#[async_trait]
pub trait FailureLedger: Send + Sync {
    /// Create or refresh the failure record for `job`.
    async fn record_failure(
        &self,
        job: &ScanJob,
        reason: &FailureReason,
    ) -> Result<FailedScanRecord>;

    async fn get_failure(
        &self,
        id: FailedRecordId,
    ) -> Result<Option<FailedScanRecord>>;

    async fn list_failures(
        &self,
        filter: FailureFilter,
        page: PageRequest,
        sort: FailureSort,
    ) -> Result<Page<FailedScanRecord>>;

    /// Replace the override on a pending record.
    async fn apply_override(
        &self,
        id: FailedRecordId,
        config_override: ConfigOverride,
    ) -> Result<FailedScanRecord>;

    /// Atomically create a fresh `Pending` job for the record's commit and
    /// mark the record resolved.
    async fn requeue(
        &self,
        id: FailedRecordId,
        config_override: Option<ConfigOverride>,
    ) -> Result<(FailedScanRecord, ScanJob)>;
}
