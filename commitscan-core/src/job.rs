use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

use crate::{
    error::{OrchestratorError, Result},
    lease::LeaseId,
    outcome::FailureClass,
};

/// Unique identifier for scan jobs.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Project a batch of commits was ingested for.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub Uuid);

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a scan job.
///
/// `Pending` and `FailedTemp` are claimable, `Running` is owned by exactly one
/// lease holder, `Success` and `FailedPermanent` are terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    FailedTemp,
    FailedPermanent,
}

impl JobStatus {
    /// Statuses a worker may claim from.
    pub const ELIGIBLE: [JobStatus; 2] =
        [JobStatus::Pending, JobStatus::FailedTemp];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Success => "SUCCESS",
            JobStatus::FailedTemp => "FAILED_TEMP",
            JobStatus::FailedPermanent => "FAILED_PERMANENT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::FailedPermanent)
    }

    /// Jobs that still hold a place in the pipeline for their commit.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCESS" => Ok(JobStatus::Success),
            "FAILED_TEMP" => Ok(JobStatus::FailedTemp),
            "FAILED_PERMANENT" => Ok(JobStatus::FailedPermanent),
            other => Err(OrchestratorError::InvalidInput(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

/// Operator-supplied analysis properties applied to the next attempt.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConfigOverride {
    /// Raw `key=value` properties content.
    pub content: String,
    /// Where the content came from (`text`, `file:<name>`, ...).
    pub source: String,
}

impl ConfigOverride {
    pub const DEFAULT_SOURCE: &'static str = "text";

    pub fn new(content: impl Into<String>, source: Option<String>) -> Self {
        Self {
            content: content.into(),
            source: source
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| Self::DEFAULT_SOURCE.to_string()),
        }
    }
}

/// One failed attempt, kept on the job for the failure ledger.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AttemptError {
    pub attempt: u32,
    pub class: FailureClass,
    pub message: String,
    pub instance: Option<String>,
    pub at: DateTime<Utc>,
}

/// Durable record of one commit's scan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanJob {
    pub id: JobId,
    pub project_id: ProjectId,
    pub commit_sha: String,
    pub project_key: String,
    pub repository_url: Option<String>,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Number of times the job was claimed for execution.
    pub attempts: u32,
    pub last_error: Option<String>,
    #[serde(default)]
    pub error_history: Vec<AttemptError>,
    pub assigned_instance: Option<String>,
    pub component_key: Option<String>,
    pub config_override: Option<ConfigOverride>,
    pub lease_id: Option<LeaseId>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Status the job was claimed from while it is `Running`.
    pub claimed_from: Option<JobStatus>,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
}

impl ScanJob {
    /// Fresh `Pending` job for a commit.
    pub fn pending(
        project_id: ProjectId,
        commit: &CommitSpec,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            project_id,
            commit_sha: commit.commit_sha.trim().to_string(),
            project_key: commit.project_key.trim().to_string(),
            repository_url: commit.repository_url.clone(),
            status: JobStatus::Pending,
            retry_count: 0,
            max_retries,
            attempts: 0,
            last_error: None,
            error_history: Vec::new(),
            assigned_instance: None,
            component_key: None,
            config_override: None,
            lease_id: None,
            lease_owner: None,
            lease_expires_at: None,
            claimed_from: None,
            available_at: now,
            created_at: now,
            updated_at: now,
            last_started_at: None,
            last_finished_at: None,
        }
    }

    /// Identity of this commit's analysis on the instance side.
    pub fn component_key(&self) -> String {
        component_key(&self.project_key, &self.commit_sha)
    }

    pub fn lease_is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running
            && self.lease_expires_at.is_some_and(|expires| expires > now)
    }

    /// Clears lease bookkeeping after a terminal or requeue write.
    pub(crate) fn clear_lease(&mut self) {
        self.lease_id = None;
        self.lease_owner = None;
        self.lease_expires_at = None;
        self.claimed_from = None;
    }
}

pub fn component_key(project_key: &str, commit_sha: &str) -> String {
    format!("{project_key}_{commit_sha}")
}

/// One commit handed over by project ingestion.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CommitSpec {
    pub commit_sha: String,
    pub project_key: String,
    #[serde(default)]
    pub repository_url: Option<String>,
}

impl CommitSpec {
    pub fn validate(&self) -> Result<()> {
        let sha = self.commit_sha.trim();
        if !is_commit_sha(sha) {
            return Err(OrchestratorError::InvalidInput(format!(
                "'{sha}' is not a commit sha"
            )));
        }
        let key = self.project_key.trim();
        if !is_project_key(key) {
            return Err(OrchestratorError::InvalidInput(format!(
                "'{key}' is not a valid project key"
            )));
        }
        if let Some(url) = &self.repository_url
            && url.trim().is_empty()
        {
            return Err(OrchestratorError::InvalidInput(
                "repository_url must not be blank".into(),
            ));
        }
        Ok(())
    }
}

pub fn is_commit_sha(value: &str) -> bool {
    (7..=40).contains(&value.len())
        && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// Analysis project keys: 1..=400 chars of `[A-Za-z0-9_.:-]`, not all digits.
pub fn is_project_key(value: &str) -> bool {
    use once_cell::sync::Lazy;
    use regex::Regex;

    static KEY: Lazy<Option<Regex>> =
        Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.:\-]{1,400}$").ok());

    KEY.as_ref().is_some_and(|re| re.is_match(value))
        && !value.chars().all(|c| c.is_ascii_digit())
}

/// Result of a bulk ingest.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EnqueueSummary {
    pub created: Vec<JobId>,
    /// Commits skipped because an active job already covers them.
    pub merged: usize,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub project_id: Option<ProjectId>,
}

impl JobFilter {
    pub fn matches(&self, job: &ScanJob) -> bool {
        self.status.is_none_or(|status| job.status == status)
            && self.project_id.is_none_or(|project| job.project_id == project)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSortField {
    #[default]
    CreatedAt,
    UpdatedAt,
    Status,
    RetryCount,
    CommitSha,
}

impl JobSortField {
    pub fn column(&self) -> &'static str {
        match self {
            JobSortField::CreatedAt => "created_at",
            JobSortField::UpdatedAt => "updated_at",
            JobSortField::Status => "status",
            JobSortField::RetryCount => "retry_count",
            JobSortField::CommitSha => "commit_sha",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// 1-based page request.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub const MAX_PAGE_SIZE: u32 = 1_000;
    pub const DEFAULT_PAGE_SIZE: u32 = 20;

    pub fn new(page: Option<u32>, page_size: Option<u32>) -> Result<Self> {
        let page = page.unwrap_or(1);
        let page_size = page_size.unwrap_or(Self::DEFAULT_PAGE_SIZE);
        if page == 0 {
            return Err(OrchestratorError::InvalidInput(
                "page starts at 1".into(),
            ));
        }
        if page_size == 0 || page_size > Self::MAX_PAGE_SIZE {
            return Err(OrchestratorError::InvalidInput(format!(
                "page_size must be within 1..={}",
                Self::MAX_PAGE_SIZE
            )));
        }
        Ok(Self { page, page_size })
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.page_size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: Self::DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

/// Per-status job totals.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub running: u64,
    pub success: u64,
    pub failed_temp: u64,
    pub failed_permanent: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: JobStatus, n: u64) {
        match status {
            JobStatus::Pending => self.pending += n,
            JobStatus::Running => self.running += n,
            JobStatus::Success => self.success += n,
            JobStatus::FailedTemp => self.failed_temp += n,
            JobStatus::FailedPermanent => self.failed_permanent += n,
        }
    }

    pub fn queued(&self) -> u64 {
        self.pending + self.failed_temp
    }

    pub fn total(&self) -> u64 {
        self.pending
            + self.running
            + self.success
            + self.failed_temp
            + self.failed_permanent
    }
}

/// Operator reset of a single job.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RetryRequest {
    #[serde(default)]
    pub config_override: Option<String>,
    #[serde(default)]
    pub config_source: Option<String>,
    /// Restore the full retry budget instead of keeping the spent count.
    #[serde(default)]
    pub reset_retries: bool,
}
