use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::job::{JobId, JobStatus, ScanJob};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(pub Uuid);

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lease metadata returned when a worker claims a job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClaimedJob {
    pub lease_id: LeaseId,
    pub job: ScanJob,
    pub lease_owner: String,
    pub expires_at: DateTime<Utc>,
}

impl ClaimedJob {
    pub fn job_id(&self) -> JobId {
        self.job.id
    }
}

/// Request object to claim work from the store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClaimRequest {
    /// Statuses the caller is willing to run.
    pub statuses: Vec<JobStatus>,
    pub limit: usize,
    pub worker_id: String,
    pub lease_ttl: chrono::Duration,
}

impl ClaimRequest {
    pub fn eligible(
        worker_id: impl Into<String>,
        limit: usize,
        lease_ttl: chrono::Duration,
    ) -> Self {
        Self {
            statuses: JobStatus::ELIGIBLE.to_vec(),
            limit: limit.max(1),
            worker_id: worker_id.into(),
            lease_ttl,
        }
    }
}

/// Payload provided when renewing a lease.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaseRenewal {
    pub job_id: JobId,
    pub lease_id: LeaseId,
    pub extend_by: chrono::Duration,
}
