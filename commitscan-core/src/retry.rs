//! Transition policy applied after every scan attempt.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;

use crate::{
    config::RetryConfig,
    job::{JobId, JobStatus, ScanJob},
    outcome::{FailureReason, ScanOutcome},
};

/// State the job moves to once an attempt has been classified.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transition {
    pub status: JobStatus,
    pub retry_count: u32,
    /// Delay before the job becomes claimable again. Only set for `FailedTemp`.
    pub requeue_after: Option<Duration>,
    pub error: Option<FailureReason>,
}

/// Retry controller: maps (job, outcome) to the next state and backoff.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn next_state(&self, job: &ScanJob, outcome: &ScanOutcome) -> Transition {
        match outcome {
            ScanOutcome::Success(_) => Transition {
                status: JobStatus::Success,
                retry_count: job.retry_count,
                requeue_after: None,
                error: None,
            },
            ScanOutcome::TransientFailure(reason)
                if job.retry_count < job.max_retries =>
            {
                let retry_count = job.retry_count + 1;
                Transition {
                    status: JobStatus::FailedTemp,
                    retry_count,
                    requeue_after: Some(self.backoff(job.id, retry_count)),
                    error: Some(reason.clone()),
                }
            }
            ScanOutcome::TransientFailure(reason)
            | ScanOutcome::PermanentFailure(reason) => Transition {
                status: JobStatus::FailedPermanent,
                retry_count: job.retry_count,
                requeue_after: None,
                error: Some(reason.clone()),
            },
        }
    }

    /// Delay before the `retry_count`-th retry of `job_id`.
    ///
    /// Doubles from `backoff_base_ms`, is capped at `backoff_max_ms`, and only
    /// ever adds jitter on top of the doubled anchor, so the sequence for one
    /// job never decreases.
    pub fn backoff(&self, job_id: JobId, retry_count: u32) -> Duration {
        let anchor = self.base_delay_ms(retry_count);
        Duration::from_millis(self.jittered_delay_for_anchor(
            anchor,
            job_id,
            retry_count,
        ))
    }

    fn base_delay_ms(&self, retry_count: u32) -> u64 {
        if retry_count == 0 {
            return 0;
        }

        let exp = retry_count.saturating_sub(1).min(62) as i32;
        let scaled = (self.config.backoff_base_ms as f64) * 2f64.powi(exp);
        let capped = scaled.min(self.config.backoff_max_ms as f64);
        capped.max(0.0) as u64
    }

    fn jittered_delay_for_anchor(
        &self,
        anchor_ms: u64,
        job_id: JobId,
        retry_count: u32,
    ) -> u64 {
        if anchor_ms == 0 {
            return 0;
        }

        let jitter_ratio =
            f64::from(self.config.jitter_ratio.clamp(0.0, 1.0));
        let jitter_span = (anchor_ms as f64) * jitter_ratio;
        let unit = deterministic_unit(job_id, retry_count);
        let jittered = (anchor_ms as f64 + jitter_span * unit)
            .min(self.config.backoff_max_ms as f64);
        jittered.round().max(anchor_ms as f64) as u64
    }
}

fn deterministic_unit(job_id: JobId, retry_count: u32) -> f64 {
    let mut hasher = DefaultHasher::default();
    job_id.hash(&mut hasher);
    retry_count.hash(&mut hasher);
    let bits = hasher.finish();
    (bits as f64) / (u64::MAX as f64)
}
