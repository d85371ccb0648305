//! Runs one claimed job from instance acquisition to the durable completion.

use std::{fmt, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::{LeaseConfig, OrchestratorConfig},
    error::{OrchestratorError, Result},
    executor::{ScanExecutor, execute_bounded},
    job::JobStatus,
    lease::{ClaimedJob, LeaseRenewal},
    ledger::ScanResult,
    outcome::ScanOutcome,
    retry::RetryPolicy,
    registry::InstancePool,
    store::{JobCompletion, ScanStore},
};

const RENEW_RETRY_FLOOR: Duration = Duration::from_millis(250);

/// What happened to a claimed job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DispatchStatus {
    Succeeded,
    /// Transient failure, back in the queue after backoff.
    Requeued { retry_count: u32, error: String },
    /// Terminal failure, recorded in the failure ledger.
    Failed { error: String },
    /// No instance was available; the claim went back without using a retry.
    Deferred,
    /// The lease was lost or the outcome could not be written; another
    /// worker picks the job up once the lease has expired.
    Abandoned { reason: String },
}

impl DispatchStatus {
    pub fn label(&self) -> &'static str {
        match self {
            DispatchStatus::Succeeded => "succeeded",
            DispatchStatus::Requeued { .. } => "requeued",
            DispatchStatus::Failed { .. } => "failed",
            DispatchStatus::Deferred => "deferred",
            DispatchStatus::Abandoned { .. } => "abandoned",
        }
    }
}

/// Contract exposed to worker loops for running claimed jobs.
#[async_trait]
pub trait JobDispatcher: Send + Sync + fmt::Debug {
    async fn dispatch(
        &self,
        claimed: &ClaimedJob,
        shutdown: &CancellationToken,
    ) -> DispatchStatus;
}

/// `base * 2^(attempt-1)`, capped at `max`.
pub(crate) fn infra_backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    base.saturating_mul(1u32 << exp).min(max)
}

pub struct ScanDispatcher {
    store: Arc<dyn ScanStore>,
    pool: InstancePool,
    executor: Arc<dyn ScanExecutor>,
    policy: RetryPolicy,
    config: OrchestratorConfig,
}

impl fmt::Debug for ScanDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanDispatcher")
            .field("pool", &self.pool)
            .field("executor", &self.executor)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ScanDispatcher {
    pub fn new(
        store: Arc<dyn ScanStore>,
        pool: InstancePool,
        executor: Arc<dyn ScanExecutor>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            pool,
            executor,
            policy: RetryPolicy::new(config.retry),
            config,
        }
    }

    /// Retry infrastructure failures of a store write with exponential
    /// backoff. Anything else is returned immediately.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let workers = &self.config.workers;
        let base = Duration::from_millis(workers.infra_backoff_base_ms);
        let max = Duration::from_millis(workers.infra_backoff_max_ms);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err)
                    if err.is_infrastructure()
                        && attempt < workers.write_attempts.max(1) =>
                {
                    let delay = infra_backoff(base, max, attempt);
                    warn!(
                        target: "scan::worker",
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "{what} failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn give_back(&self, claimed: &ClaimedJob, delay: Duration) {
        if let Err(err) = self
            .store
            .release_claim(claimed.job.id, claimed.lease_id, delay)
            .await
        {
            warn!(
                target: "scan::worker",
                job = %claimed.job.id,
                error = %err,
                "failed to release claim; lease expiry will return it"
            );
        }
    }

    /// Results are written before the job completes so a `Success` row always
    /// has its metrics. Failure records follow a successful completion, so a
    /// lost lease never leaves a record behind for a job another worker owns.
    async fn persist(
        &self,
        claimed: &ClaimedJob,
        outcome: ScanOutcome,
        instance_id: &str,
    ) -> Result<DispatchStatus> {
        let job = &claimed.job;
        let transition = self.policy.next_state(job, &outcome);
        let component_key = match &outcome {
            ScanOutcome::Success(metrics) => Some(metrics.component_key.clone()),
            _ => None,
        };
        let completion = JobCompletion {
            job_id: job.id,
            lease_id: claimed.lease_id,
            transition: transition.clone(),
            component_key,
            instance: Some(instance_id.to_string()),
        };

        if let ScanOutcome::Success(metrics) = &outcome {
            let result = ScanResult::from_attempt(
                job,
                metrics.clone(),
                Some(instance_id.to_string()),
            );
            self.with_retry("record result", || {
                self.store.record_result(result.clone())
            })
            .await?;
        }

        let stored = self
            .with_retry("complete job", || self.store.complete(completion.clone()))
            .await?;

        if stored.status == JobStatus::FailedPermanent
            && let Some(reason) = &transition.error
        {
            // The job is already terminal; a missing record only costs the
            // operator the requeue shortcut, `retry_job` still works.
            if let Err(err) = self
                .with_retry("record failure", || {
                    self.store.record_failure(&stored, reason)
                })
                .await
            {
                error!(
                    target: "scan::worker",
                    job = %stored.id,
                    error = %err,
                    "job failed permanently but its failure record was not written"
                );
            }
        }

        let error = || {
            transition
                .error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default()
        };
        Ok(match stored.status {
            JobStatus::Success => DispatchStatus::Succeeded,
            JobStatus::FailedTemp => DispatchStatus::Requeued {
                retry_count: stored.retry_count,
                error: error(),
            },
            JobStatus::FailedPermanent => DispatchStatus::Failed { error: error() },
            other => DispatchStatus::Abandoned {
                reason: format!("job stored as {other} after completion"),
            },
        })
    }
}

#[async_trait]
impl JobDispatcher for ScanDispatcher {
    async fn dispatch(
        &self,
        claimed: &ClaimedJob,
        shutdown: &CancellationToken,
    ) -> DispatchStatus {
        let job = &claimed.job;

        let acquired = tokio::select! {
            _ = shutdown.cancelled() => None,
            acquired = self.pool.acquire(self.config.pool.acquire_wait()) => Some(acquired),
        };
        let token = match acquired {
            None => {
                self.give_back(claimed, Duration::ZERO).await;
                return DispatchStatus::Deferred;
            }
            Some(Err(err)) => {
                debug!(
                    target: "scan::worker",
                    job = %job.id,
                    error = %err,
                    "no instance available, returning claim"
                );
                self.give_back(claimed, self.config.pool.unavailable_requeue())
                    .await;
                return DispatchStatus::Deferred;
            }
            Some(Ok(token)) => token,
        };
        let instance = Arc::clone(token.instance());

        let heartbeat = LeaseHeartbeat::start(
            Arc::clone(&self.store),
            claimed,
            self.config.lease,
        );

        let outcome = tokio::select! {
            outcome = execute_bounded(
                self.executor.as_ref(),
                job,
                &instance,
                self.config.scanner.attempt_timeout(),
            ) => Some(outcome),
            _ = heartbeat.lost() => None,
        };
        drop(token);

        let Some(outcome) = outcome else {
            heartbeat.stop().await;
            warn!(
                target: "scan::worker",
                job = %job.id,
                instance = %instance.id,
                "lease lost during scan, abandoning attempt"
            );
            return DispatchStatus::Abandoned {
                reason: "lease lost during scan".into(),
            };
        };

        if let Some(reason) = outcome.failure()
            && matches!(outcome, ScanOutcome::TransientFailure(_))
            && reason.class.implicates_instance()
        {
            self.pool
                .mark_unhealthy(&instance.id, self.config.pool.unhealthy_cooldown());
        }

        let status = self.persist(claimed, outcome, &instance.id).await;
        heartbeat.stop().await;

        match status {
            Ok(status) => {
                info!(
                    target: "scan::worker",
                    job = %job.id,
                    commit = %job.commit_sha,
                    instance = %instance.id,
                    status = status.label(),
                    "scan attempt finished"
                );
                status
            }
            Err(OrchestratorError::LeaseLost(_)) => {
                warn!(
                    target: "scan::worker",
                    job = %job.id,
                    "lease lost before completion; outcome discarded"
                );
                DispatchStatus::Abandoned {
                    reason: "lease lost before completion".into(),
                }
            }
            Err(err) => {
                error!(
                    target: "scan::worker",
                    job = %job.id,
                    error = %err,
                    "could not persist scan outcome"
                );
                DispatchStatus::Abandoned {
                    reason: err.to_string(),
                }
            }
        }
    }
}

/// Keeps a claim alive while the attempt runs.
struct LeaseHeartbeat {
    stop: CancellationToken,
    lost: CancellationToken,
    handle: JoinHandle<()>,
}

impl LeaseHeartbeat {
    fn start(
        store: Arc<dyn ScanStore>,
        claimed: &ClaimedJob,
        lease: LeaseConfig,
    ) -> Self {
        let stop = CancellationToken::new();
        let lost = CancellationToken::new();
        let job_id = claimed.job.id;
        let lease_id = claimed.lease_id;
        let mut expires_at = claimed.expires_at;
        let ttl = lease.lease_ttl();
        let margin = Duration::from_millis(lease.renew_min_margin_ms);
        let fraction = lease.renew_at_fraction.clamp(0.0, 1.0);

        let handle = tokio::spawn({
            let stop = stop.clone();
            let lost = lost.clone();
            async move {
                let mut last_failed = false;
                loop {
                    let now = Utc::now();
                    if expires_at <= now {
                        lost.cancel();
                        break;
                    }
                    let ttl_total =
                        ttl.to_std().unwrap_or(Duration::from_secs(30));
                    let target = ttl_total.mul_f32(1.0 - fraction);
                    let remaining = (expires_at - now).to_std().unwrap_or_default();
                    let mut sleep_for = if remaining > target {
                        remaining - target
                    } else if remaining > margin {
                        remaining - margin
                    } else {
                        Duration::ZERO
                    };
                    if last_failed {
                        sleep_for = sleep_for.max(RENEW_RETRY_FLOOR);
                    }

                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(sleep_for) => {}
                    }

                    match store
                        .renew_lease(LeaseRenewal {
                            job_id,
                            lease_id,
                            extend_by: ttl,
                        })
                        .await
                    {
                        Ok(updated) => {
                            trace!(target: "scan::lease", job = %job_id, expires_at = %updated, "lease renewed");
                            expires_at = updated;
                            last_failed = false;
                        }
                        Err(OrchestratorError::LeaseLost(_)) => {
                            lost.cancel();
                            break;
                        }
                        Err(err) => {
                            warn!(target: "scan::lease", job = %job_id, error = %err, "lease renew failed");
                            last_failed = true;
                        }
                    }
                }
            }
        });

        Self { stop, lost, handle }
    }

    fn lost(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.lost.cancelled()
    }

    async fn stop(self) {
        self.stop.cancel();
        if let Err(err) = self.handle.await {
            warn!(target: "scan::lease", error = %err, "lease heartbeat task failed");
        }
    }
}
