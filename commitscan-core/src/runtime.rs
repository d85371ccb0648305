//! Worker pool supervision.
//!
//! `ScanRuntime` owns N claim-dispatch loops plus the lease housekeeper. The
//! store's atomic claim is the only coordination between loops, so several
//! processes can run a runtime against the same database.

use std::{fmt, sync::Arc, time::Duration};

use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::OrchestratorConfig,
    dispatcher::{JobDispatcher, ScanDispatcher, infra_backoff},
    error::{OrchestratorError, Result},
    executor::ScanExecutor,
    lease::{ClaimRequest, ClaimedJob, LeaseRenewal},
    registry::InstancePool,
    store::ScanStore,
};

pub struct ScanRuntime {
    config: OrchestratorConfig,
    store: Arc<dyn ScanStore>,
    pool: InstancePool,
    dispatcher: Arc<dyn JobDispatcher>,
    shutdown_token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for ScanRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handle_count = self
            .handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();
        f.debug_struct("ScanRuntime")
            .field("workers", &self.config.workers.count)
            .field("pool", &self.pool)
            .field("dispatcher", &self.dispatcher)
            .field("handle_count", &handle_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl ScanRuntime {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn ScanStore>,
        pool: InstancePool,
        executor: Arc<dyn ScanExecutor>,
    ) -> Self {
        let dispatcher = Arc::new(ScanDispatcher::new(
            Arc::clone(&store),
            pool.clone(),
            executor,
            config.clone(),
        ));
        Self::with_dispatcher(config, store, pool, dispatcher)
    }

    pub fn with_dispatcher(
        config: OrchestratorConfig,
        store: Arc<dyn ScanStore>,
        pool: InstancePool,
        dispatcher: Arc<dyn JobDispatcher>,
    ) -> Self {
        Self {
            config,
            store,
            pool,
            dispatcher,
            shutdown_token: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }


    /// Spawn the worker loops and the housekeeper.
    pub async fn start(&self) -> Result<()> {
        if self.shutdown_token.is_cancelled() {
            return Err(OrchestratorError::Conflict(
                "runtime has been shut down".into(),
            ));
        }
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return Err(OrchestratorError::Conflict(
                "runtime already started".into(),
            ));
        }

        let group = format!("scan-{}", std::process::id());
        for i in 0..self.config.workers.count {
            handles.push(self.spawn_worker(format!("{group}-w{i}")));
        }
        handles.push(self.spawn_housekeeper());

        info!(
            workers = self.config.workers.count,
            max_concurrency = self.pool.max_concurrency(),
            "scan runtime started"
        );
        Ok(())
    }

    fn spawn_worker(&self, worker_id: String) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let dispatcher = Arc::clone(&self.dispatcher);
        let shutdown = self.shutdown_token.clone();
        let workers = self.config.workers.clone();
        let lease_ttl = self.config.lease.lease_ttl();
        let infra_base = Duration::from_millis(workers.infra_backoff_base_ms);
        let infra_max = Duration::from_millis(workers.infra_backoff_max_ms);

        tokio::spawn(async move {
            let mut infra_failures = 0u32;
            loop {
                if shutdown.is_cancelled() {
                    info!(target: "scan::worker", worker = %worker_id, "worker shutting down");
                    break;
                }

                let request = ClaimRequest::eligible(
                    worker_id.clone(),
                    workers.claim_batch,
                    lease_ttl,
                );
                let claimed = match store.claim_next(request).await {
                    Ok(claimed) => {
                        infra_failures = 0;
                        claimed
                    }
                    Err(err) => {
                        infra_failures = infra_failures.saturating_add(1);
                        let delay =
                            infra_backoff(infra_base, infra_max, infra_failures);
                        error!(
                            target: "scan::worker",
                            worker = %worker_id,
                            error = %err,
                            retry_in_ms = delay.as_millis() as u64,
                            "claim failed"
                        );
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(delay) => continue,
                        }
                    }
                };

                if claimed.is_empty() {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(workers.idle_poll()) => continue,
                    }
                }

                trace!(
                    target: "scan::worker",
                    worker = %worker_id,
                    claimed = claimed.len(),
                    "claimed batch"
                );
                let mut batch = claimed.into_iter();
                let mut first = true;
                while let Some(mut job) = batch.next() {
                    if shutdown.is_cancelled() {
                        let remaining: Vec<ClaimedJob> =
                            std::iter::once(job).chain(batch.by_ref()).collect();
                        release_all(store.as_ref(), &remaining).await;
                        break;
                    }
                    // Later jobs of a batch waited behind earlier ones; make
                    // sure their lease survived before spending an attempt.
                    if !first {
                        match store
                            .renew_lease(LeaseRenewal {
                                job_id: job.job.id,
                                lease_id: job.lease_id,
                                extend_by: lease_ttl,
                            })
                            .await
                        {
                            Ok(expires_at) => job.expires_at = expires_at,
                            Err(err) => {
                                warn!(
                                    target: "scan::worker",
                                    worker = %worker_id,
                                    job = %job.job.id,
                                    error = %err,
                                    "skipping batched job whose lease could not be confirmed"
                                );
                                continue;
                            }
                        }
                    }
                    first = false;

                    let status = dispatcher.dispatch(&job, &shutdown).await;
                    debug!(
                        target: "scan::worker",
                        worker = %worker_id,
                        job = %job.job.id,
                        status = status.label(),
                        "dispatched"
                    );
                }
            }
        })
    }

    fn spawn_housekeeper(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let interval = self.config.lease.housekeeper_interval();
        let shutdown = self.shutdown_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!(target: "scan::housekeeper", "housekeeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match store.reclaim_expired_leases().await {
                            Ok(0) => {}
                            Ok(reclaimed) => {
                                info!(target: "scan::housekeeper", reclaimed, "reclaimed expired leases");
                            }
                            Err(err) => {
                                warn!(target: "scan::housekeeper", error = %err, "expired lease scan failed");
                            }
                        }
                    }
                }
            }
        })
    }

    /// Stop claiming, wait up to the configured grace period for in-flight
    /// scans, then abort whatever is left. Aborted jobs come back through
    /// lease expiry.
    pub async fn shutdown(&self) -> Result<()> {
        info!("initiating graceful shutdown of scan runtime");
        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };

        let deadline =
            tokio::time::Instant::now() + self.config.workers.shutdown_grace();
        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("worker task failed: {err:?}"),
                Err(_) => {
                    warn!("worker task did not finish within the grace period; aborting");
                    handle.abort();
                }
            }
        }

        info!("scan runtime shutdown complete");
        Ok(())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }
}

async fn release_all(store: &dyn ScanStore, claims: &[ClaimedJob]) {
    for claim in claims {
        if let Err(err) = store
            .release_claim(claim.job.id, claim.lease_id, Duration::ZERO)
            .await
        {
            warn!(
                target: "scan::worker",
                job = %claim.job.id,
                error = %err,
                "failed to release claim on shutdown"
            );
        }
    }
}
