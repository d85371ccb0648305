use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use commitscan_core::{
    AnalysisInstance, CommitSpec, DispatchStatus, FailureClass, FailureStatus,
    InMemoryStore, InstancePool, JobDispatcher, JobStatus, OperatorService,
    OrchestratorConfig, OrchestratorError, ProjectId, ScanDispatcher,
    ScanExecutor, ScanJob, ScanMetrics, ScanOutcome, ScanRuntime, ScanStore,
    lease::{ClaimRequest, ClaimedJob},
    ledger::{FailureFilter, RecordOutcome, ResultLedger, ScanResult},
    registry::InstanceCredential,
    store::JobStore,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
enum Behaviour {
    Transient(FailureClass),
    Permanent,
    Succeed,
    SlowSucceed(Duration),
}

#[derive(Debug)]
struct ScriptedExecutor {
    behaviour: Behaviour,
    calls: AtomicUsize,
}

impl ScriptedExecutor {
    fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn metrics_for(job: &ScanJob) -> ScanMetrics {
    let mut measures = BTreeMap::new();
    measures.insert("ncloc".to_string(), "42".to_string());
    ScanMetrics {
        component_key: job.component_key(),
        measures,
    }
}

#[async_trait]
impl ScanExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        job: &ScanJob,
        _instance: &AnalysisInstance,
    ) -> ScanOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behaviour {
            Behaviour::Transient(class) => {
                ScanOutcome::transient(class, "scanner crashed")
            }
            Behaviour::Permanent => ScanOutcome::permanent(
                FailureClass::AnalysisRejected,
                "Validation of project failed",
            ),
            Behaviour::Succeed => ScanOutcome::Success(metrics_for(job)),
            Behaviour::SlowSucceed(delay) => {
                tokio::time::sleep(delay).await;
                ScanOutcome::Success(metrics_for(job))
            }
        }
    }
}

fn pool() -> InstancePool {
    InstancePool::new(vec![AnalysisInstance {
        id: "sq-1".into(),
        base_url: "http://sonar.local:9000".parse().unwrap(),
        credential: InstanceCredential::new("squ_test"),
        capacity: 2,
    }])
}

fn config(max_retries: u32) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.retry.default_max_retries = max_retries;
    config.retry.backoff_base_ms = 0;
    config.workers.idle_poll_ms = 20;
    config.workers.infra_backoff_base_ms = 10;
    config.workers.shutdown_grace_secs = 5;
    config.lease.housekeeper_interval_ms = 50;
    config
}

struct Harness {
    store: Arc<InMemoryStore>,
    pool: InstancePool,
    dispatcher: ScanDispatcher,
    service: OperatorService,
    project: ProjectId,
}

fn harness(executor: Arc<ScriptedExecutor>, config: OrchestratorConfig) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let shared: Arc<dyn ScanStore> = store.clone();
    let pool = pool();
    let dispatcher =
        ScanDispatcher::new(Arc::clone(&shared), pool.clone(), executor, config.clone());
    let service = OperatorService::new(shared, pool.clone(), config);
    Harness {
        store,
        pool,
        dispatcher,
        service,
        project: ProjectId(Uuid::now_v7()),
    }
}

fn commit(sha: &str) -> CommitSpec {
    CommitSpec {
        commit_sha: sha.into(),
        project_key: "acme_web".into(),
        repository_url: Some("https://git.example/acme/web.git".into()),
    }
}

async fn claim_one(store: &InMemoryStore, worker: &str) -> Option<ClaimedJob> {
    store
        .claim_next(ClaimRequest::eligible(
            worker,
            1,
            chrono::Duration::seconds(60),
        ))
        .await
        .unwrap()
        .into_iter()
        .next()
}

#[tokio::test]
async fn always_transient_fails_permanently_after_budget_plus_one_attempts() {
    let executor = ScriptedExecutor::new(Behaviour::Transient(FailureClass::ScannerError));
    let h = harness(Arc::clone(&executor), config(2));
    let summary = h
        .service
        .ingest_commits(h.project, vec![commit("abcdef1")])
        .await
        .unwrap();
    let job_id = summary.created[0];
    let shutdown = CancellationToken::new();

    let mut seen = Vec::new();
    while let Some(claimed) = claim_one(&h.store, "w1").await {
        let status = h.dispatcher.dispatch(&claimed, &shutdown).await;
        let job = h.store.get_job(job_id).await.unwrap().unwrap();
        assert!(job.retry_count <= job.max_retries);
        seen.push((status, job.status, job.retry_count));
    }

    assert_eq!(executor.calls(), 3);
    assert_eq!(seen.len(), 3);
    assert!(matches!(seen[0].0, DispatchStatus::Requeued { retry_count: 1, .. }));
    assert_eq!((seen[0].1, seen[0].2), (JobStatus::FailedTemp, 1));
    assert_eq!((seen[1].1, seen[1].2), (JobStatus::FailedTemp, 2));
    assert!(matches!(seen[2].0, DispatchStatus::Failed { .. }));
    assert_eq!((seen[2].1, seen[2].2), (JobStatus::FailedPermanent, 2));

    let job = h.service.get_job(job_id).await.unwrap();
    assert_eq!(job.attempts, 3);
    assert_eq!(job.error_history.len(), 3);
    assert!(job.last_error.is_some());

    let failures = h
        .service
        .list_failures(FailureFilter::default(), Default::default(), Default::default())
        .await
        .unwrap();
    assert_eq!(failures.total, 1);
    assert_eq!(failures.items[0].job_id, job_id);
    assert_eq!(failures.items[0].attempts, 3);
}

#[tokio::test]
async fn permanent_failure_stops_immediately() {
    let executor = ScriptedExecutor::new(Behaviour::Permanent);
    let h = harness(Arc::clone(&executor), config(3));
    let job_id = h
        .service
        .ingest_commits(h.project, vec![commit("abcdef2")])
        .await
        .unwrap()
        .created[0];

    let claimed = claim_one(&h.store, "w1").await.unwrap();
    let status = h.dispatcher.dispatch(&claimed, &CancellationToken::new()).await;

    assert!(matches!(status, DispatchStatus::Failed { .. }));
    let job = h.service.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::FailedPermanent);
    assert_eq!(job.retry_count, 0);
    assert!(claim_one(&h.store, "w2").await.is_none());
    assert_eq!(executor.calls(), 1);

    let failures = h
        .service
        .list_failures(FailureFilter::default(), Default::default(), Default::default())
        .await
        .unwrap();
    assert_eq!(failures.items[0].classification, "analysis_rejected");
    assert_eq!(failures.items[0].status, FailureStatus::Pending);
}

#[tokio::test]
async fn success_records_exactly_one_result() {
    let executor = ScriptedExecutor::new(Behaviour::Succeed);
    let h = harness(executor, config(3));
    let job_id = h
        .service
        .ingest_commits(h.project, vec![commit("abcdef3")])
        .await
        .unwrap()
        .created[0];

    let claimed = claim_one(&h.store, "w1").await.unwrap();
    let status = h.dispatcher.dispatch(&claimed, &CancellationToken::new()).await;
    assert_eq!(status, DispatchStatus::Succeeded);

    let job = h.service.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.component_key.as_deref(), Some("acme_web_abcdef3"));
    assert_eq!(job.assigned_instance.as_deref(), Some("sq-1"));

    let stored = h.store.get_result(job_id).await.unwrap().unwrap();
    let again = h
        .store
        .record_result(ScanResult {
            measures: BTreeMap::new(),
            ..stored.clone()
        })
        .await
        .unwrap();
    assert_eq!(again, RecordOutcome::AlreadyRecorded);

    let results = h.store.list_results(h.project, None, 100).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].measures.get("ncloc").map(String::as_str), Some("42"));
}

#[tokio::test]
async fn unavailable_instance_defers_without_spending_budget() {
    let executor = ScriptedExecutor::new(Behaviour::Succeed);
    let h = harness(Arc::clone(&executor), config(3));
    let job_id = h
        .service
        .ingest_commits(h.project, vec![commit("abcdef4")])
        .await
        .unwrap()
        .created[0];
    h.pool.mark_unhealthy("sq-1", Duration::from_secs(60));

    let claimed = claim_one(&h.store, "w1").await.unwrap();
    let status = h.dispatcher.dispatch(&claimed, &CancellationToken::new()).await;

    assert_eq!(status, DispatchStatus::Deferred);
    assert_eq!(executor.calls(), 0);
    let job = h.service.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.attempts, 0);
}

#[tokio::test]
async fn network_failure_cools_the_instance_down() {
    let executor = ScriptedExecutor::new(Behaviour::Transient(FailureClass::Network));
    let h = harness(executor, config(3));
    h.service
        .ingest_commits(h.project, vec![commit("abcdef5")])
        .await
        .unwrap();

    let claimed = claim_one(&h.store, "w1").await.unwrap();
    let status = h.dispatcher.dispatch(&claimed, &CancellationToken::new()).await;

    assert!(matches!(status, DispatchStatus::Requeued { .. }));
    let snapshot = h.pool.snapshot();
    assert!(!snapshot[0].healthy);
    assert_eq!(snapshot[0].in_flight, 0);
}

#[tokio::test]
async fn stale_claim_cannot_complete_after_reclaim() {
    let executor = ScriptedExecutor::new(Behaviour::Succeed);
    let h = harness(executor, config(3));
    let job_id = h
        .service
        .ingest_commits(h.project, vec![commit("abcdef6")])
        .await
        .unwrap()
        .created[0];

    let stale = h
        .store
        .claim_next(ClaimRequest::eligible(
            "crashed",
            1,
            chrono::Duration::milliseconds(30),
        ))
        .await
        .unwrap()
        .remove(0);
    tokio::time::sleep(Duration::from_millis(60)).await;

    let fresh = claim_one(&h.store, "w2").await.expect("expired lease is claimable");
    assert_eq!(fresh.job.id, job_id);
    assert_ne!(fresh.lease_id, stale.lease_id);

    let status = h.dispatcher.dispatch(&stale, &CancellationToken::new()).await;
    assert!(matches!(status, DispatchStatus::Abandoned { .. }));

    let job = h.service.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.lease_id, Some(fresh.lease_id));

    let status = h.dispatcher.dispatch(&fresh, &CancellationToken::new()).await;
    assert_eq!(status, DispatchStatus::Succeeded);
}

#[tokio::test]
async fn lost_lease_leaves_no_failure_record() {
    let executor = ScriptedExecutor::new(Behaviour::Permanent);
    let h = harness(Arc::clone(&executor), config(0));
    let job_id = h
        .service
        .ingest_commits(h.project, vec![commit("abcdef7")])
        .await
        .unwrap()
        .created[0];

    // The first owner still believes it holds a live lease while another
    // worker has taken the job over.
    let stale = claim_one(&h.store, "w1").await.unwrap();
    h.store
        .release_claim(job_id, stale.lease_id, Duration::ZERO)
        .await
        .unwrap();
    let owner = claim_one(&h.store, "w2").await.unwrap();

    let status = h.dispatcher.dispatch(&stale, &CancellationToken::new()).await;
    assert!(matches!(status, DispatchStatus::Abandoned { .. }));
    assert_eq!(executor.calls(), 1);

    let failures = h
        .service
        .list_failures(FailureFilter::default(), Default::default(), Default::default())
        .await
        .unwrap();
    assert_eq!(failures.total, 0);
    let job = h.service.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.lease_id, Some(owner.lease_id));

    let status = h.dispatcher.dispatch(&owner, &CancellationToken::new()).await;
    assert!(matches!(status, DispatchStatus::Failed { .. }));
    let failures = h
        .service
        .list_failures(FailureFilter::default(), Default::default(), Default::default())
        .await
        .unwrap();
    assert_eq!(failures.total, 1);
    assert_eq!(failures.items[0].job_id, job_id);
}

#[tokio::test]
async fn heartbeat_keeps_a_long_scan_owned() {
    let executor =
        ScriptedExecutor::new(Behaviour::SlowSucceed(Duration::from_millis(2_500)));
    let mut config = config(3);
    config.lease.lease_ttl_secs = 1;
    config.lease.renew_at_fraction = 0.5;
    config.lease.renew_min_margin_ms = 200;
    let h = harness(executor, config.clone());
    let job_id = h
        .service
        .ingest_commits(h.project, vec![commit("abcdef7")])
        .await
        .unwrap()
        .created[0];

    let claimed = h
        .store
        .claim_next(ClaimRequest::eligible("w1", 1, config.lease.lease_ttl()))
        .await
        .unwrap()
        .remove(0);

    let shutdown = CancellationToken::new();
    let (status, ()) = tokio::join!(h.dispatcher.dispatch(&claimed, &shutdown), async {
        tokio::time::sleep(Duration::from_millis(1_600)).await;
        assert_eq!(h.store.reclaim_expired_leases().await.unwrap(), 0);
        assert!(claim_one(&h.store, "w2").await.is_none());
    });

    assert_eq!(status, DispatchStatus::Succeeded);
    assert_eq!(
        h.service.get_job(job_id).await.unwrap().status,
        JobStatus::Success
    );
}

#[tokio::test]
async fn requeue_with_override_starts_a_fresh_job() {
    let executor = ScriptedExecutor::new(Behaviour::Permanent);
    let h = harness(executor, config(2));
    let original = h
        .service
        .ingest_commits(h.project, vec![commit("abcdef8")])
        .await
        .unwrap()
        .created[0];
    let claimed = claim_one(&h.store, "w1").await.unwrap();
    h.dispatcher.dispatch(&claimed, &CancellationToken::new()).await;

    let record = h
        .service
        .list_failures(FailureFilter::default(), Default::default(), Default::default())
        .await
        .unwrap()
        .items
        .remove(0);

    let (record, job) = h
        .service
        .requeue_failure(
            record.id,
            Some("sonar.exclusions=**/vendor/**".into()),
            None,
        )
        .await
        .unwrap();

    assert_ne!(job.id, original);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.max_retries, 2);
    let applied = job.config_override.as_ref().unwrap();
    assert_eq!(applied.content, "sonar.exclusions=**/vendor/**");
    assert_eq!(applied.source, "text");

    assert_eq!(record.status, FailureStatus::Resolved);
    assert_eq!(record.requeued_job_id, Some(job.id));

    let err = h.service.requeue_failure(record.id, None, None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Conflict(_)));
}

#[tokio::test]
async fn runtime_drains_the_queue_and_shuts_down() {
    let executor = ScriptedExecutor::new(Behaviour::Succeed);
    let mut config = config(3);
    config.workers.count = 3;
    config.workers.claim_batch = 2;

    let store = Arc::new(InMemoryStore::new());
    let shared: Arc<dyn ScanStore> = store.clone();
    let pool = pool();
    let runtime = ScanRuntime::new(
        config.clone(),
        Arc::clone(&shared),
        pool.clone(),
        executor.clone(),
    );
    let service = OperatorService::new(shared, pool, config);
    let project = ProjectId(Uuid::now_v7());
    let commits = (0..10).map(|i| commit(&format!("abcdef{i:02}"))).collect();
    service.ingest_commits(project, commits).await.unwrap();

    runtime.start().await.unwrap();
    assert!(runtime.start().await.is_err());

    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let stats = service.worker_stats().await.unwrap();
            if stats.jobs.success == 10 {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("queue drained");

    assert_eq!(drained.total_workers, 3);
    assert_eq!(drained.max_concurrency, 2);
    assert_eq!(drained.queued_scan_tasks, 0);

    runtime.shutdown().await.unwrap();
    assert!(runtime.is_shutting_down());
    assert_eq!(executor.calls(), 10);
    assert_eq!(store.list_results(project, None, 100).await.unwrap().len(), 10);
}
