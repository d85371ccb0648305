use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use axum::http::StatusCode;
use axum_test::TestServer;
use commitscan_core::{
    AnalysisInstance, DispatchStatus, FailureClass, InMemoryStore, InstancePool,
    JobDispatcher, OrchestratorConfig, ScanDispatcher, ScanExecutor, ScanJob,
    ScanMetrics, ScanOutcome, ScanStore,
    lease::ClaimRequest,
    registry::InstanceCredential,
    store::JobStore,
};
use commitscan_server::{
    AppState, infra::config::Config, routes::create_app,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug)]
enum Scripted {
    Succeed,
    Reject,
}

#[async_trait]
impl ScanExecutor for Scripted {
    async fn execute(
        &self,
        job: &ScanJob,
        _instance: &AnalysisInstance,
    ) -> ScanOutcome {
        match self {
            Scripted::Succeed => {
                let mut measures = BTreeMap::new();
                measures.insert("ncloc".to_string(), "1,024".to_string());
                ScanOutcome::Success(ScanMetrics {
                    component_key: job.component_key(),
                    measures,
                })
            }
            Scripted::Reject => ScanOutcome::permanent(
                FailureClass::AnalysisRejected,
                "Validation of project failed",
            ),
        }
    }
}

struct TestApp {
    server: TestServer,
    store: Arc<InMemoryStore>,
    pool: InstancePool,
    config: OrchestratorConfig,
}

impl TestApp {
    fn new() -> Self {
        let mut config = OrchestratorConfig::default();
        config.workers.count = 3;
        config.retry.default_max_retries = 2;
        config.measures.keys = vec!["ncloc".into(), "coverage".into()];

        let pool = InstancePool::new(vec![AnalysisInstance {
            id: "sq-1".into(),
            base_url: "http://sonar.local:9000".parse().unwrap(),
            credential: InstanceCredential::new("squ_test"),
            capacity: 4,
        }]);
        let store = Arc::new(InMemoryStore::new());
        let shared: Arc<dyn ScanStore> = store.clone();
        let state = AppState::new(
            &Config::with_orchestrator(config.clone()),
            shared,
            pool.clone(),
        );
        let server = TestServer::new(create_app(state)).unwrap();
        Self {
            server,
            store,
            pool,
            config,
        }
    }

    /// Claim the next job and run it through the dispatcher.
    async fn run_next(&self, executor: Scripted) -> DispatchStatus {
        let shared: Arc<dyn ScanStore> = self.store.clone();
        let dispatcher = ScanDispatcher::new(
            shared,
            self.pool.clone(),
            Arc::new(executor),
            self.config.clone(),
        );
        let claimed = self
            .store
            .claim_next(ClaimRequest::eligible(
                "test-worker",
                1,
                chrono::Duration::seconds(60),
            ))
            .await
            .unwrap()
            .pop()
            .expect("a claimable job");
        dispatcher.dispatch(&claimed, &CancellationToken::new()).await
    }

    async fn ingest(&self, project: Uuid, shas: &[&str]) -> Value {
        let commits: Vec<Value> = shas
            .iter()
            .map(|sha| {
                json!({
                    "commit_sha": sha,
                    "project_key": "acme_web",
                    "repository_url": "https://git.example/acme/web.git"
                })
            })
            .collect();
        let response = self
            .server
            .post(&format!("/api/v1/projects/{project}/commits"))
            .json(&commits)
            .await;
        response.json()
    }
}

#[tokio::test]
async fn health_reports_store_status() {
    let app = TestApp::new();
    let response = app.server.get("/health").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["store"]["status"], "healthy");
}

#[tokio::test]
async fn ingest_creates_jobs_and_merges_duplicates() {
    let app = TestApp::new();
    let project = Uuid::now_v7();

    let response = app
        .server
        .post(&format!("/api/v1/projects/{project}/commits"))
        .json(&json!({
            "commits": [
                { "commit_sha": "abcdef1", "project_key": "acme_web" },
                { "commit_sha": "abcdef2", "project_key": "acme_web" }
            ]
        }))
        .await;
    response.assert_status(StatusCode::CREATED);
    let body: Value = response.json();
    assert_eq!(body["status"], "success");
    assert_eq!(body["data"]["created"].as_array().unwrap().len(), 2);

    let again = app.ingest(project, &["abcdef1"]).await;
    assert_eq!(again["data"]["created"].as_array().unwrap().len(), 0);
    assert_eq!(again["data"]["merged"], 1);

    let jobs: Value = app
        .server
        .get("/api/v1/scan-jobs")
        .add_query_param("project_id", project)
        .add_query_param("status", "PENDING")
        .await
        .json();
    assert_eq!(jobs["data"]["total"], 2);
    assert_eq!(jobs["data"]["items"][0]["status"], "PENDING");
    assert_eq!(jobs["data"]["items"][0]["max_retries"], 2);
}

#[tokio::test]
async fn malformed_batches_are_rejected_whole() {
    let app = TestApp::new();
    let project = Uuid::now_v7();
    let response = app
        .server
        .post(&format!("/api/v1/projects/{project}/commits"))
        .json(&json!([
            { "commit_sha": "abcdef1", "project_key": "acme_web" },
            { "commit_sha": "not-a-sha", "project_key": "acme_web" }
        ]))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["status"], "error");

    let jobs: Value = app.server.get("/api/v1/scan-jobs").await.json();
    assert_eq!(jobs["data"]["total"], 0);
}

#[tokio::test]
async fn list_paginates_and_sorts() {
    let app = TestApp::new();
    let project = Uuid::now_v7();
    app.ingest(project, &["aaaaaaa", "bbbbbbb", "ccccccc"]).await;

    let page: Value = app
        .server
        .get("/api/v1/scan-jobs")
        .add_query_param("sort_by", "commit_sha")
        .add_query_param("sort_dir", "asc")
        .add_query_param("page", 2)
        .add_query_param("page_size", 2)
        .await
        .json();
    assert_eq!(page["data"]["total"], 3);
    assert_eq!(page["data"]["page"], 2);
    let items = page["data"]["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["commit_sha"], "ccccccc");

    app.server
        .get("/api/v1/scan-jobs")
        .add_query_param("sort_by", "colour")
        .await
        .assert_status(StatusCode::BAD_REQUEST);
    app.server
        .get("/api/v1/scan-jobs")
        .add_query_param("page_size", 5000)
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let app = TestApp::new();
    let response = app
        .server
        .get(&format!("/api/v1/scan-jobs/{}", Uuid::now_v7()))
        .await;
    response.assert_status(StatusCode::NOT_FOUND);
    let body: Value = response.json();
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn running_jobs_cannot_be_retried() {
    let app = TestApp::new();
    let project = Uuid::now_v7();
    let created = app.ingest(project, &["abcdef1"]).await;
    let job_id = created["data"]["created"][0].as_str().unwrap().to_string();

    app.store
        .claim_next(ClaimRequest::eligible(
            "w1",
            1,
            chrono::Duration::seconds(60),
        ))
        .await
        .unwrap();

    app.server
        .post(&format!("/api/v1/scan-jobs/{job_id}/retry"))
        .await
        .assert_status(StatusCode::CONFLICT);
}

#[tokio::test]
async fn retry_resets_failed_job_with_override() {
    let app = TestApp::new();
    let project = Uuid::now_v7();
    let created = app.ingest(project, &["abcdef1"]).await;
    let job_id = created["data"]["created"][0].as_str().unwrap().to_string();
    assert!(matches!(
        app.run_next(Scripted::Reject).await,
        DispatchStatus::Failed { .. }
    ));

    let response = app
        .server
        .post(&format!("/api/v1/scan-jobs/{job_id}/retry"))
        .json(&json!({ "config_override": "sonar.exclusions=**/gen/**" }))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    let job = &body["data"];
    assert_eq!(job["status"], "PENDING");
    assert_eq!(job["last_error"], Value::Null);
    assert_eq!(job["config_override"]["source"], "text");
    assert_eq!(job["config_override"]["content"], "sonar.exclusions=**/gen/**");
}

#[tokio::test]
async fn failed_commit_can_be_edited_and_requeued_once() {
    let app = TestApp::new();
    let project = Uuid::now_v7();
    app.ingest(project, &["abcdef1"]).await;
    app.run_next(Scripted::Reject).await;

    let failures: Value = app
        .server
        .get("/api/v1/failed-commits")
        .add_query_param("status", "pending")
        .await
        .json();
    assert_eq!(failures["data"]["total"], 1);
    let record = &failures["data"]["items"][0];
    assert_eq!(record["classification"], "analysis_rejected");
    let record_id = record["id"].as_str().unwrap().to_string();

    app.server
        .put(&format!("/api/v1/failed-commits/{record_id}"))
        .json(&json!({ "config_override": "   " }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    let updated: Value = app
        .server
        .put(&format!("/api/v1/failed-commits/{record_id}"))
        .json(&json!({
            "config_override": "sonar.sources=src",
            "config_source": "file:override.properties"
        }))
        .await
        .json();
    assert_eq!(
        updated["data"]["config_override"]["source"],
        "file:override.properties"
    );

    let requeued = app
        .server
        .post(&format!("/api/v1/failed-commits/{record_id}/retry"))
        .await;
    requeued.assert_status_ok();
    let body: Value = requeued.json();
    assert_eq!(body["data"]["record"]["status"], "resolved");
    assert_eq!(body["data"]["job"]["status"], "PENDING");
    assert_eq!(body["data"]["job"]["retry_count"], 0);
    assert_eq!(
        body["data"]["job"]["config_override"]["content"],
        "sonar.sources=src"
    );

    app.server
        .post(&format!("/api/v1/failed-commits/{record_id}/retry"))
        .await
        .assert_status(StatusCode::CONFLICT);

    let record: Value = app
        .server
        .get(&format!("/api/v1/failed-commits/{record_id}"))
        .await
        .json();
    assert_eq!(
        record["data"]["requeued_job_id"],
        body["data"]["job"]["id"]
    );
}

#[tokio::test]
async fn worker_stats_reflect_queue_and_instances() {
    let app = TestApp::new();
    let project = Uuid::now_v7();
    app.ingest(project, &["abcdef1", "abcdef2", "abcdef3"]).await;
    app.store
        .claim_next(ClaimRequest::eligible(
            "w1",
            1,
            chrono::Duration::seconds(60),
        ))
        .await
        .unwrap();

    let stats: Value = app.server.get("/api/v1/scan-jobs/workers-stats").await.json();
    let data = &stats["data"];
    assert_eq!(data["total_workers"], 3);
    assert_eq!(data["max_concurrency"], 4);
    assert_eq!(data["active_scan_tasks"], 1);
    assert_eq!(data["queued_scan_tasks"], 2);
    assert_eq!(data["instances"][0]["id"], "sq-1");
}

#[tokio::test]
async fn export_streams_results_as_csv() {
    let app = TestApp::new();
    let project = Uuid::now_v7();
    app.ingest(project, &["abcdef1"]).await;
    assert!(matches!(
        app.run_next(Scripted::Succeed).await,
        DispatchStatus::Succeeded
    ));

    let response = app
        .server
        .get(&format!("/api/v1/projects/{project}/results/export"))
        .await;
    response.assert_status_ok();
    assert!(
        response
            .header("content-type")
            .to_str()
            .unwrap()
            .starts_with("text/csv")
    );
    let text = response.text();
    let mut lines = text.lines();
    assert_eq!(
        lines.next(),
        Some("job_id,commit_sha,component_key,instance,created_at,ncloc,coverage")
    );
    let row = lines.next().unwrap();
    assert!(row.contains(",abcdef1,acme_web_abcdef1,sq-1,"));
    assert!(row.ends_with(",\"1,024\","));
    assert_eq!(lines.next(), None);
}

#[tokio::test]
async fn project_progress_counts_terminal_jobs() {
    let app = TestApp::new();
    let project = Uuid::now_v7();
    app.ingest(project, &["abcdef1", "abcdef2"]).await;

    let progress: Value = app
        .server
        .get(&format!("/api/v1/projects/{project}/progress"))
        .await
        .json();
    assert_eq!(progress["data"]["total_jobs"], 2);
    assert_eq!(progress["data"]["remaining"], 2);
    assert_eq!(progress["data"]["finished"], false);

    app.run_next(Scripted::Succeed).await;
    app.run_next(Scripted::Reject).await;

    let progress: Value = app
        .server
        .get(&format!("/api/v1/projects/{project}/progress"))
        .await
        .json();
    let data = &progress["data"];
    assert_eq!(data["succeeded"], 1);
    assert_eq!(data["failed"], 1);
    assert_eq!(data["remaining"], 0);
    assert_eq!(data["finished"], true);
    assert_eq!(data["jobs"]["failed_permanent"], 1);

    let other: Value = app
        .server
        .get(&format!("/api/v1/projects/{}/progress", Uuid::now_v7()))
        .await
        .json();
    assert_eq!(other["data"]["total_jobs"], 0);
    assert_eq!(other["data"]["finished"], false);
}

#[tokio::test]
async fn results_are_listed_by_cursor_and_fetched_per_job() {
    let app = TestApp::new();
    let project = Uuid::now_v7();
    let created = app.ingest(project, &["abcdef1", "abcdef2", "abcdef3"]).await;
    for _ in 0..3 {
        assert!(matches!(
            app.run_next(Scripted::Succeed).await,
            DispatchStatus::Succeeded
        ));
    }

    let first: Value = app
        .server
        .get(&format!("/api/v1/projects/{project}/results"))
        .add_query_param("limit", 2)
        .await
        .json();
    let items = first["data"]["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    let cursor = first["data"]["next_after"].as_str().unwrap().to_string();
    assert_eq!(cursor, items[1]["job_id"].as_str().unwrap());

    let second: Value = app
        .server
        .get(&format!("/api/v1/projects/{project}/results"))
        .add_query_param("limit", 2)
        .add_query_param("after", &cursor)
        .await
        .json();
    assert_eq!(second["data"]["items"].as_array().unwrap().len(), 1);
    assert_eq!(second["data"]["next_after"], Value::Null);

    app.server
        .get(&format!("/api/v1/projects/{project}/results"))
        .add_query_param("limit", 0)
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    let job_id = created["data"]["created"][0].as_str().unwrap();
    let result: Value = app
        .server
        .get(&format!("/api/v1/scan-jobs/{job_id}/result"))
        .await
        .json();
    assert_eq!(result["data"]["job_id"], job_id);
    assert_eq!(result["data"]["instance"], "sq-1");
    assert_eq!(result["data"]["measures"]["ncloc"], "1,024");
}

#[tokio::test]
async fn failed_job_has_no_result() {
    let app = TestApp::new();
    let project = Uuid::now_v7();
    let created = app.ingest(project, &["abcdef1"]).await;
    let job_id = created["data"]["created"][0].as_str().unwrap().to_string();
    app.run_next(Scripted::Reject).await;

    app.server
        .get(&format!("/api/v1/scan-jobs/{job_id}/result"))
        .await
        .assert_status(StatusCode::NOT_FOUND);
    let results: Value = app
        .server
        .get(&format!("/api/v1/projects/{project}/results"))
        .await
        .json();
    assert_eq!(results["data"]["items"].as_array().unwrap().len(), 0);
}
