use axum::{
    Router,
    routing::{get, post},
};

use crate::{
    handlers::{failed_commits, jobs, projects, stats},
    infra::app_state::AppState,
};

/// Create all v1 API routes
pub fn create_v1_router() -> Router<AppState> {
    Router::new()
        // Project ingestion
        .route(
            "/projects/{project_id}/commits",
            post(projects::ingest_commits_handler),
        )
        .route(
            "/projects/{project_id}/progress",
            get(projects::project_progress_handler),
        )
        .route(
            "/projects/{project_id}/results",
            get(projects::list_results_handler),
        )
        .route(
            "/projects/{project_id}/results/export",
            get(projects::export_results_handler),
        )
        // Scan jobs
        .route("/scan-jobs", get(jobs::list_jobs_handler))
        .route("/scan-jobs/workers-stats", get(stats::worker_stats_handler))
        .route("/scan-jobs/{id}", get(jobs::get_job_handler))
        .route("/scan-jobs/{id}/retry", post(jobs::retry_job_handler))
        .route("/scan-jobs/{id}/result", get(projects::get_result_handler))
        // Failure ledger
        .route("/failed-commits", get(failed_commits::list_failures_handler))
        .route(
            "/failed-commits/{id}",
            get(failed_commits::get_failure_handler)
                .put(failed_commits::update_failure_handler),
        )
        .route(
            "/failed-commits/{id}/retry",
            post(failed_commits::requeue_failure_handler),
        )
}
