use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Json},
};
use futures::TryStreamExt;
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use commitscan_core::{
    ProjectProgress, ResultPage, ScanResult,
    job::{CommitSpec, EnqueueSummary, JobId, ProjectId},
};

use crate::{
    api::ApiResponse,
    errors::{AppError, AppResult},
    infra::app_state::AppState,
};

/// Ingestion accepts a bare list or `{"commits": [...]}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum IngestRequest {
    List(Vec<CommitSpec>),
    Wrapped { commits: Vec<CommitSpec> },
}

impl IngestRequest {
    fn into_commits(self) -> Vec<CommitSpec> {
        match self {
            IngestRequest::List(commits)
            | IngestRequest::Wrapped { commits } => commits,
        }
    }
}

/// Keyset cursor over a project's results.
#[derive(Debug, Default, Deserialize)]
pub struct ResultListQuery {
    pub after: Option<Uuid>,
    pub limit: Option<u32>,
}

pub async fn ingest_commits_handler(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Json(request): Json<IngestRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<EnqueueSummary>>)> {
    let commits = request.into_commits();
    if commits.is_empty() {
        return Err(AppError::bad_request("no commits submitted"));
    }

    let summary = state
        .operator()
        .ingest_commits(ProjectId(project_id), commits)
        .await?;
    let status = if summary.created.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(ApiResponse::success(summary))))
}

pub async fn project_progress_handler(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<ProjectProgress>>> {
    let progress = state
        .operator()
        .project_progress(ProjectId(project_id))
        .await?;
    Ok(Json(ApiResponse::success(progress)))
}

pub async fn list_results_handler(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Query(query): Query<ResultListQuery>,
) -> AppResult<Json<ApiResponse<ResultPage>>> {
    let page = state
        .operator()
        .list_results(ProjectId(project_id), query.after.map(JobId), query.limit)
        .await?;
    Ok(Json(ApiResponse::success(page)))
}

pub async fn get_result_handler(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<ScanResult>>> {
    let result = state.operator().get_result(JobId(job_id)).await?;
    Ok(Json(ApiResponse::success(result)))
}

pub async fn export_results_handler(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> impl IntoResponse {
    let stream = state
        .operator()
        .export_results_csv(ProjectId(project_id))
        .inspect_err(move |err| {
            warn!(project = %project_id, error = %err, "result export aborted");
        });

    let headers = [
        (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"scan-results-{project_id}.csv\""),
        ),
    ];
    (headers, Body::from_stream(stream))
}
