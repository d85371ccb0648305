use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use commitscan_core::{
    job::{Page, PageRequest, ProjectId, ScanJob},
    ledger::{
        FailedRecordId, FailedScanRecord, FailureFilter, FailureSort,
        FailureStatus,
    },
};

use super::{optional_json, parse_choice};
use crate::{api::ApiResponse, errors::AppResult, infra::app_state::AppState};

#[derive(Debug, Default, Deserialize)]
pub struct FailureListQuery {
    pub status: Option<String>,
    pub project_id: Option<Uuid>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub sort_by: Option<String>,
    pub sort_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateFailureRequest {
    pub config_override: String,
    #[serde(default)]
    pub config_source: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RequeueRequest {
    #[serde(default)]
    pub config_override: Option<String>,
    #[serde(default)]
    pub config_source: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RequeueResponse {
    pub record: FailedScanRecord,
    pub job: ScanJob,
}

pub async fn list_failures_handler(
    State(state): State<AppState>,
    Query(query): Query<FailureListQuery>,
) -> AppResult<Json<ApiResponse<Page<FailedScanRecord>>>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<FailureStatus>)
        .transpose()?;
    let filter = FailureFilter {
        status,
        project_id: query.project_id.map(ProjectId),
    };
    let page = PageRequest::new(query.page, query.page_size)?;
    let mut sort = FailureSort::default();
    if let Some(field) = query.sort_by.as_deref() {
        sort.field = parse_choice("sort_by", field)?;
    }
    if let Some(dir) = query.sort_dir.as_deref() {
        sort.direction = parse_choice("sort_dir", dir)?;
    }

    let records = state.operator().list_failures(filter, page, sort).await?;
    Ok(Json(ApiResponse::success(records)))
}

pub async fn get_failure_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<FailedScanRecord>>> {
    let record = state.operator().get_failure(FailedRecordId(id)).await?;
    Ok(Json(ApiResponse::success(record)))
}

pub async fn update_failure_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateFailureRequest>,
) -> AppResult<Json<ApiResponse<FailedScanRecord>>> {
    let record = state
        .operator()
        .update_failure(
            FailedRecordId(id),
            request.config_override,
            request.config_source,
        )
        .await?;
    Ok(Json(ApiResponse::success(record)))
}

pub async fn requeue_failure_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> AppResult<Json<ApiResponse<RequeueResponse>>> {
    let request: RequeueRequest = optional_json(&body)?;
    let (record, job) = state
        .operator()
        .requeue_failure(
            FailedRecordId(id),
            request.config_override,
            request.config_source,
        )
        .await?;
    Ok(Json(ApiResponse::success(RequeueResponse { record, job })))
}
