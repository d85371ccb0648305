use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    response::Json,
};
use serde::Deserialize;
use uuid::Uuid;

use commitscan_core::{
    job::{
        JobFilter, JobId, JobStatus, Page, PageRequest, ProjectId,
        RetryRequest, ScanJob,
    },
    store::JobSort,
};

use super::{optional_json, parse_choice};
use crate::{api::ApiResponse, errors::AppResult, infra::app_state::AppState};

#[derive(Debug, Default, Deserialize)]
pub struct JobListQuery {
    pub status: Option<String>,
    pub project_id: Option<Uuid>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub sort_by: Option<String>,
    pub sort_dir: Option<String>,
}

impl JobListQuery {
    fn into_parts(self) -> AppResult<(JobFilter, PageRequest, JobSort)> {
        let status = self
            .status
            .as_deref()
            .map(str::parse::<JobStatus>)
            .transpose()?;
        let filter = JobFilter {
            status,
            project_id: self.project_id.map(ProjectId),
        };
        let page = PageRequest::new(self.page, self.page_size)?;
        let mut sort = JobSort::default();
        if let Some(field) = self.sort_by.as_deref() {
            sort.field = parse_choice("sort_by", field)?;
        }
        if let Some(dir) = self.sort_dir.as_deref() {
            sort.direction = parse_choice("sort_dir", dir)?;
        }
        Ok((filter, page, sort))
    }
}

pub async fn list_jobs_handler(
    State(state): State<AppState>,
    Query(query): Query<JobListQuery>,
) -> AppResult<Json<ApiResponse<Page<ScanJob>>>> {
    let (filter, page, sort) = query.into_parts()?;
    let jobs = state.operator().list_jobs(filter, page, sort).await?;
    Ok(Json(ApiResponse::success(jobs)))
}

pub async fn get_job_handler(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<ScanJob>>> {
    let job = state.operator().get_job(JobId(job_id)).await?;
    Ok(Json(ApiResponse::success(job)))
}

pub async fn retry_job_handler(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    body: Bytes,
) -> AppResult<Json<ApiResponse<ScanJob>>> {
    let request: RetryRequest = optional_json(&body)?;
    let job = state.operator().retry_job(JobId(job_id), request).await?;
    Ok(Json(
        ApiResponse::success(job).with_message("job queued for another attempt"),
    ))
}
