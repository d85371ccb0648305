use axum::{extract::State, response::Json};

use commitscan_core::WorkerStatistics;

use crate::{api::ApiResponse, errors::AppResult, infra::app_state::AppState};

pub async fn worker_stats_handler(
    State(state): State<AppState>,
) -> AppResult<Json<ApiResponse<WorkerStatistics>>> {
    let stats = state.operator().worker_stats().await?;
    Ok(Json(ApiResponse::success(stats)))
}
