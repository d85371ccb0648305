use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::{Value, json};
use tracing::warn;

use commitscan_core::store::JobStore;

use crate::infra::app_state::AppState;

pub async fn health_handler(
    State(state): State<AppState>,
) -> (StatusCode, Json<Value>) {
    let mut health_status = json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "checks": {}
    });

    let code = match state.store.status_counts(None).await {
        Ok(counts) => {
            health_status["checks"]["store"] = json!({
                "status": "healthy",
                "queued": counts.queued(),
                "running": counts.running,
            });
            StatusCode::OK
        }
        Err(err) => {
            warn!(error = %err, "health check could not reach the job store");
            health_status["status"] = json!("unhealthy");
            health_status["checks"]["store"] = json!({
                "status": "unhealthy",
                "error": err.to_string(),
            });
            StatusCode::SERVICE_UNAVAILABLE
        }
    };

    (code, Json(health_status))
}
