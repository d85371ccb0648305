use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::fmt;

use commitscan_core::OrchestratorError;

use crate::api::ApiResponse;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ApiResponse::<()>::error(self.message));
        (self.status, body).into_response()
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::NotFound(msg) => Self::not_found(msg),
            OrchestratorError::InvalidInput(msg) => Self::bad_request(msg),
            OrchestratorError::Conflict(msg) => Self::conflict(msg),
            OrchestratorError::LeaseLost(job) => {
                Self::conflict(format!("job {job} changed owner"))
            }
            OrchestratorError::InstanceUnavailable(msg) => Self::unavailable(msg),
            err if err.is_infrastructure() => {
                tracing::error!(error = %err, "store operation failed");
                Self::unavailable("Job store unavailable")
            }
            err => {
                tracing::error!(error = %err, "request failed");
                Self::internal(err.to_string())
            }
        }
    }
}
