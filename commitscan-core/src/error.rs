use thiserror::Error;

use crate::job::JobId;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Lease no longer held for job {0}")]
    LeaseLost(JobId),

    #[error("No analysis instance available: {0}")]
    InstanceUnavailable(String),

    #[error("Store unavailable: {0}")]
    Store(String),

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "postgres")]
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// True when the failure came from the backing store or another piece of
    /// infrastructure rather than from the request itself. Worker loops back
    /// off on these instead of touching job state.
    pub fn is_infrastructure(&self) -> bool {
        match self {
            OrchestratorError::Store(_) | OrchestratorError::Internal(_) => {
                true
            }
            #[cfg(feature = "postgres")]
            OrchestratorError::Database(_)
            | OrchestratorError::Migration(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
