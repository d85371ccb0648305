//! Scan execution.
//!
//! An executor never returns an error: everything that can go wrong during an
//! attempt is a [`ScanFailure`], and [`classify`] is the single place that
//! decides whether a failure is worth retrying.

mod sonar;
mod workspace;

pub use sonar::SonarScanExecutor;
pub use workspace::{RepoWorkspace, Worktree};

use std::{fmt, time::Duration};

use async_trait::async_trait;
use tracing::warn;

use crate::{
    job::ScanJob,
    outcome::{FailureClass, ScanOutcome},
    registry::AnalysisInstance,
};

/// Output fragments the scanner prints when an analysis can never succeed
/// for this commit, no matter how often it is retried.
const SCANNER_REJECTION_MARKERS: &[&str] = &[
    "Validation of project failed",
    "is not a valid project or module key",
    "Malformed key for Project",
    "Invalid value of sonar.",
    "is not a valid project key",
];

/// Markers for credentials the instance refuses.
const SCANNER_AUTH_MARKERS: &[&str] = &[
    "You're not authorized to run analysis",
    "You're not authorized to analyze this project",
    "Not authorized. Please check the properties sonar.login",
];

/// Runs one scan attempt of `job` against `instance`.
#[async_trait]
pub trait ScanExecutor: Send + Sync + fmt::Debug {
    async fn execute(
        &self,
        job: &ScanJob,
        instance: &AnalysisInstance,
    ) -> ScanOutcome;
}

/// Everything that can fail inside one attempt.
#[derive(Debug, thiserror::Error)]
pub enum ScanFailure {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    RequestTimeout(String),

    #[error("analysis service returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("`git {command}` failed: {message}")]
    Git { command: String, message: String },

    #[error("commit {0} is not present in the repository")]
    MissingCommit(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("scanner exited with {code:?}: {output}")]
    Scanner { code: Option<i32>, output: String },

    #[error("no measures returned for {0}")]
    EmptyMeasures(String),

    #[error("attempt exceeded {}s", .0.as_secs())]
    TimedOut(Duration),
}

impl From<reqwest::Error> for ScanFailure {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return ScanFailure::RequestTimeout(err.to_string());
        }
        if let Some(status) = err.status() {
            return ScanFailure::Http {
                status: status.as_u16(),
                message: err.to_string(),
            };
        }
        if err.is_decode() {
            // A body we cannot parse is most likely a proxy error page.
            return ScanFailure::Network(format!("unreadable response: {err}"));
        }
        ScanFailure::Network(err.to_string())
    }
}

/// Map a failure onto a retry decision.
pub fn classify(failure: &ScanFailure) -> ScanOutcome {
    let message = failure.to_string();
    match failure {
        ScanFailure::Network(_) => {
            ScanOutcome::transient(FailureClass::Network, message)
        }
        ScanFailure::RequestTimeout(_) | ScanFailure::TimedOut(_) => {
            ScanOutcome::transient(FailureClass::Timeout, message)
        }
        ScanFailure::Http { status, .. } => match *status {
            408 => ScanOutcome::transient(FailureClass::Timeout, message),
            409 | 429 => {
                ScanOutcome::transient(FailureClass::InstanceBusy, message)
            }
            401 | 403 => ScanOutcome::permanent(
                FailureClass::InvalidConfiguration,
                message,
            ),
            500..=599 => {
                ScanOutcome::transient(FailureClass::InstanceBusy, message)
            }
            400..=499 => {
                ScanOutcome::permanent(FailureClass::AnalysisRejected, message)
            }
            _ => ScanOutcome::transient(FailureClass::Network, message),
        },
        ScanFailure::Io(_) | ScanFailure::Git { .. } => {
            ScanOutcome::transient(FailureClass::ScannerError, message)
        }
        ScanFailure::MissingCommit(_) => {
            ScanOutcome::permanent(FailureClass::MissingCommit, message)
        }
        ScanFailure::InvalidInput(_) => {
            ScanOutcome::permanent(FailureClass::MalformedInput, message)
        }
        ScanFailure::Configuration(_) => {
            ScanOutcome::permanent(FailureClass::InvalidConfiguration, message)
        }
        ScanFailure::Scanner { output, .. } => {
            if contains_any(output, SCANNER_AUTH_MARKERS) {
                ScanOutcome::permanent(FailureClass::InvalidConfiguration, message)
            } else if contains_any(output, SCANNER_REJECTION_MARKERS) {
                ScanOutcome::permanent(FailureClass::AnalysisRejected, message)
            } else {
                ScanOutcome::transient(FailureClass::ScannerError, message)
            }
        }
        ScanFailure::EmptyMeasures(_) => {
            ScanOutcome::transient(FailureClass::ScannerError, message)
        }
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

/// Run one attempt under a hard deadline. Dropping the attempt future kills
/// any child process it spawned.
pub async fn execute_bounded(
    executor: &dyn ScanExecutor,
    job: &ScanJob,
    instance: &AnalysisInstance,
    limit: Duration,
) -> ScanOutcome {
    match tokio::time::timeout(limit, executor.execute(job, instance)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(
                target: "scan::executor",
                job = %job.id,
                instance = %instance.id,
                timeout_secs = limit.as_secs(),
                "scan attempt timed out"
            );
            classify(&ScanFailure::TimedOut(limit))
        }
    }
}

/// Keep the last `max` bytes of scanner output, on a char boundary.
pub(crate) fn tail(output: &str, max: usize) -> &str {
    if output.len() <= max {
        return output;
    }
    let mut start = output.len() - max;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    &output[start..]
}
