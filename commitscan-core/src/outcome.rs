//! Result of a single scan attempt as seen by the retry controller.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// Metrics pulled for one analysed commit.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ScanMetrics {
    pub component_key: String,
    /// Metric key to raw value as reported by the instance.
    pub measures: BTreeMap<String, String>,
}

/// Why an attempt failed, in terms the ledger and operators can act on.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Network,
    Timeout,
    InstanceBusy,
    ScannerError,
    InvalidConfiguration,
    MalformedInput,
    MissingCommit,
    AnalysisRejected,
    LeaseExpired,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Network => "network",
            FailureClass::Timeout => "timeout",
            FailureClass::InstanceBusy => "instance_busy",
            FailureClass::ScannerError => "scanner_error",
            FailureClass::InvalidConfiguration => "invalid_configuration",
            FailureClass::MalformedInput => "malformed_input",
            FailureClass::MissingCommit => "missing_commit",
            FailureClass::AnalysisRejected => "analysis_rejected",
            FailureClass::LeaseExpired => "lease_expired",
        }
    }

    /// Failures that say more about the instance than about the commit.
    pub fn implicates_instance(&self) -> bool {
        matches!(
            self,
            FailureClass::Network | FailureClass::InstanceBusy
        )
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FailureReason {
    pub class: FailureClass,
    pub message: String,
}

impl FailureReason {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ScanOutcome {
    Success(ScanMetrics),
    TransientFailure(FailureReason),
    PermanentFailure(FailureReason),
}

impl ScanOutcome {
    pub fn transient(class: FailureClass, message: impl Into<String>) -> Self {
        ScanOutcome::TransientFailure(FailureReason::new(class, message))
    }

    pub fn permanent(class: FailureClass, message: impl Into<String>) -> Self {
        ScanOutcome::PermanentFailure(FailureReason::new(class, message))
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            ScanOutcome::Success(_) => None,
            ScanOutcome::TransientFailure(reason)
            | ScanOutcome::PermanentFailure(reason) => Some(reason),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ScanOutcome::Success(_) => "success",
            ScanOutcome::TransientFailure(_) => "transient_failure",
            ScanOutcome::PermanentFailure(_) => "permanent_failure",
        }
    }
}
