//! # commitscan core
//!
//! Durable orchestration of per-commit static-analysis scans.
//!
//! ## Overview
//!
//! - **Job store**: scan jobs with atomic claims, leases and conditional
//!   completion ([`store`])
//! - **Instance pool**: least-loaded selection over analysis instances with
//!   health tracking ([`registry`])
//! - **Executor**: one bounded scan attempt classified as success,
//!   transient or permanent failure ([`executor`])
//! - **Retry controller**: next state and backoff for an outcome ([`retry`])
//! - **Ledgers**: immutable results and operator-managed failure records
//!   ([`ledger`])
//! - **Runtime**: worker loops, lease heartbeat and housekeeping
//!   ([`runtime`], [`dispatcher`])
//!
//! ## Feature Flags
//!
//! - `postgres` (default): PostgreSQL store and embedded migrations
//! - `pg-tests`: store tests against a live database

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

pub mod config;

pub mod dispatcher;

/// Error types shared by every module
pub mod error;

pub mod executor;

/// CSV rendering for result exports
pub mod export;

pub mod job;

pub mod lease;

pub mod ledger;

pub mod outcome;

/// Analysis instance registry
pub mod registry;

pub mod retry;

pub mod runtime;

/// Operator-facing operations used by the HTTP layer
pub mod service;

pub mod store;

#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub use config::OrchestratorConfig;
pub use dispatcher::{DispatchStatus, JobDispatcher, ScanDispatcher};
pub use error::{OrchestratorError, Result};
pub use executor::{ScanExecutor, ScanFailure, SonarScanExecutor, classify};
pub use job::{
    CommitSpec, ConfigOverride, JobFilter, JobId, JobStatus, Page, PageRequest,
    ProjectId, ScanJob,
};
pub use ledger::{FailedRecordId, FailedScanRecord, FailureStatus, ScanResult};
pub use outcome::{FailureClass, FailureReason, ScanMetrics, ScanOutcome};
pub use registry::{AnalysisInstance, InstancePool};
pub use retry::{RetryPolicy, Transition};
pub use runtime::ScanRuntime;
pub use service::{
    OperatorService, ProjectProgress, ResultPage, WorkerStatistics,
};
pub use store::{InMemoryStore, JobStore, ScanStore};
#[cfg(feature = "postgres")]
pub use store::PostgresStore;
