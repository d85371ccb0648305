//! Orchestrator configuration types.
//!
//! Shared between the server's config loader and the worker runtime. Every
//! section carries defaults so a deployment only has to describe its
//! analysis instances.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use url::Url;

/// Global knobs that tune orchestrator behaviour.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Worker loop sizing and idle/backoff cadence.
    pub workers: WorkerConfig,
    /// Lease defaults (TTL, renewal thresholds, housekeeping cadence).
    pub lease: LeaseConfig,
    /// Retry/backoff policy shared by all workers.
    pub retry: RetryConfig,
    /// How long workers wait for an instance and how failing instances cool down.
    pub pool: PoolConfig,
    /// Scanner CLI and checkout settings.
    pub scanner: ScannerConfig,
    /// Metric keys pulled after each successful analysis.
    pub measures: MeasuresConfig,
    /// Configured analysis-service instances.
    pub instances: Vec<InstanceConfig>,
}

impl OrchestratorConfig {
    /// Sum of configured capacities over enabled instances.
    pub fn max_concurrency(&self) -> usize {
        self.instances
            .iter()
            .filter(|instance| instance.enabled)
            .map(|instance| instance.capacity)
            .sum()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of independent claim-execute-complete loops.
    pub count: usize,
    /// Jobs claimed per round trip to the store.
    pub claim_batch: usize,
    /// Sleep between polls when nothing is eligible (ms).
    pub idle_poll_ms: u64,
    /// First delay after an infrastructure failure (ms). Doubles per failure.
    pub infra_backoff_base_ms: u64,
    /// Upper bound for the infrastructure backoff (ms).
    pub infra_backoff_max_ms: u64,
    /// Attempts for a single ledger/store write before giving up on a job.
    pub write_attempts: u32,
    /// Grace period for in-flight workers on shutdown (seconds).
    pub shutdown_grace_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 4,
            claim_batch: 1,
            idle_poll_ms: 2_000,
            infra_backoff_base_ms: 500,
            infra_backoff_max_ms: 30_000,
            write_attempts: 5,
            shutdown_grace_secs: 30,
        }
    }
}

impl WorkerConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Lease/heartbeat tuning for worker tasks.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Default TTL for job leases (seconds)
    pub lease_ttl_secs: i64,
    /// Renew when remaining TTL drops below this fraction of the original TTL (e.g. 0.5)
    pub renew_at_fraction: f32,
    /// Minimum margin before expiry to trigger a renewal regardless of fraction (ms)
    pub renew_min_margin_ms: u64,
    /// Housekeeping cadence for scanning expired leases (ms)
    pub housekeeper_interval_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 120,
            renew_at_fraction: 0.5,
            renew_min_margin_ms: 2_000,
            housekeeper_interval_ms: 15_000,
        }
    }
}

impl LeaseConfig {
    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_ttl_secs.max(1))
    }

    pub fn housekeeper_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeper_interval_ms)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retry budget stamped on newly ingested jobs.
    pub default_max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Upward-only jitter as a fraction of the computed delay (0.0..=1.0).
    pub jitter_ratio: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            backoff_base_ms: 30_000,
            backoff_max_ms: 30 * 60 * 1_000,
            jitter_ratio: 0.2,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// How long a worker waits for a free instance slot (ms).
    pub acquire_wait_ms: u64,
    /// Delay before a job released for lack of instances becomes eligible (ms).
    pub unavailable_requeue_ms: u64,
    /// Cool-down applied to an instance after a network or busy failure (seconds).
    pub unhealthy_cooldown_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            acquire_wait_ms: 30_000,
            unavailable_requeue_ms: 5_000,
            unhealthy_cooldown_secs: 60,
        }
    }
}

impl PoolConfig {
    pub fn acquire_wait(&self) -> Duration {
        Duration::from_millis(self.acquire_wait_ms)
    }

    pub fn unavailable_requeue(&self) -> Duration {
        Duration::from_millis(self.unavailable_requeue_ms)
    }

    pub fn unhealthy_cooldown(&self) -> Duration {
        Duration::from_secs(self.unhealthy_cooldown_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Scanner executable, resolved through `PATH` when relative.
    pub command: String,
    /// `git` executable used for clones and worktrees.
    pub git_command: String,
    /// Root for per-instance repository clones, worktrees and override files.
    pub work_dir: PathBuf,
    /// Hard timeout for one scan attempt (seconds).
    pub attempt_timeout_secs: u64,
    /// Timeout for individual HTTP calls to an instance (seconds).
    pub request_timeout_secs: u64,
    /// Extra `-D` style arguments appended to every scanner invocation.
    pub extra_args: Vec<String>,
    /// Block until the instance finished processing the report.
    pub wait_for_quality_gate: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            command: "sonar-scanner".into(),
            git_command: "git".into(),
            work_dir: PathBuf::from("data/work"),
            attempt_timeout_secs: 30 * 60,
            request_timeout_secs: 30,
            extra_args: Vec::new(),
            wait_for_quality_gate: true,
        }
    }
}

impl ScannerConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasuresConfig {
    /// Metric keys requested per component; also the CSV export columns.
    pub keys: Vec<String>,
    /// Keys per measures request.
    pub chunk_size: usize,
}

impl Default for MeasuresConfig {
    fn default() -> Self {
        Self {
            keys: [
                "ncloc",
                "complexity",
                "cognitive_complexity",
                "bugs",
                "vulnerabilities",
                "code_smells",
                "coverage",
                "duplicated_lines_density",
                "sqale_index",
                "reliability_rating",
                "security_rating",
                "sqale_rating",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            chunk_size: 25,
        }
    }
}

/// One analysis-service instance as written in the config file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: String,
    pub base_url: Url,
    /// Inline token. Prefer `token_env` outside of local setups.
    #[serde(default)]
    pub token: Option<String>,
    /// Name of the environment variable holding the token.
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default = "InstanceConfig::default_capacity")]
    pub capacity: usize,
    #[serde(default = "InstanceConfig::default_enabled")]
    pub enabled: bool,
}

impl InstanceConfig {
    const fn default_capacity() -> usize {
        1
    }

    const fn default_enabled() -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_defaults() {
        let json = serde_json::json!({
            "retry": { "default_max_retries": 5 },
            "instances": [
                { "id": "sonar-a", "base_url": "http://sonar-a:9000",
                  "token_env": "SONAR_A_TOKEN", "capacity": 3 },
                { "id": "sonar-b", "base_url": "http://sonar-b:9000",
                  "enabled": false }
            ]
        });
        let config: OrchestratorConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.retry.default_max_retries, 5);
        assert_eq!(config.retry.backoff_base_ms, 30_000);
        assert_eq!(config.workers.count, 4);
        assert_eq!(config.instances[1].capacity, 1);
        assert_eq!(config.max_concurrency(), 3);
    }
}
