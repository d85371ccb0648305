//! SonarQube-backed executor.

use std::{collections::BTreeMap, fmt, path::Path, process::Stdio, time::Instant};

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde::{Deserialize, de::DeserializeOwned};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{RepoWorkspace, ScanExecutor, ScanFailure, Worktree, classify, tail};
use crate::{
    config::{MeasuresConfig, ScannerConfig},
    error::{OrchestratorError, Result},
    job::{ScanJob, is_commit_sha, is_project_key},
    outcome::{ScanMetrics, ScanOutcome},
    registry::AnalysisInstance,
};

const SCANNER_OUTPUT_LIMIT: usize = 4_000;
const QUALITY_GATE_FAILED: &str = "QUALITY GATE STATUS: FAILED";

/// Checks out the commit, runs `sonar-scanner` against the instance and
/// pulls the configured measures back.
pub struct SonarScanExecutor {
    http: reqwest::Client,
    scanner: ScannerConfig,
    measures: MeasuresConfig,
    workspace: RepoWorkspace,
}

impl fmt::Debug for SonarScanExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SonarScanExecutor")
            .field("scanner", &self.scanner.command)
            .field("measures", &self.measures.keys.len())
            .field("workspace", &self.workspace)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct ProjectSearch {
    #[serde(default)]
    components: Vec<ComponentRef>,
}

#[derive(Debug, Deserialize)]
struct ComponentRef {
    key: String,
}

#[derive(Debug, Deserialize)]
struct MeasuresResponse {
    component: MeasuredComponent,
}

#[derive(Debug, Deserialize)]
struct MeasuredComponent {
    #[serde(default)]
    measures: Vec<Measure>,
}

#[derive(Debug, Deserialize)]
struct Measure {
    metric: String,
    #[serde(default)]
    value: Option<String>,
}

fn endpoint(instance: &AnalysisInstance, path: &str) -> String {
    format!("{}/{}", instance.base_url.as_str().trim_end_matches('/'), path)
}

impl SonarScanExecutor {
    pub fn new(scanner: ScannerConfig, measures: MeasuresConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(scanner.request_timeout())
            .build()
            .map_err(|e| {
                OrchestratorError::Configuration(format!(
                    "failed to build HTTP client: {e}"
                ))
            })?;
        let workspace =
            RepoWorkspace::new(&scanner.work_dir, scanner.git_command.clone());
        Ok(Self {
            http,
            scanner,
            measures,
            workspace,
        })
    }

    async fn scan(
        &self,
        job: &ScanJob,
        instance: &AnalysisInstance,
    ) -> std::result::Result<ScanMetrics, ScanFailure> {
        if !is_commit_sha(&job.commit_sha) {
            return Err(ScanFailure::InvalidInput(format!(
                "malformed commit sha '{}'",
                job.commit_sha
            )));
        }
        if !is_project_key(&job.project_key) {
            return Err(ScanFailure::InvalidInput(format!(
                "malformed project key '{}'",
                job.project_key
            )));
        }

        let component_key = job.component_key();
        if self.component_exists(instance, &component_key).await? {
            info!(
                target: "scan::executor",
                component = %component_key,
                instance = %instance.id,
                "component already analysed, skipping scanner"
            );
        } else {
            let url = job.repository_url.as_deref().ok_or_else(|| {
                ScanFailure::Configuration(
                    "job has no repository url and the component does not exist yet"
                        .into(),
                )
            })?;
            let worktree = self
                .workspace
                .checkout(&instance.id, &job.project_key, url, &job.commit_sha)
                .await?;
            let scanned = self
                .run_scanner(job, instance, &component_key, &worktree)
                .await;
            worktree.remove().await;
            scanned?;
        }

        let measures = self.fetch_measures(instance, &component_key).await?;
        if measures.is_empty() && !self.measures.keys.is_empty() {
            return Err(ScanFailure::EmptyMeasures(component_key));
        }
        Ok(ScanMetrics {
            component_key,
            measures,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        instance: &AnalysisInstance,
        path: &str,
        query: &[(&str, &str)],
    ) -> std::result::Result<T, ScanFailure> {
        let response = self
            .http
            .get(endpoint(instance, path))
            .basic_auth(instance.credential.expose(), Some(""))
            .header(ACCEPT, "application/json")
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(ScanFailure::from);
        }

        #[derive(Debug, Deserialize)]
        struct ErrorBody {
            #[serde(default)]
            errors: Vec<ErrorMessage>,
        }

        #[derive(Debug, Deserialize)]
        struct ErrorMessage {
            msg: String,
        }

        let message = response
            .json::<ErrorBody>()
            .await
            .ok()
            .and_then(|body| body.errors.into_iter().next())
            .map(|e| e.msg)
            .unwrap_or_else(|| format!("GET {path} failed"));
        Err(ScanFailure::Http {
            status: status.as_u16(),
            message,
        })
    }

    async fn component_exists(
        &self,
        instance: &AnalysisInstance,
        component_key: &str,
    ) -> std::result::Result<bool, ScanFailure> {
        let found: ProjectSearch = self
            .get_json(
                instance,
                "api/projects/search",
                &[("projects", component_key)],
            )
            .await?;
        Ok(found.components.iter().any(|c| c.key == component_key))
    }

    async fn fetch_measures(
        &self,
        instance: &AnalysisInstance,
        component_key: &str,
    ) -> std::result::Result<BTreeMap<String, String>, ScanFailure> {
        let mut measures = BTreeMap::new();
        for chunk in self.measures.keys.chunks(self.measures.chunk_size.max(1)) {
            let metric_keys = chunk.join(",");
            let response: MeasuresResponse = self
                .get_json(
                    instance,
                    "api/measures/component",
                    &[("component", component_key), ("metricKeys", &metric_keys)],
                )
                .await?;
            for measure in response.component.measures {
                if let Some(value) = measure.value {
                    measures.insert(measure.metric, value);
                }
            }
        }
        Ok(measures)
    }

    async fn run_scanner(
        &self,
        job: &ScanJob,
        instance: &AnalysisInstance,
        component_key: &str,
        worktree: &Worktree,
    ) -> std::result::Result<(), ScanFailure> {
        let settings = match &job.config_override {
            Some(o) => Some(
                self.workspace
                    .write_override(&instance.id, &job.project_key, &o.content)
                    .await?,
            ),
            None => None,
        };

        let mut command = Command::new(&self.scanner.command);
        command
            .current_dir(worktree.path())
            .arg(format!("-Dsonar.projectKey={component_key}"))
            .arg(format!("-Dsonar.projectName={component_key}"))
            .arg("-Dsonar.sources=.")
            .arg(format!(
                "-Dsonar.host.url={}",
                instance.base_url.as_str().trim_end_matches('/')
            ))
            .arg("-Dsonar.sourceEncoding=UTF-8")
            .arg("-Dsonar.scm.exclusions.disabled=true")
            .arg("-Dsonar.java.binaries=.")
            // Passed through the environment so it never shows up in `ps`.
            .env("SONAR_TOKEN", instance.credential.expose())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if self.scanner.wait_for_quality_gate {
            command
                .arg("-Dsonar.qualitygate.wait=true")
                .arg(format!(
                    "-Dsonar.qualitygate.timeout={}",
                    self.scanner.attempt_timeout_secs
                ));
        }
        if let Some(path) = settings.as_deref() {
            command.arg(format!("-Dproject.settings={}", display(path)));
        }
        command.args(&self.scanner.extra_args);

        debug!(
            target: "scan::executor",
            job = %job.id,
            component = component_key,
            worktree = %worktree.path().display(),
            "running scanner"
        );
        let output = command.output().await?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            return Ok(());
        }
        if self.scanner.wait_for_quality_gate && text.contains(QUALITY_GATE_FAILED) {
            // The report was processed; a red gate still has measures.
            info!(
                target: "scan::executor",
                component = component_key,
                "quality gate failed, collecting measures anyway"
            );
            return Ok(());
        }
        Err(ScanFailure::Scanner {
            code: output.status.code(),
            output: tail(text.trim(), SCANNER_OUTPUT_LIMIT).to_string(),
        })
    }
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[async_trait]
impl ScanExecutor for SonarScanExecutor {
    async fn execute(
        &self,
        job: &ScanJob,
        instance: &AnalysisInstance,
    ) -> ScanOutcome {
        let started = Instant::now();
        match self.scan(job, instance).await {
            Ok(metrics) => {
                info!(
                    target: "scan::executor",
                    job = %job.id,
                    component = %metrics.component_key,
                    instance = %instance.id,
                    measures = metrics.measures.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "scan succeeded"
                );
                ScanOutcome::Success(metrics)
            }
            Err(failure) => {
                let outcome = classify(&failure);
                warn!(
                    target: "scan::executor",
                    job = %job.id,
                    instance = %instance.id,
                    outcome = outcome.label(),
                    error = %failure,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "scan attempt failed"
                );
                outcome
            }
        }
    }
}
