//! Integration test runner.
//!
//! Runs the declared scenarios against the container's published endpoint
//! and aggregates a [`TestReport`]. Every selected scenario runs to
//! completion; the verdict is computed only once the whole suite settled.
//! An unreachable endpoint is an infrastructure error, not a test failure.

mod command;
pub mod fake;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use shipgate_state::{write_atomic, ContentDigest};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::artifact::Artifact;
use crate::config::{IntegrationConfig, ScenarioConfig};
use crate::error::{Result, ShipgateError};
use crate::obs;
use crate::version::Version;

pub use command::CommandScenarioExecutor;

/// Report location relative to the reports directory.
pub const REPORT_FILE: &str = "integration/test-report.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    Passed,
    Failed,
    Skipped,
}

impl ScenarioStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ScenarioStatus::Passed => "passed",
            ScenarioStatus::Failed => "failed",
            ScenarioStatus::Skipped => "skipped",
        }
    }
}

/// What an executor observed for one scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioVerdict {
    pub status: ScenarioStatus,
    pub detail: Option<String>,
}

impl ScenarioVerdict {
    pub fn passed() -> Self {
        Self {
            status: ScenarioStatus::Passed,
            detail: None,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            status: ScenarioStatus::Failed,
            detail: Some(detail.into()),
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: ScenarioStatus::Skipped,
            detail: None,
        }
    }
}

/// Runs one scenario of the external suite.
///
/// `Err` means the scenario could not be run at all (the suite itself is
/// broken) and aborts the report with an infrastructure error.
#[async_trait]
pub trait ScenarioExecutor: Send + Sync {
    async fn execute(&self, scenario: &ScenarioConfig, endpoint: &str) -> Result<ScenarioVerdict>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub name: String,
    pub status: ScenarioStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// The bundle a suite ran against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestedArtifact {
    pub version: Version,
    pub digest: ContentDigest,
}

impl TestedArtifact {
    fn is(&self, artifact: &Artifact) -> bool {
        self.version == artifact.version && self.digest == artifact.digest
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    /// Absent in reports that were not produced by a pipeline run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tested: Option<TestedArtifact>,
    pub endpoint: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub summary: TestSummary,
    /// In declaration order.
    pub scenarios: Vec<ScenarioResult>,
}

impl TestReport {
    pub fn new(
        endpoint: impl Into<String>,
        started_at: DateTime<Utc>,
        duration_ms: u64,
        scenarios: Vec<ScenarioResult>,
    ) -> Self {
        let count = |status| scenarios.iter().filter(|s| s.status == status).count();
        let summary = TestSummary {
            total: scenarios.len(),
            passed: count(ScenarioStatus::Passed),
            failed: count(ScenarioStatus::Failed),
            skipped: count(ScenarioStatus::Skipped),
        };
        Self {
            tested: None,
            endpoint: endpoint.into(),
            started_at,
            duration_ms,
            summary,
            scenarios,
        }
    }

    /// Bind the report to the bundle the container was built from.
    pub fn for_artifact(mut self, artifact: &Artifact) -> Self {
        self.tested = Some(TestedArtifact {
            version: artifact.version,
            digest: artifact.digest.clone(),
        });
        self
    }

    /// Fails unless this report was produced against exactly `artifact`.
    pub fn covers(&self, artifact: &Artifact) -> Result<()> {
        match &self.tested {
            Some(tested) if tested.is(artifact) => Ok(()),
            Some(tested) => Err(ShipgateError::Publish(format!(
                "integration report covers {} ({}), not {} ({}); run test-integration first",
                tested.version,
                tested.digest.short(),
                artifact.version,
                artifact.digest.short()
            ))),
            None => Err(ShipgateError::Publish(
                "integration report does not name the tested artifact; run test-integration first"
                    .to_string(),
            )),
        }
    }

    pub fn success(&self) -> bool {
        self.summary.failed == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &ScenarioResult> {
        self.scenarios
            .iter()
            .filter(|s| s.status == ScenarioStatus::Failed)
    }

    /// `IntegrationTestsFailed` unless every scenario passed or was skipped.
    pub fn verdict(&self) -> Result<()> {
        if self.success() {
            Ok(())
        } else {
            Err(ShipgateError::IntegrationTestsFailed {
                failed: self.summary.failed,
                total: self.summary.total,
            })
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &bytes)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn normalize_tag(tag: &str) -> &str {
    tag.trim().trim_start_matches('@')
}

/// Scenarios not carrying any excluded tag, in declaration order.
pub fn select_scenarios<'a>(
    scenarios: &'a [ScenarioConfig],
    exclude_tags: &[String],
) -> Vec<&'a ScenarioConfig> {
    scenarios
        .iter()
        .filter(|scenario| {
            let excluded = scenario.tags.iter().any(|tag| {
                exclude_tags
                    .iter()
                    .any(|ex| normalize_tag(ex) == normalize_tag(tag))
            });
            if excluded {
                debug!(scenario = %scenario.name, "scenario excluded by tag");
            }
            !excluded
        })
        .collect()
}

pub struct IntegrationRunner {
    config: IntegrationConfig,
    executor: Arc<dyn ScenarioExecutor>,
}

impl IntegrationRunner {
    pub fn new(config: IntegrationConfig, executor: Arc<dyn ScenarioExecutor>) -> Self {
        Self { config, executor }
    }

    /// Fail with `Infrastructure` unless `127.0.0.1:<port>` accepts a connection.
    pub async fn check_reachable(&self, port: u16) -> Result<()> {
        let limit = Duration::from_secs(self.config.connect_timeout_secs);
        match tokio::time::timeout(limit, TcpStream::connect(("127.0.0.1", port))).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(ShipgateError::Infrastructure(format!(
                "endpoint 127.0.0.1:{port} unreachable: {e}"
            ))),
            Err(_) => Err(ShipgateError::Infrastructure(format!(
                "endpoint 127.0.0.1:{port} did not accept a connection within {limit:?}"
            ))),
        }
    }

    /// Run the selected suite against `endpoint` (published on `port`).
    pub async fn run(&self, endpoint: &str, port: u16) -> Result<TestReport> {
        self.check_reachable(port).await?;

        let selected: Vec<ScenarioConfig> =
            select_scenarios(&self.config.scenarios, &self.config.exclude_tags)
                .into_iter()
                .cloned()
                .collect();
        info!(
            endpoint = %endpoint,
            scenarios = selected.len(),
            concurrency = self.config.concurrency,
            "running integration suite"
        );

        let started_at = Utc::now();
        let started = Instant::now();
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut workers = JoinSet::new();

        for (index, scenario) in selected.into_iter().enumerate() {
            let permits = Arc::clone(&permits);
            let executor = Arc::clone(&self.executor);
            let endpoint = endpoint.to_string();
            workers.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let begin = Instant::now();
                let verdict = std::panic::AssertUnwindSafe(executor.execute(&scenario, &endpoint))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Ok(ScenarioVerdict::failed("scenario executor panicked")));
                let duration_ms = begin.elapsed().as_millis() as u64;
                let result = verdict.map(|v| ScenarioResult {
                    name: scenario.name.clone(),
                    status: v.status,
                    duration_ms,
                    detail: v.detail,
                });
                (index, result)
            });
        }

        let mut results = Vec::new();
        let mut broken = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((index, Ok(result))) => {
                    obs::emit_scenario_finished(
                        &result.name,
                        result.status.as_str(),
                        result.duration_ms,
                    );
                    results.push((index, result));
                }
                Ok((_, Err(e))) => {
                    broken.get_or_insert(e);
                }
                Err(e) => {
                    broken.get_or_insert(ShipgateError::Infrastructure(format!(
                        "scenario worker aborted: {e}"
                    )));
                }
            }
        }
        if let Some(e) = broken {
            return Err(match e {
                ShipgateError::Infrastructure(_) => e,
                other => ShipgateError::Infrastructure(other.to_string()),
            });
        }

        results.sort_by_key(|(index, _)| *index);
        let report = TestReport::new(
            endpoint,
            started_at,
            started.elapsed().as_millis() as u64,
            results.into_iter().map(|(_, r)| r).collect(),
        );
        info!(
            total = report.summary.total,
            passed = report.summary.passed,
            failed = report.summary.failed,
            skipped = report.summary.skipped,
            "integration suite finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::fake::ScriptedScenarios;
    use super::*;
    use tokio::net::TcpListener;

    fn scenarios(n: usize) -> Vec<ScenarioConfig> {
        (1..=n)
            .map(|i| ScenarioConfig {
                name: format!("scenario-{i:02}"),
                tags: Vec::new(),
            })
            .collect()
    }

    fn config(scenarios: Vec<ScenarioConfig>) -> IntegrationConfig {
        IntegrationConfig {
            scenarios,
            concurrency: 3,
            connect_timeout_secs: 1,
            ..IntegrationConfig::default()
        }
    }

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn bundle(root: &Path, version: Version, body: &str) -> Artifact {
        let config = crate::config::PipelineConfig {
            root: root.to_path_buf(),
            ..Default::default()
        };
        let inputs = crate::artifact::AssemblyInputs::from_config(&config);
        for path in [
            &inputs.compiled_output,
            &inputs.license_report,
            &inputs.sbom,
            &inputs.license_text,
        ] {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, body).unwrap();
        }
        crate::artifact::ArtifactAssembler::new(&config)
            .assemble(&inputs, &version)
            .unwrap()
    }

    #[test]
    fn report_covers_only_the_tested_bundle() {
        let tmp = tempfile::tempdir().unwrap();
        let tested = bundle(tmp.path(), Version::new(2, 0, 0), "first build");
        let report = TestReport::new("http://127.0.0.1:8444", Utc::now(), 5, Vec::new());

        let err = report.covers(&tested).unwrap_err();
        assert!(err.to_string().contains("does not name the tested artifact"));

        let report = report.for_artifact(&tested);
        report.covers(&tested).unwrap();

        let next = bundle(tmp.path(), Version::new(2, 0, 1), "first build");
        let err = report.covers(&next).unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("covers 2.0.0"));

        let rebuilt = bundle(tmp.path(), Version::new(2, 0, 0), "second build");
        assert!(report.covers(&rebuilt).is_err());
    }

    #[test]
    fn tested_artifact_survives_the_report_file() {
        let tmp = tempfile::tempdir().unwrap();
        let tested = bundle(tmp.path(), Version::new(2, 0, 0), "build");
        let path = tmp.path().join("test-report.json");
        TestReport::new("http://127.0.0.1:8444", Utc::now(), 5, Vec::new())
            .for_artifact(&tested)
            .write(&path)
            .unwrap();

        let loaded = TestReport::load(&path).unwrap();
        loaded.covers(&tested).unwrap();
    }

    #[tokio::test]
    async fn all_scenarios_run_even_after_a_failure() {
        let (_listener, port) = listener().await;
        let executor = Arc::new(ScriptedScenarios::new().failing("scenario-03"));
        let runner = IntegrationRunner::new(config(scenarios(12)), executor.clone());

        let report = runner.run("https://localhost:8444", port).await.unwrap();
        assert_eq!(report.summary.total, 12);
        assert_eq!(report.summary.passed, 11);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(executor.executed().len(), 12);
        assert!(!report.success());
        let err = report.verdict().unwrap_err();
        assert_eq!(err.exit_code(), 30);
    }

    #[tokio::test]
    async fn results_keep_declaration_order() {
        let (_listener, port) = listener().await;
        let executor = Arc::new(ScriptedScenarios::new());
        let runner = IntegrationRunner::new(config(scenarios(8)), executor);
        let report = runner.run("https://localhost:8444", port).await.unwrap();
        let names: Vec<_> = report.scenarios.iter().map(|s| s.name.as_str()).collect();
        let expected: Vec<String> = (1..=8).map(|i| format!("scenario-{i:02}")).collect();
        assert_eq!(names, expected.iter().map(String::as_str).collect::<Vec<_>>());
        assert!(report.verdict().is_ok());
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_infrastructure_error() {
        let port = {
            let (listener, port) = listener().await;
            drop(listener);
            port
        };
        let executor = Arc::new(ScriptedScenarios::new());
        let runner = IntegrationRunner::new(config(scenarios(2)), executor.clone());
        let err = runner.run("https://localhost", port).await.unwrap_err();
        assert!(matches!(err, ShipgateError::Infrastructure(_)));
        assert_eq!(err.exit_code(), 31);
        assert!(executor.executed().is_empty());
    }

    #[tokio::test]
    async fn excluded_tags_are_not_run() {
        let (_listener, port) = listener().await;
        let mut declared = scenarios(3);
        declared[1].tags = vec!["@ignore".to_string()];
        let executor = Arc::new(ScriptedScenarios::new());
        let runner = IntegrationRunner::new(config(declared), executor.clone());
        let report = runner.run("https://localhost", port).await.unwrap();
        assert_eq!(report.summary.total, 2);
        assert!(!executor.executed().contains(&"scenario-02".to_string()));
    }

    #[tokio::test]
    async fn skipped_scenarios_do_not_fail_the_suite() {
        let (_listener, port) = listener().await;
        let executor = Arc::new(ScriptedScenarios::new().skipping("scenario-01"));
        let runner = IntegrationRunner::new(config(scenarios(2)), executor);
        let report = runner.run("https://localhost", port).await.unwrap();
        assert_eq!(report.summary.skipped, 1);
        assert!(report.success());
    }

    #[tokio::test]
    async fn broken_suite_is_infrastructure_error() {
        let (_listener, port) = listener().await;
        let executor = Arc::new(ScriptedScenarios::new().broken("scenario-02"));
        let runner = IntegrationRunner::new(config(scenarios(3)), executor);
        let err = runner.run("https://localhost", port).await.unwrap_err();
        assert!(matches!(err, ShipgateError::Infrastructure(_)));
    }

    #[test]
    fn report_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(REPORT_FILE);
        let report = TestReport::new(
            "https://localhost:8444",
            Utc::now(),
            5,
            vec![ScenarioResult {
                name: "login".to_string(),
                status: ScenarioStatus::Failed,
                duration_ms: 5,
                detail: Some("exit code 1".to_string()),
            }],
        );
        report.write(&path).unwrap();
        let loaded = TestReport::load(&path).unwrap();
        assert_eq!(loaded.summary.failed, 1);
        assert_eq!(loaded.failures().count(), 1);
    }
}
