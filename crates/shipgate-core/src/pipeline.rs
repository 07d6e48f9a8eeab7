//! The release pipeline: a fixed, statically declared task registry wired
//! to the stage services.
//!
//! ```text
//! clean
//! resolve-version -> generate-sbom ---\
//!                 \-> license-report --> assemble -> build-image -> start-container
//!                                          |                            |
//!                                          |                     test-integration
//!                                          |                            :  (finalized by stop-container)
//!                                          \-> evaluate-gates ----> publish
//! ```
//!
//! The version is resolved once, when the [`Pipeline`] is created, and is
//! read-only afterwards. Stage results that later tasks consume (artifact,
//! test report, release gate) live in write-once cells; a stage skipped as
//! up-to-date is reloaded from its on-disk output instead.

use std::sync::{Arc, OnceLock};

use anyhow::Context as _;
use shipgate_state::{
    FingerprintStore, FsFingerprintStore, FsPublishRegistry, FsVersionStore, PublishRecord,
    PublishRegistry, VersionStore,
};
use tracing::{info, warn};

use crate::artifact::{Artifact, ArtifactAssembler, AssemblyInputs};
use crate::config::{PipelineConfig, RegistryCredentials};
use crate::container::{ContainerManager, ContainerRuntime, DockerCli};
use crate::error::{Result, ShipgateError};
use crate::gate::{self, LicenseAllowList, QualityGateEvaluator, ReleaseGate};
use crate::graph::{ExecutionReport, TaskExecutor, TaskGraph, TaskInput, TaskSpec};
use crate::integration::{
    self, CommandScenarioExecutor, IntegrationRunner, ScenarioExecutor, TestReport,
};
use crate::publish::Publisher;
use crate::sbom::{DependencyInventory, LicenseReport, Sbom};
use crate::version::{GitTagSource, ResolvedVersion, TagSource, Version, VersioningService};

/// Task names of the release pipeline.
pub mod tasks {
    pub const CLEAN: &str = "clean";
    pub const RESOLVE_VERSION: &str = "resolve-version";
    pub const GENERATE_SBOM: &str = "generate-sbom";
    pub const LICENSE_REPORT: &str = "license-report";
    pub const ASSEMBLE: &str = "assemble";
    pub const BUILD_IMAGE: &str = "build-image";
    pub const START_CONTAINER: &str = "start-container";
    pub const TEST_INTEGRATION: &str = "test-integration";
    pub const STOP_CONTAINER: &str = "stop-container";
    pub const EVALUATE_GATES: &str = "evaluate-gates";
    pub const PUBLISH: &str = "publish";
}

pub const SBOM_REPORT: &str = "bom.json";
pub const LICENSE_REPORT_FILE: &str = "licenses.json";

/// External collaborators of a pipeline run.
pub struct PipelineServices {
    pub runtime: Arc<dyn ContainerRuntime>,
    /// `None` when no integration command is configured.
    pub scenarios: Option<Arc<dyn ScenarioExecutor>>,
    pub tags: Arc<dyn TagSource>,
    pub versions: Arc<dyn VersionStore>,
    pub fingerprints: Arc<dyn FingerprintStore>,
    pub registry: Arc<dyn PublishRegistry>,
    pub credentials: Option<RegistryCredentials>,
}

impl PipelineServices {
    /// Docker, git, the configured suite command and file-backed state.
    pub fn production(config: &PipelineConfig) -> Result<Self> {
        let scenarios: Option<Arc<dyn ScenarioExecutor>> = if config.integration.command.is_empty()
        {
            None
        } else {
            Some(Arc::new(CommandScenarioExecutor::from_config(&config.integration)?))
        };
        Ok(Self {
            runtime: Arc::new(DockerCli::default()),
            scenarios,
            tags: Arc::new(GitTagSource::new(config.resolve(&config.version.repo_dir))),
            versions: Arc::new(FsVersionStore::new(config.resolve(&config.paths.version_file))),
            fingerprints: Arc::new(FsFingerprintStore::new(
                config.resolve(&config.paths.state_dir),
            )),
            registry: Arc::new(FsPublishRegistry::new(
                config.resolve(&config.publish.registry_dir),
            )),
            credentials: RegistryCredentials::from_env(),
        })
    }
}

/// Shared state of one run, captured by every task action.
struct RunContext {
    config: Arc<PipelineConfig>,
    services: PipelineServices,
    resolved: ResolvedVersion,
    version: Version,
    container: ContainerManager,
    artifact: OnceLock<Artifact>,
    test_report: OnceLock<TestReport>,
    gate: OnceLock<ReleaseGate>,
    published: OnceLock<PublishRecord>,
}

impl RunContext {
    fn image_ref(&self) -> String {
        self.config.image_ref(&self.version)
    }

    /// The assembled artifact of this run, or the one already on disk.
    fn artifact(&self) -> Result<Artifact> {
        if let Some(artifact) = self.artifact.get() {
            return Ok(artifact.clone());
        }
        let artifact = Artifact::open(&Artifact::dir_for(&self.config, &self.version))?;
        if artifact.version != self.version {
            return Err(ShipgateError::Assembly(format!(
                "assembled artifact is {}, expected {}",
                artifact.version, self.version
            )));
        }
        let _ = self.artifact.set(artifact.clone());
        Ok(artifact)
    }

    fn test_report_path(&self) -> std::path::PathBuf {
        self.config.report_path(integration::REPORT_FILE)
    }

    fn inventory(&self) -> Result<DependencyInventory> {
        DependencyInventory::load(&self.config.resolve(&self.config.paths.dependency_inventory))
    }

    fn clean(&self) -> anyhow::Result<()> {
        for dir in [&self.config.paths.dist_dir, &self.config.paths.reports_dir] {
            let dir = self.config.resolve(dir);
            if dir.exists() {
                std::fs::remove_dir_all(&dir)
                    .with_context(|| format!("removing {}", dir.display()))?;
            }
        }
        Ok(())
    }

    fn persist_version(&self) -> anyhow::Result<()> {
        VersioningService::new(
            &self.config.version,
            self.services.tags.as_ref(),
            self.services.versions.as_ref(),
        )
        .persist(&self.resolved)?;
        Ok(())
    }

    fn generate_sbom(&self) -> anyhow::Result<()> {
        let config = &self.config;
        let inventory = self.inventory()?;
        let license_path = config.resolve(&config.project.license_file);
        let license_text = std::fs::read_to_string(&license_path).map_err(|e| {
            ShipgateError::Assembly(format!(
                "project license {} unreadable: {e}",
                license_path.display()
            ))
        })?;
        let sbom = Sbom::generate(&config.project, &self.version, &license_text, &inventory)?;
        sbom.write(&config.report_path(SBOM_REPORT))?;
        info!(components = sbom.components.len(), "SBOM generated");
        Ok(())
    }

    fn license_report(&self) -> anyhow::Result<()> {
        let config = &self.config;
        let inventory = self.inventory()?;
        let allow_list =
            LicenseAllowList::load(&config.resolve(&config.paths.license_allow_list))?;
        let report = LicenseReport::build(&inventory, &allow_list);
        let disallowed = report.disallowed().count();
        if disallowed > 0 {
            warn!(disallowed, "dependencies outside the license allow-list");
        }
        report.write(&config.report_path(LICENSE_REPORT_FILE))?;
        Ok(())
    }

    fn assemble(&self) -> anyhow::Result<()> {
        let inputs = AssemblyInputs::from_config(&self.config);
        let artifact = ArtifactAssembler::new(&self.config).assemble(&inputs, &self.version)?;
        let _ = self.artifact.set(artifact);
        Ok(())
    }

    async fn build_image(&self) -> anyhow::Result<()> {
        let artifact = self.artifact()?;
        let dockerfile = self.config.resolve(&self.config.container.dockerfile);
        self.container
            .build(&artifact, &self.image_ref(), dockerfile)
            .await?;
        Ok(())
    }

    async fn start_container(&self) -> anyhow::Result<()> {
        self.container.start(&self.image_ref()).await?;
        Ok(())
    }

    async fn test_integration(&self) -> anyhow::Result<()> {
        let executor = match &self.services.scenarios {
            Some(executor) => Arc::clone(executor),
            None if self.config.integration.scenarios.is_empty() => {
                info!("no integration scenarios declared");
                return Ok(());
            }
            None => {
                return Err(ShipgateError::Config(
                    "integration scenarios declared without a command".to_string(),
                )
                .into())
            }
        };
        let artifact = self.artifact()?;
        let runner = IntegrationRunner::new(self.config.integration.clone(), executor);
        let endpoint = self.container.endpoint(&self.config.integration.scheme);
        let report = runner
            .run(&endpoint, self.container.host_port())
            .await?
            .for_artifact(&artifact);
        report.write(&self.test_report_path())?;
        let verdict = report.verdict();
        let _ = self.test_report.set(report);
        verdict?;
        Ok(())
    }

    async fn stop_container(&self) -> anyhow::Result<()> {
        self.container.stop().await;
        Ok(())
    }

    fn evaluate_gates(&self) -> anyhow::Result<()> {
        let artifact = self.artifact()?;
        let gate = QualityGateEvaluator::new(&self.config.gates)
            .evaluate_files(&self.config, &artifact)?;
        gate::write_reports(&gate, &self.config.resolve(&self.config.paths.reports_dir))?;
        let verdict = gate.require_passed().map(|_| ());
        if self.gate.set(gate).is_err() {
            anyhow::bail!("release gate already evaluated in this run");
        }
        verdict?;
        Ok(())
    }

    /// Scenarios must have passed against `artifact`, in this run or in an
    /// earlier invocation.
    fn require_integration_passed(&self, artifact: &Artifact) -> Result<()> {
        if self.config.integration.scenarios.is_empty() {
            return Ok(());
        }
        let loaded;
        let report = match self.test_report.get() {
            Some(report) => report,
            None => {
                let path = self.test_report_path();
                loaded = TestReport::load(&path).map_err(|_| {
                    ShipgateError::Publish(format!(
                        "no integration test report at {}; run test-integration first",
                        path.display()
                    ))
                })?;
                &loaded
            }
        };
        report.covers(artifact)?;
        report.verdict()
    }

    async fn publish(&self) -> anyhow::Result<()> {
        let gate = self
            .gate
            .get()
            .ok_or_else(|| ShipgateError::Publish("release gate not evaluated".to_string()))?;
        let passed = gate.require_passed()?;
        let artifact = self.artifact()?;
        self.require_integration_passed(&artifact)?;

        let publisher = Publisher::new(
            Arc::clone(&self.config),
            Arc::clone(&self.services.registry),
            Arc::clone(&self.services.runtime),
        );
        let record = publisher
            .publish(&passed, &artifact, self.services.credentials.as_ref())
            .await?;
        let _ = self.published.set(record);

        if self.config.version.create_tag && !self.resolved.already_tagged {
            let tags = Arc::clone(&self.services.tags);
            let tag = self.version.tag(&self.config.version.tag_prefix);
            let message = format!("Release {}", self.version);
            tokio::task::spawn_blocking(move || tags.create_tag(&tag, &message))
                .await
                .context("tagging task panicked")??;
        }
        Ok(())
    }
}

/// Wrap a context method as a task action.
macro_rules! action {
    ($ctx:expr, sync $method:ident) => {{
        let ctx: Arc<RunContext> = Arc::clone($ctx);
        move || {
            let ctx = Arc::clone(&ctx);
            async move { ctx.$method() }
        }
    }};
    ($ctx:expr, async $method:ident) => {{
        let ctx: Arc<RunContext> = Arc::clone($ctx);
        move || {
            let ctx = Arc::clone(&ctx);
            async move { ctx.$method().await }
        }
    }};
}

/// One configured pipeline run.
pub struct Pipeline {
    ctx: Arc<RunContext>,
    run_id: String,
    graph: TaskGraph,
}

impl Pipeline {
    /// Resolve the run's version and declare the task graph.
    pub fn new(config: Arc<PipelineConfig>, services: PipelineServices) -> Result<Self> {
        let resolved = VersioningService::new(
            &config.version,
            services.tags.as_ref(),
            services.versions.as_ref(),
        )
        .compute()?;
        let run_id = uuid::Uuid::new_v4().to_string();
        let container = ContainerManager::new(
            Arc::clone(&services.runtime),
            config.container.clone(),
            &config.project.name,
            &run_id,
        );
        let ctx = Arc::new(RunContext {
            config,
            services,
            version: resolved.version,
            resolved,
            container,
            artifact: OnceLock::new(),
            test_report: OnceLock::new(),
            gate: OnceLock::new(),
            published: OnceLock::new(),
        });
        let graph = declare(&ctx)?;
        Ok(Self {
            ctx,
            run_id,
            graph,
        })
    }

    pub fn version(&self) -> &ResolvedVersion {
        &self.ctx.resolved
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.ctx.config
    }

    /// Run `targets` and everything they need. `force` ignores fingerprints.
    pub async fn execute(&self, targets: &[&str], force: bool) -> Result<ExecutionReport> {
        let executor = TaskExecutor::new(
            Arc::clone(&self.ctx.services.fingerprints),
            self.ctx.config.executor.max_parallel,
        )
        .with_force(force)
        .with_run_id(self.run_id.clone());
        executor.execute(&self.graph, targets).await
    }

    pub fn artifact(&self) -> Option<&Artifact> {
        self.ctx.artifact.get()
    }

    pub fn test_report(&self) -> Option<&TestReport> {
        self.ctx.test_report.get()
    }

    pub fn release_gate(&self) -> Option<&ReleaseGate> {
        self.ctx.gate.get()
    }

    pub fn published(&self) -> Option<&PublishRecord> {
        self.ctx.published.get()
    }
}

fn declare(ctx: &Arc<RunContext>) -> Result<TaskGraph> {
    let config = &ctx.config;
    let inventory = config.resolve(&config.paths.dependency_inventory);
    let license_file = config.resolve(&config.project.license_file);
    let sbom = config.report_path(SBOM_REPORT);
    let license_report = config.report_path(LICENSE_REPORT_FILE);
    let version = TaskInput::value("version", ctx.version);

    TaskGraph::builder()
        .task(TaskSpec::new(tasks::CLEAN, action!(ctx, sync clean)))
        .task(
            TaskSpec::new(tasks::RESOLVE_VERSION, action!(ctx, sync persist_version))
                .must_run_after(tasks::CLEAN),
        )
        .task(
            TaskSpec::new(tasks::GENERATE_SBOM, action!(ctx, sync generate_sbom))
                .depends_on(tasks::RESOLVE_VERSION)
                .must_run_after(tasks::CLEAN)
                .input(TaskInput::file(&inventory))
                .input(TaskInput::file(&license_file))
                .input(version.clone())
                .input(TaskInput::value("project", &config.project.name))
                .output(&sbom),
        )
        .task(
            TaskSpec::new(tasks::LICENSE_REPORT, action!(ctx, sync license_report))
                .depends_on(tasks::RESOLVE_VERSION)
                .must_run_after(tasks::CLEAN)
                .input(TaskInput::file(&inventory))
                .input(TaskInput::file(config.resolve(&config.paths.license_allow_list)))
                .output(&license_report),
        )
        .task(
            TaskSpec::new(tasks::ASSEMBLE, action!(ctx, sync assemble))
                .depends_on(tasks::GENERATE_SBOM)
                .depends_on(tasks::LICENSE_REPORT)
                .must_run_after(tasks::CLEAN)
                .input(TaskInput::file(config.resolve(&config.paths.compiled_output)))
                .input(TaskInput::file(&sbom))
                .input(TaskInput::file(&license_report))
                .input(TaskInput::file(&license_file))
                .input(version)
                .output(Artifact::dir_for(config, &ctx.version)),
        )
        .task(
            TaskSpec::new(tasks::BUILD_IMAGE, action!(ctx, async build_image))
                .depends_on(tasks::ASSEMBLE),
        )
        .task(
            TaskSpec::new(tasks::START_CONTAINER, action!(ctx, async start_container))
                .depends_on(tasks::BUILD_IMAGE)
                .finalized_by(tasks::STOP_CONTAINER),
        )
        .task(
            TaskSpec::new(tasks::TEST_INTEGRATION, action!(ctx, async test_integration))
                .depends_on(tasks::START_CONTAINER)
                .finalized_by(tasks::STOP_CONTAINER),
        )
        .task(TaskSpec::new(tasks::STOP_CONTAINER, action!(ctx, async stop_container)))
        .task(
            TaskSpec::new(tasks::EVALUATE_GATES, action!(ctx, sync evaluate_gates))
                .depends_on(tasks::ASSEMBLE),
        )
        .task(
            TaskSpec::new(tasks::PUBLISH, action!(ctx, async publish))
                .depends_on(tasks::EVALUATE_GATES)
                .must_run_after(tasks::TEST_INTEGRATION),
        )
        .build()
}
