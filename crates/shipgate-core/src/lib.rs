//! shipgate core library
//!
//! Build/release orchestration: a task graph executor runs a fixed set of
//! stages (versioning, artifact assembly, container lifecycle, integration
//! tests, quality gates, publishing) with guaranteed cleanup and a single
//! aggregated release decision.

pub mod artifact;
pub mod config;
pub mod container;
pub mod error;
pub mod gate;
pub mod graph;
pub mod integration;
pub mod obs;
pub mod pipeline;
pub mod publish;
pub mod reporting;
pub mod sbom;
pub mod telemetry;
pub mod version;

pub use artifact::{Artifact, ArtifactAssembler, AssemblyInputs, Manifest, ManifestEntry};
pub use config::{PipelineConfig, RegistryCredentials, DEFAULT_CONFIG_FILE};
pub use container::{
    ContainerManager, ContainerRuntime, ContainerState, DockerCli, ReadinessProbe, RuntimeArgs,
};
pub use error::{Result, ShipgateError};
pub use gate::{GateName, GateResult, PassedGate, QualityGateEvaluator, ReleaseGate};
pub use graph::{
    ExecutionPlan, ExecutionReport, TaskExecutor, TaskGraph, TaskInput, TaskOutcome, TaskSpec,
};
pub use integration::{
    CommandScenarioExecutor, IntegrationRunner, ScenarioExecutor, ScenarioResult, ScenarioStatus,
    TestReport, TestedArtifact,
};
pub use pipeline::{tasks, Pipeline, PipelineServices};
pub use publish::Publisher;
pub use reporting::{render_run_summary_md, write_run_summary_json, RunSummaryArtifact};
pub use sbom::{Dependency, DependencyInventory, LicenseReport, Sbom};
pub use telemetry::init_tracing;
pub use version::{BumpKind, GitTagSource, ResolvedVersion, TagSource, Version, VersioningService};
