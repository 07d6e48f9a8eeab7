//! Error taxonomy for the release pipeline.
//!
//! Fatal errors stop the run with a distinct exit code. Individual scenario
//! and gate failures are not errors here: they are recorded in the test
//! report and release gate and surface once, at the end, as
//! [`ShipgateError::IntegrationTestsFailed`] or [`ShipgateError::GateFailed`].

use shipgate_state::StateError;

/// Pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum ShipgateError {
    #[error("cyclic task dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("task '{task}' references unknown task '{missing}'")]
    UnknownTask { task: String, missing: String },

    #[error("duplicate task name: {0}")]
    DuplicateTask(String),

    #[error("version resolution failed: {0}")]
    VersionResolution(String),

    #[error("assembly failed: {0}")]
    Assembly(String),

    #[error("image build failed (exit code {exit_code}): {detail}")]
    ImageBuild { exit_code: i32, detail: String },

    #[error("container start rejected: {0}")]
    Start(String),

    #[error("container '{container}' not ready after {waited_ms} ms")]
    ReadinessTimeout { container: String, waited_ms: u64 },

    #[error("container '{0}' is already running")]
    AlreadyRunning(String),

    #[error("invalid container transition: {0}")]
    InvalidContainerState(String),

    #[error("integration infrastructure error: {0}")]
    Infrastructure(String),

    #[error("integration tests failed: {failed} of {total} scenario(s) failed")]
    IntegrationTestsFailed { failed: usize, total: usize },

    #[error("release gate failed: {}", failed.join(", "))]
    GateFailed { failed: Vec<String> },

    #[error("SBOM missing or not attached to artifact: {0}")]
    MissingSbom(String),

    #[error("{name} {version} has already been published")]
    AlreadyPublished { name: String, version: String },

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] StateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShipgateError {
    /// Process exit code used by the CLI for scripting.
    pub fn exit_code(&self) -> u8 {
        match self {
            ShipgateError::CyclicDependency { .. }
            | ShipgateError::UnknownTask { .. }
            | ShipgateError::DuplicateTask(_) => 10,
            ShipgateError::VersionResolution(_) => 11,
            ShipgateError::Assembly(_) => 12,
            ShipgateError::ImageBuild { .. } => 20,
            ShipgateError::Start(_) | ShipgateError::InvalidContainerState(_) => 21,
            ShipgateError::ReadinessTimeout { .. } => 22,
            ShipgateError::AlreadyRunning(_) => 23,
            ShipgateError::IntegrationTestsFailed { .. } => 30,
            ShipgateError::Infrastructure(_) => 31,
            ShipgateError::GateFailed { .. } => 40,
            ShipgateError::MissingSbom(_) => 41,
            ShipgateError::AlreadyPublished { .. } => 50,
            ShipgateError::Config(_) => 60,
            ShipgateError::Storage(StateError::AlreadyPublished { .. }) => 50,
            ShipgateError::Publish(_)
            | ShipgateError::Storage(_)
            | ShipgateError::Serialization(_)
            | ShipgateError::Io(_) => 1,
        }
    }

    /// Exit code for an arbitrary task error, falling back to 1.
    pub fn exit_code_of(err: &anyhow::Error) -> u8 {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<ShipgateError>())
            .map(ShipgateError::exit_code)
            .unwrap_or(1)
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, ShipgateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_names_the_path() {
        let err = ShipgateError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "cyclic task dependency: a -> b -> a");
    }

    #[test]
    fn distinct_exit_codes_for_scripted_failures() {
        let codes = [
            ShipgateError::ImageBuild {
                exit_code: 1,
                detail: String::new(),
            }
            .exit_code(),
            ShipgateError::ReadinessTimeout {
                container: "c".into(),
                waited_ms: 10,
            }
            .exit_code(),
            ShipgateError::GateFailed { failed: vec![] }.exit_code(),
            ShipgateError::AlreadyPublished {
                name: "n".into(),
                version: "1.0.0".into(),
            }
            .exit_code(),
        ];
        let unique: std::collections::HashSet<u8> = codes.iter().copied().collect();
        assert_eq!(unique.len(), codes.len());
        assert!(codes.iter().all(|c| *c != 0));
    }

    #[test]
    fn exit_code_found_through_anyhow_context() {
        let err = anyhow::Error::new(ShipgateError::MissingSbom("bom.json".into()))
            .context("evaluate-gates");
        assert_eq!(ShipgateError::exit_code_of(&err), 41);
        assert_eq!(ShipgateError::exit_code_of(&anyhow::anyhow!("other")), 1);
    }

    #[test]
    fn registry_conflict_maps_to_already_published_code() {
        let err = ShipgateError::from(StateError::AlreadyPublished {
            name: "svc".into(),
            version: "1.0.0".into(),
        });
        assert_eq!(err.exit_code(), 50);
    }
}
