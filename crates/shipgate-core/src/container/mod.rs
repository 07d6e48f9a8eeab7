//! Throwaway service container lifecycle.
//!
//! The [`ContainerManager`] owns the single container of a pipeline run:
//!
//! ```text
//! built -> starting -> ready -> running -> stopping -> stopped
//!              \__________\________\__________> failed
//! ```
//!
//! `stop` is safe to call from any state, tears down whatever exists and
//! never returns an error; cleanup failures are logged.

mod args;
mod docker;
pub mod fake;
mod readiness;
mod runtime;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::artifact::Artifact;
use crate::config::ContainerConfig;
use crate::error::{Result, ShipgateError};
use crate::obs;

pub use args::RuntimeArgs;
pub use docker::DockerCli;
pub use readiness::{wait_until_ready, ReadinessProbe};
pub use runtime::{BuildRequest, ContainerRuntime, RunRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Built,
    Starting,
    Ready,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ContainerState {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ContainerState::Starting | ContainerState::Ready | ContainerState::Running
        )
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerState::Built => "built",
            ContainerState::Starting => "starting",
            ContainerState::Ready => "ready",
            ContainerState::Running => "running",
            ContainerState::Stopping => "stopping",
            ContainerState::Stopped => "stopped",
            ContainerState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default)]
struct Slot {
    state: Option<ContainerState>,
    /// Set once a launch was attempted; what `stop` tears down.
    container: Option<String>,
}

/// Exclusive owner of the run's service container.
pub struct ContainerManager {
    runtime: Arc<dyn ContainerRuntime>,
    config: ContainerConfig,
    name: String,
    slot: Mutex<Slot>,
}

impl ContainerManager {
    /// `run_id` makes the default container name unique on the host.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: ContainerConfig,
        project: &str,
        run_id: &str,
    ) -> Self {
        let name = config.name.clone().unwrap_or_else(|| {
            let prefix: String = run_id.chars().filter(|c| *c != '-').take(8).collect();
            format!("{project}-{prefix}")
        });
        Self {
            runtime,
            config,
            name,
            slot: Mutex::new(Slot::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> Option<ContainerState> {
        self.slot().state
    }

    /// Base URL of the published port.
    pub fn endpoint(&self, scheme: &str) -> String {
        format!("{scheme}://localhost:{}", self.config.host_port)
    }

    pub fn host_port(&self) -> u16 {
        self.config.host_port
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        // A panic while holding the lock cannot leave the slot inconsistent.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, state: ContainerState) {
        self.slot().state = Some(state);
        obs::emit_container_state(&self.name, &state.to_string());
    }

    /// Build the image `image_ref` with the artifact as build context.
    pub async fn build(
        &self,
        artifact: &Artifact,
        image_ref: &str,
        dockerfile: std::path::PathBuf,
    ) -> Result<()> {
        if self.state().is_some_and(ContainerState::is_active) {
            return Err(ShipgateError::InvalidContainerState(format!(
                "cannot rebuild while '{}' is {}",
                self.name,
                self.state().map(|s| s.to_string()).unwrap_or_default()
            )));
        }
        let request = BuildRequest {
            context: artifact.dir.clone(),
            dockerfile,
            tag: image_ref.to_string(),
            platform: self.config.platform.clone(),
            pull: self.config.pull,
            no_cache: self.config.no_cache,
        };
        match self.runtime.build_image(&request).await {
            Ok(()) => {
                self.transition(ContainerState::Built);
                info!(image = %image_ref, "image built");
                Ok(())
            }
            Err(e) => {
                self.transition(ContainerState::Failed);
                Err(e)
            }
        }
    }

    /// Launch `image_ref` detached and wait for readiness.
    pub async fn start(&self, image_ref: &str) -> Result<()> {
        let probe = ReadinessProbe::from_config(&self.config)?;
        let args = RuntimeArgs::from_config(
            &self.config.runtime_args,
            self.config.host_port,
            self.config.container_port,
        )?;
        {
            let mut slot = self.slot();
            if slot.state.is_some_and(ContainerState::is_active) {
                return Err(ShipgateError::AlreadyRunning(self.name.clone()));
            }
            if slot.container.is_some() && slot.state != Some(ContainerState::Stopped) {
                return Err(ShipgateError::InvalidContainerState(format!(
                    "'{}' must be stopped before it can be started again",
                    self.name
                )));
            }
            slot.state = Some(ContainerState::Starting);
            slot.container = Some(self.name.clone());
        }
        obs::emit_container_state(&self.name, "starting");

        let request = RunRequest {
            image: image_ref.to_string(),
            name: self.name.clone(),
            host_port: self.config.host_port,
            container_port: self.config.container_port,
            env: vec![(self.config.args_env.clone(), args.render())],
        };

        if let Err(e) = self.runtime.run(&request).await {
            self.transition(ContainerState::Failed);
            return Err(e);
        }

        let waited = wait_until_ready(
            self.runtime.as_ref(),
            &self.name,
            &probe,
            Duration::from_secs(self.config.readiness.timeout_secs),
            Duration::from_millis(self.config.readiness.interval_ms),
        )
        .await;
        match waited {
            Ok(elapsed) => {
                self.transition(ContainerState::Ready);
                info!(
                    container = %self.name,
                    waited_ms = elapsed.as_millis() as u64,
                    "container ready"
                );
                self.transition(ContainerState::Running);
                Ok(())
            }
            Err(e) => {
                self.transition(ContainerState::Failed);
                Err(e)
            }
        }
    }

    /// Tear down the container if one was launched. Runs at most once per launch.
    pub async fn stop(&self) {
        let container = {
            let mut slot = self.slot();
            match (&slot.container, slot.state) {
                (None, _) => {
                    debug!(container = %self.name, "nothing to stop");
                    return;
                }
                (Some(_), Some(ContainerState::Stopped | ContainerState::Stopping)) => {
                    debug!(container = %self.name, "already stopped");
                    return;
                }
                (Some(name), _) => {
                    let name = name.clone();
                    slot.state = Some(ContainerState::Stopping);
                    name
                }
            }
        };
        obs::emit_container_state(&container, "stopping");

        if let Err(e) = self.runtime.stop(&container).await {
            obs::emit_cleanup_error(&container, &e);
        }
        if let Err(e) = self.runtime.remove(&container).await {
            obs::emit_cleanup_error(&container, &e);
        }
        self.transition(ContainerState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::fake::ScriptedRuntime;
    use super::*;
    use crate::config::{ReadinessConfig, ReadinessKind};
    use crate::version::Version;
    use shipgate_state::ContentDigest;

    fn config() -> ContainerConfig {
        ContainerConfig {
            readiness: ReadinessConfig {
                kind: ReadinessKind::Log,
                log_pattern: "(?s).*Started VaultApp.*".to_string(),
                timeout_secs: 1,
                interval_ms: 10,
                ..ReadinessConfig::default()
            },
            ..ContainerConfig::default()
        }
    }

    fn manager(runtime: Arc<ScriptedRuntime>) -> ContainerManager {
        ContainerManager::new(runtime, config(), "vault", "1a2b3c4d-0000-1111")
    }

    fn artifact() -> Artifact {
        Artifact {
            name: "vault".to_string(),
            version: Version::new(2, 0, 0),
            dir: std::path::PathBuf::from("/dist/vault-2.0.0"),
            manifest: crate::artifact::Manifest {
                name: "vault".to_string(),
                version: "2.0.0".to_string(),
                files: Vec::new(),
            },
            digest: ContentDigest::from_bytes(b"manifest"),
        }
    }

    #[tokio::test]
    async fn start_reaches_running_and_injects_args() {
        let runtime = Arc::new(ScriptedRuntime::ready_with("boot\nStarted VaultApp in 2s"));
        let mgr = manager(Arc::clone(&runtime));
        assert_eq!(mgr.name(), "vault-1a2b3c4d");

        mgr.start("vault:2.0.0").await.unwrap();
        assert_eq!(mgr.state(), Some(ContainerState::Running));
        let run = runtime.last_run().unwrap();
        assert_eq!(run.host_port, 8444);
        assert_eq!(run.env[0].0, "APP_ARGS");
        assert!(run.env[0].1.contains("--SERVICE_RELAXED_PORTS=true"));
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let runtime = Arc::new(ScriptedRuntime::ready_with("Started VaultApp"));
        let mgr = manager(runtime);
        mgr.start("vault:2.0.0").await.unwrap();
        let err = mgr.start("vault:2.0.0").await.unwrap_err();
        assert!(matches!(err, ShipgateError::AlreadyRunning(_)));
        assert_eq!(err.exit_code(), 23);
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_timeout_fails_and_stop_still_cleans_up() {
        let runtime = Arc::new(ScriptedRuntime::ready_with("still booting"));
        let mgr = manager(Arc::clone(&runtime));
        let err = mgr.start("vault:2.0.0").await.unwrap_err();
        assert!(matches!(err, ShipgateError::ReadinessTimeout { .. }));
        assert_eq!(mgr.state(), Some(ContainerState::Failed));

        mgr.stop().await;
        mgr.stop().await;
        assert_eq!(runtime.count("stop"), 1);
        assert_eq!(runtime.count("remove"), 1);
        assert_eq!(mgr.state(), Some(ContainerState::Stopped));
    }

    #[tokio::test]
    async fn rejected_launch_is_start_error() {
        let runtime = Arc::new(
            ScriptedRuntime::ready_with("Started VaultApp")
                .rejecting_run("port is already allocated"),
        );
        let mgr = manager(runtime);
        let err = mgr.start("vault:2.0.0").await.unwrap_err();
        assert!(matches!(err, ShipgateError::Start(ref m) if m.contains("already allocated")));
        assert_eq!(mgr.state(), Some(ContainerState::Failed));
    }

    #[tokio::test]
    async fn stop_errors_are_swallowed() {
        let runtime = Arc::new(ScriptedRuntime::ready_with("Started VaultApp").failing_stop());
        let mgr = manager(Arc::clone(&runtime));
        mgr.start("vault:2.0.0").await.unwrap();
        mgr.stop().await;
        assert_eq!(mgr.state(), Some(ContainerState::Stopped));
        assert_eq!(runtime.count("remove"), 1);
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let runtime = Arc::new(ScriptedRuntime::default());
        let mgr = manager(Arc::clone(&runtime));
        mgr.stop().await;
        assert!(runtime.calls().is_empty());
        assert_eq!(mgr.state(), None);
    }

    #[tokio::test]
    async fn build_failure_marks_failed() {
        let runtime = Arc::new(ScriptedRuntime::default().failing_build(2));
        let mgr = manager(runtime);
        let err = mgr
            .build(&artifact(), "vault:2.0.0", "Dockerfile".into())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 20);
        assert_eq!(mgr.state(), Some(ContainerState::Failed));
    }
}
