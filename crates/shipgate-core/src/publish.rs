//! Release publication.
//!
//! Publishing needs a [`PassedGate`], so it cannot be reached without a
//! passing release gate. A (name, version) pair is published at most once:
//! the registry is consulted before anything is uploaded and written only
//! after every destination succeeded. The package copy is staged next to its
//! final location and moved into place only once the image push succeeded,
//! so a failed attempt leaves nothing behind to block a retry.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use shipgate_state::{PublishRecord, PublishRegistry, StateError};
use tempfile::TempDir;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::artifact::Artifact;
use crate::config::{PipelineConfig, RegistryCredentials};
use crate::container::ContainerRuntime;
use crate::error::{Result, ShipgateError};
use crate::gate::PassedGate;
use crate::obs;

pub struct Publisher {
    config: Arc<PipelineConfig>,
    registry: Arc<dyn PublishRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
}

impl Publisher {
    pub fn new(
        config: Arc<PipelineConfig>,
        registry: Arc<dyn PublishRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            config,
            registry,
            runtime,
        }
    }

    /// Push `artifact` (and its image, if configured) to every destination.
    pub async fn publish(
        &self,
        _gate: &PassedGate,
        artifact: &Artifact,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<PublishRecord> {
        let name = artifact.name.clone();
        let version = artifact.version.to_string();

        if self.registry.is_published(&name, &version).await? {
            return Err(ShipgateError::AlreadyPublished { name, version });
        }

        let staged = match &self.config.publish.package_repository {
            Some(repository) => Some(stage_package(artifact, &self.config.resolve(repository))?),
            None => None,
        };

        let mut destinations = Vec::new();
        if self.config.publish.push_image {
            destinations.extend(self.push_image(artifact, credentials).await?);
        }
        let package = match staged {
            Some(staged) => Some(staged.commit()?),
            None => None,
        };
        if let Some(target) = &package {
            destinations.insert(0, target.display().to_string());
        }
        if destinations.is_empty() {
            warn!(artifact = %name, "no publish destination configured; recording release only");
        }

        let record = PublishRecord {
            name: name.clone(),
            version: version.clone(),
            artifact_digest: artifact.digest.clone(),
            destinations,
            published_at: Utc::now(),
        };
        let recorded = self.registry.record(record.clone()).await;
        if let Err(e) = recorded {
            let withdraw = !matches!(e, StateError::AlreadyPublished { .. });
            if let (Some(target), true) = (&package, withdraw) {
                // Unrecorded copies would read as published on retry.
                if let Err(cleanup) = std::fs::remove_dir_all(target) {
                    warn!(
                        target = %target.display(),
                        error = %cleanup,
                        "could not withdraw package"
                    );
                }
            }
            return Err(match e {
                StateError::AlreadyPublished { name, version } => {
                    ShipgateError::AlreadyPublished { name, version }
                }
                other => ShipgateError::Storage(other),
            });
        }

        obs::emit_publish_completed(&name, &version, record.destinations.len());
        Ok(record)
    }

    async fn push_image(
        &self,
        artifact: &Artifact,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<Vec<String>> {
        let container = &self.config.container;
        if container.push_repositories.is_empty() {
            return Err(ShipgateError::Config(
                "publish.push_image is set but container.push_repositories is empty".to_string(),
            ));
        }
        match credentials {
            Some(credentials) => {
                self.runtime
                    .login(self.config.publish.registry_host.as_deref(), credentials)
                    .await?
            }
            None => warn!("no registry credentials in environment; pushing with existing login"),
        }

        let local = self.config.image_ref(&artifact.version);
        let mut pushed = Vec::with_capacity(container.push_repositories.len());
        for repository in &container.push_repositories {
            let remote = format!("{repository}:{}", artifact.version);
            self.runtime.push(&local, &remote).await?;
            info!(image = %remote, "image pushed");
            pushed.push(remote);
        }
        Ok(pushed)
    }
}

/// A bundle copy waiting to be moved to its published location.
struct StagedPackage {
    staging: TempDir,
    target: PathBuf,
}

impl StagedPackage {
    /// Move the copy to `<repository>/<name>/<version>/`.
    fn commit(self) -> Result<PathBuf> {
        std::fs::rename(self.staging.path().join("package"), &self.target)?;
        info!(target = %self.target.display(), "package published");
        Ok(self.target)
    }
}

/// Copy the bundle into a staging directory beside its target; never
/// overwrites an existing release.
fn stage_package(artifact: &Artifact, repository: &Path) -> Result<StagedPackage> {
    let parent = repository.join(&artifact.name);
    let target = parent.join(artifact.version.to_string());
    if target.exists() {
        return Err(ShipgateError::AlreadyPublished {
            name: artifact.name.clone(),
            version: artifact.version.to_string(),
        });
    }
    std::fs::create_dir_all(&parent)?;
    let staging = tempfile::Builder::new()
        .prefix(".staging-")
        .tempdir_in(&parent)?;
    let root = staging.path().join("package");

    for entry in WalkDir::new(&artifact.dir).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(&artifact.dir)
            .map_err(|e| ShipgateError::Publish(e.to_string()))?;
        let dest = root.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(StagedPackage { staging, target })
}
