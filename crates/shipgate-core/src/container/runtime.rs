use std::path::PathBuf;

use async_trait::async_trait;

use crate::config::RegistryCredentials;
use crate::error::Result;

/// Image build parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Build context; the assembled artifact directory.
    pub context: PathBuf,
    pub dockerfile: PathBuf,
    /// Full reference, `<image>:<version>`.
    pub tag: String,
    pub platform: Option<String>,
    pub pull: bool,
    pub no_cache: bool,
}

/// Detached container launch parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub image: String,
    pub name: String,
    pub host_port: u16,
    pub container_port: u16,
    pub env: Vec<(String, String)>,
}

/// The container engine boundary.
///
/// Implementations report failures with the pipeline's typed errors:
/// `ImageBuild` from `build_image` and `Start` from `run`.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn build_image(&self, request: &BuildRequest) -> Result<()>;

    /// Start detached; returns the container id.
    async fn run(&self, request: &RunRequest) -> Result<String>;

    /// Combined stdout and stderr of the container so far.
    async fn logs(&self, container: &str) -> Result<String>;

    async fn is_running(&self, container: &str) -> Result<bool>;

    async fn stop(&self, container: &str) -> Result<()>;

    async fn remove(&self, container: &str) -> Result<()>;

    /// Tag `local` as `remote` and push it.
    async fn push(&self, local: &str, remote: &str) -> Result<()>;

    async fn login(&self, registry: Option<&str>, credentials: &RegistryCredentials) -> Result<()>;
}
