//! [`ContainerRuntime`] backed by the `docker` command line.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::runtime::{BuildRequest, ContainerRuntime, RunRequest};
use crate::config::RegistryCredentials;
use crate::error::{Result, ShipgateError};

struct CommandOutput {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

impl CommandOutput {
    fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn detail(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

pub struct DockerCli {
    binary: String,
    /// Applies to every call except `build_image`, which can be slow.
    timeout: Duration,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            ..Self::default()
        }
    }

    async fn exec(
        &self,
        args: &[String],
        stdin: Option<&str>,
        limit: Option<Duration>,
    ) -> Result<CommandOutput> {
        debug!(binary = %self.binary, args = ?args, "docker");
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            drop(pipe);
        }

        let output = match limit {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| {
                    std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("{} {} timed out after {limit:?}", self.binary, args.join(" ")),
                    )
                })??,
            None => child.wait_with_output().await?,
        };

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn checked(&self, args: &[String]) -> Result<CommandOutput> {
        let out = self.exec(args, None, Some(self.timeout)).await?;
        if !out.success() {
            return Err(ShipgateError::Io(std::io::Error::other(format!(
                "{} {} exited with {}: {}",
                self.binary,
                args.join(" "),
                out.exit_code,
                out.detail()
            ))));
        }
        Ok(out)
    }
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

pub(crate) fn build_args(request: &BuildRequest) -> Vec<String> {
    let mut args = owned(&["build", "--tag", request.tag.as_str()]);
    args.push("--file".to_string());
    args.push(request.dockerfile.to_string_lossy().to_string());
    if request.pull {
        args.push("--pull".to_string());
    }
    if request.no_cache {
        args.push("--no-cache".to_string());
    }
    if let Some(platform) = &request.platform {
        args.push("--platform".to_string());
        args.push(platform.clone());
    }
    args.push(request.context.to_string_lossy().to_string());
    args
}

pub(crate) fn run_args(request: &RunRequest) -> Vec<String> {
    let mut args = owned(&["run", "--detach", "--name", request.name.as_str()]);
    args.push("--publish".to_string());
    args.push(format!("{}:{}", request.host_port, request.container_port));
    for (key, value) in &request.env {
        args.push("--env".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(request.image.clone());
    args
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn build_image(&self, request: &BuildRequest) -> Result<()> {
        let out = self
            .exec(&build_args(request), None, None)
            .await
            .map_err(|e| ShipgateError::ImageBuild {
                exit_code: -1,
                detail: e.to_string(),
            })?;
        if !out.success() {
            return Err(ShipgateError::ImageBuild {
                exit_code: out.exit_code,
                detail: out.detail(),
            });
        }
        Ok(())
    }

    async fn run(&self, request: &RunRequest) -> Result<String> {
        let out = self
            .exec(&run_args(request), None, Some(self.timeout))
            .await
            .map_err(|e| ShipgateError::Start(e.to_string()))?;
        if !out.success() {
            return Err(ShipgateError::Start(out.detail()));
        }
        Ok(out.stdout.trim().to_string())
    }

    async fn logs(&self, container: &str) -> Result<String> {
        let out = self.checked(&owned(&["logs", container])).await?;
        Ok(format!("{}{}", out.stdout, out.stderr))
    }

    async fn is_running(&self, container: &str) -> Result<bool> {
        let args = owned(&["inspect", "--format", "{{.State.Running}}", container]);
        let out = self.exec(&args, None, Some(self.timeout)).await?;
        Ok(out.success() && out.stdout.trim() == "true")
    }

    async fn stop(&self, container: &str) -> Result<()> {
        self.checked(&owned(&["stop", container])).await.map(|_| ())
    }

    async fn remove(&self, container: &str) -> Result<()> {
        self.checked(&owned(&["rm", "--force", container]))
            .await
            .map(|_| ())
    }

    async fn push(&self, local: &str, remote: &str) -> Result<()> {
        if local != remote {
            self.checked(&owned(&["tag", local, remote])).await?;
        }
        let out = self.exec(&owned(&["push", remote]), None, None).await?;
        if !out.success() {
            return Err(ShipgateError::Publish(format!(
                "push {remote} failed: {}",
                out.detail()
            )));
        }
        Ok(())
    }

    async fn login(&self, registry: Option<&str>, credentials: &RegistryCredentials) -> Result<()> {
        let mut args = owned(&[
            "login",
            "--username",
            credentials.username.as_str(),
            "--password-stdin",
        ]);
        if let Some(registry) = registry {
            args.push(registry.to_string());
        }
        let out = self
            .exec(&args, Some(&credentials.password), Some(self.timeout))
            .await?;
        if !out.success() {
            return Err(ShipgateError::Publish(format!(
                "registry login failed: {}",
                out.detail()
            )));
        }
        Ok(())
    }
}
