//! Scripted in-memory [`ContainerRuntime`] for tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::runtime::{BuildRequest, ContainerRuntime, RunRequest};
use crate::config::RegistryCredentials;
use crate::error::{Result, ShipgateError};

/// Records every call; behaviour is configured up front.
#[derive(Debug, Default)]
pub struct ScriptedRuntime {
    build_exit_code: Option<i32>,
    reject_run: Option<String>,
    logs: Mutex<String>,
    running: AtomicBool,
    stop_fails: bool,
    calls: Mutex<Vec<String>>,
    last_run: Mutex<Option<RunRequest>>,
}

impl ScriptedRuntime {
    /// A runtime whose containers log `ready_line` as soon as they start.
    pub fn ready_with(ready_line: &str) -> Self {
        Self {
            logs: Mutex::new(ready_line.to_string()),
            ..Self::default()
        }
    }

    pub fn failing_build(mut self, exit_code: i32) -> Self {
        self.build_exit_code = Some(exit_code);
        self
    }

    pub fn rejecting_run(mut self, reason: &str) -> Self {
        self.reject_run = Some(reason.to_string());
        self
    }

    pub fn failing_stop(mut self) -> Self {
        self.stop_fails = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of recorded calls whose name starts with `op`.
    pub fn count(&self, op: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(op)).count()
    }

    pub fn last_run(&self) -> Option<RunRequest> {
        self.last_run.lock().ok().and_then(|r| r.clone())
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn build_image(&self, request: &BuildRequest) -> Result<()> {
        self.record(format!("build {}", request.tag));
        match self.build_exit_code {
            Some(exit_code) => Err(ShipgateError::ImageBuild {
                exit_code,
                detail: "scripted build failure".to_string(),
            }),
            None => Ok(()),
        }
    }

    async fn run(&self, request: &RunRequest) -> Result<String> {
        self.record(format!("run {}", request.name));
        if let Some(reason) = &self.reject_run {
            return Err(ShipgateError::Start(reason.clone()));
        }
        if let Ok(mut last) = self.last_run.lock() {
            *last = Some(request.clone());
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(format!("id-{}", request.name))
    }

    async fn logs(&self, container: &str) -> Result<String> {
        self.record(format!("logs {container}"));
        Ok(self.logs.lock().map(|l| l.clone()).unwrap_or_default())
    }

    async fn is_running(&self, _container: &str) -> Result<bool> {
        Ok(self.running.load(Ordering::SeqCst))
    }

    async fn stop(&self, container: &str) -> Result<()> {
        self.record(format!("stop {container}"));
        self.running.store(false, Ordering::SeqCst);
        if self.stop_fails {
            return Err(ShipgateError::Io(std::io::Error::other("scripted stop failure")));
        }
        Ok(())
    }

    async fn remove(&self, container: &str) -> Result<()> {
        self.record(format!("remove {container}"));
        Ok(())
    }

    async fn push(&self, local: &str, remote: &str) -> Result<()> {
        self.record(format!("push {local} {remote}"));
        Ok(())
    }

    async fn login(&self, registry: Option<&str>, credentials: &RegistryCredentials) -> Result<()> {
        self.record(format!(
            "login {} {}",
            registry.unwrap_or("default"),
            credentials.username
        ));
        Ok(())
    }
}
