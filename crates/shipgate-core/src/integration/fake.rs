//! Scripted [`ScenarioExecutor`] for tests.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ScenarioExecutor, ScenarioVerdict};
use crate::config::ScenarioConfig;
use crate::error::{Result, ShipgateError};

/// Passes every scenario unless told otherwise; records what ran.
#[derive(Debug, Default)]
pub struct ScriptedScenarios {
    failing: HashSet<String>,
    skipping: HashSet<String>,
    broken: HashSet<String>,
    executed: Mutex<Vec<String>>,
}

impl ScriptedScenarios {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, scenario: &str) -> Self {
        self.failing.insert(scenario.to_string());
        self
    }

    pub fn skipping(mut self, scenario: &str) -> Self {
        self.skipping.insert(scenario.to_string());
        self
    }

    /// The executor itself errors on `scenario`.
    pub fn broken(mut self, scenario: &str) -> Self {
        self.broken.insert(scenario.to_string());
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ScenarioExecutor for ScriptedScenarios {
    async fn execute(&self, scenario: &ScenarioConfig, _endpoint: &str) -> Result<ScenarioVerdict> {
        if let Ok(mut executed) = self.executed.lock() {
            executed.push(scenario.name.clone());
        }
        tokio::task::yield_now().await;
        if self.broken.contains(&scenario.name) {
            return Err(ShipgateError::Infrastructure(format!(
                "suite could not run {}",
                scenario.name
            )));
        }
        if self.failing.contains(&scenario.name) {
            return Ok(ScenarioVerdict::failed("scripted failure"));
        }
        if self.skipping.contains(&scenario.name) {
            return Ok(ScenarioVerdict::skipped());
        }
        Ok(ScenarioVerdict::passed())
    }
}
