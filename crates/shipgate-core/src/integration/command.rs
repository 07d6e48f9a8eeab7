use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{ScenarioExecutor, ScenarioVerdict};
use crate::config::{IntegrationConfig, ScenarioConfig};
use crate::error::{Result, ShipgateError};

pub const ENDPOINT_ENV: &str = "SHIPGATE_ENDPOINT";
pub const SCENARIO_ENV: &str = "SHIPGATE_SCENARIO";

/// Runs the configured suite command once per scenario.
///
/// Exit 0 passes, the skip code skips, anything else or a timeout fails.
#[derive(Debug, Clone)]
pub struct CommandScenarioExecutor {
    program: String,
    args: Vec<String>,
    skip_exit_code: i32,
    timeout: Duration,
}

impl CommandScenarioExecutor {
    pub fn from_config(config: &IntegrationConfig) -> Result<Self> {
        let (program, args) = config
            .command
            .split_first()
            .ok_or_else(|| ShipgateError::Config("integration.command is empty".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            skip_exit_code: config.skip_exit_code,
            timeout: Duration::from_secs(config.scenario_timeout_secs),
        })
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim_end().lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[async_trait]
impl ScenarioExecutor for CommandScenarioExecutor {
    async fn execute(&self, scenario: &ScenarioConfig, endpoint: &str) -> Result<ScenarioVerdict> {
        debug!(scenario = %scenario.name, program = %self.program, "starting scenario");
        let child = Command::new(&self.program)
            .args(&self.args)
            .env(ENDPOINT_ENV, endpoint)
            .env(SCENARIO_ENV, &scenario.name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ShipgateError::Infrastructure(format!("cannot launch {}: {e}", self.program))
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Ok(ScenarioVerdict::failed(format!(
                    "timed out after {:?}",
                    self.timeout
                )))
            }
        };

        match output.status.code() {
            Some(0) => Ok(ScenarioVerdict::passed()),
            Some(code) if code == self.skip_exit_code => Ok(ScenarioVerdict::skipped()),
            code => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                Ok(ScenarioVerdict::failed(format!(
                    "exit code {code}: {}",
                    tail(&stderr, 20)
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration::ScenarioStatus;

    fn executor(script: &str) -> CommandScenarioExecutor {
        CommandScenarioExecutor::from_config(&IntegrationConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            scenario_timeout_secs: 5,
            ..IntegrationConfig::default()
        })
        .unwrap()
    }

    fn scenario() -> ScenarioConfig {
        ScenarioConfig {
            name: "create-secret".to_string(),
            tags: Vec::new(),
        }
    }

    #[tokio::test]
    async fn exit_codes_map_to_status() {
        let endpoint = "https://localhost:8444";
        let script = format!(
            "test \"${ENDPOINT_ENV}\" = {endpoint} && test \"${SCENARIO_ENV}\" = create-secret"
        );
        let passed = executor(&script).execute(&scenario(), endpoint).await.unwrap();
        assert_eq!(passed.status, ScenarioStatus::Passed);

        let skipped = executor("exit 77").execute(&scenario(), endpoint).await.unwrap();
        assert_eq!(skipped.status, ScenarioStatus::Skipped);

        let failed = executor("echo boom >&2; exit 3")
            .execute(&scenario(), endpoint)
            .await
            .unwrap();
        assert_eq!(failed.status, ScenarioStatus::Failed);
        assert_eq!(failed.detail.as_deref(), Some("exit code 3: boom"));
    }

    #[test]
    fn empty_command_is_config_error() {
        let err = CommandScenarioExecutor::from_config(&IntegrationConfig::default()).unwrap_err();
        assert_eq!(err.exit_code(), 60);
    }
}
