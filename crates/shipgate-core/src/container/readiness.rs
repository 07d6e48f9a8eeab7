use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;
use tracing::debug;

use super::runtime::ContainerRuntime;
use crate::config::{ContainerConfig, ReadinessKind};
use crate::error::{Result, ShipgateError};

/// Liveness signal polled after start.
pub enum ReadinessProbe {
    /// Container logs match the pattern.
    Log(Regex),
    /// Endpoint answers with 2xx, 3xx or 401.
    Http { url: String, client: reqwest::Client },
}

impl ReadinessProbe {
    pub fn from_config(config: &ContainerConfig) -> Result<Self> {
        let readiness = &config.readiness;
        match readiness.kind {
            ReadinessKind::Log => Regex::new(&readiness.log_pattern)
                .map(ReadinessProbe::Log)
                .map_err(|e| ShipgateError::Config(format!("readiness log pattern: {e}"))),
            ReadinessKind::Http => {
                let per_request = Duration::from_millis(readiness.interval_ms.max(1000));
                // Throwaway service instances present self-signed certificates.
                let client = reqwest::Client::builder()
                    .danger_accept_invalid_certs(true)
                    .timeout(per_request)
                    .build()
                    .map_err(|e| ShipgateError::Config(format!("http client: {e}")))?;
                Ok(ReadinessProbe::Http {
                    url: format!(
                        "{}://localhost:{}{}",
                        readiness.scheme, config.host_port, readiness.http_path
                    ),
                    client,
                })
            }
        }
    }

    async fn check(&self, runtime: &dyn ContainerRuntime, container: &str) -> bool {
        match self {
            ReadinessProbe::Log(pattern) => match runtime.logs(container).await {
                Ok(logs) => pattern.is_match(&logs),
                Err(e) => {
                    debug!(container, error = %e, "log probe failed");
                    false
                }
            },
            ReadinessProbe::Http { url, client } => match client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    status.is_success()
                        || status.is_redirection()
                        || status == reqwest::StatusCode::UNAUTHORIZED
                }
                Err(e) => {
                    debug!(url = %url, error = %e, "http probe failed");
                    false
                }
            },
        }
    }
}

/// Poll `probe` every `interval` until it succeeds or `timeout` elapses.
///
/// Returns the time waited. Fails early with `Start` if the container
/// exits while waiting.
pub async fn wait_until_ready(
    runtime: &dyn ContainerRuntime,
    container: &str,
    probe: &ReadinessProbe,
    timeout: Duration,
    interval: Duration,
) -> Result<Duration> {
    let started = Instant::now();
    let deadline = started + timeout;
    loop {
        if probe.check(runtime, container).await {
            return Ok(started.elapsed());
        }
        if let Ok(false) = runtime.is_running(container).await {
            return Err(ShipgateError::Start(format!(
                "container '{container}' exited before becoming ready"
            )));
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(ShipgateError::ReadinessTimeout {
                container: container.to_string(),
                waited_ms: started.elapsed().as_millis() as u64,
            });
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
