//! Pipeline configuration.
//!
//! A single [`PipelineConfig`] is loaded from `shipgate.toml` once at run
//! start, validated, and shared read-only (behind an `Arc`) by every stage.
//! Relative paths resolve against the directory holding the config file.
//! Registry credentials are never read from the file; see
//! [`RegistryCredentials::from_env`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShipgateError};
use crate::version::Version;

/// Default config file name looked up by the CLI.
pub const DEFAULT_CONFIG_FILE: &str = "shipgate.toml";

/// Root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Directory relative paths resolve against. Set by [`PipelineConfig::load`].
    #[serde(skip)]
    pub root: PathBuf,
    pub project: ProjectConfig,
    pub paths: PathsConfig,
    pub version: VersionConfig,
    pub container: ContainerConfig,
    pub integration: IntegrationConfig,
    pub gates: GateThresholds,
    pub publish: PublishConfig,
    pub executor: ExecutorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
    /// Artifact name; also the default image and container name prefix.
    pub name: String,
    /// `application` or `library`, recorded in the SBOM.
    pub component_type: String,
    pub license_file: PathBuf,
    pub license_name: String,
    pub license_url: Option<String>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: "service".to_string(),
            component_type: "application".to_string(),
            license_file: PathBuf::from("LICENSE"),
            license_name: "MIT License".to_string(),
            license_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    /// Compiled module output embedded in the bundle.
    pub compiled_output: PathBuf,
    pub dist_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub state_dir: PathBuf,
    pub version_file: PathBuf,
    /// Resolved third-party dependencies (JSON) from the external resolver.
    pub dependency_inventory: PathBuf,
    /// Coverage summary JSON or JaCoCo XML.
    pub coverage_report: PathBuf,
    pub license_allow_list: PathBuf,
    pub vulnerability_exclusions: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            compiled_output: PathBuf::from("build/libs/app.jar"),
            dist_dir: PathBuf::from("build/dist"),
            reports_dir: PathBuf::from("build/reports"),
            state_dir: PathBuf::from(".shipgate"),
            version_file: PathBuf::from("build/version"),
            dependency_inventory: PathBuf::from("build/dependencies.json"),
            coverage_report: PathBuf::from("build/reports/coverage.json"),
            license_allow_list: PathBuf::from("config/license-allow-list.json"),
            vulnerability_exclusions: PathBuf::from("config/vulnerability-exclusions.txt"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct VersionConfig {
    pub repo_dir: PathBuf,
    pub tag_prefix: String,
    pub major_marker: String,
    pub minor_marker: String,
    /// First version when the tag history is readable but empty.
    pub start_from: String,
    /// Explicit reset; bypasses the strictly-increasing check.
    pub reset_to: Option<String>,
    /// Create `<tag_prefix><version>` after a successful publish.
    pub create_tag: bool,
}

impl Default for VersionConfig {
    fn default() -> Self {
        Self {
            repo_dir: PathBuf::from("."),
            tag_prefix: "v".to_string(),
            major_marker: "{major}".to_string(),
            minor_marker: "{minor}".to_string(),
            start_from: "0.0.1".to_string(),
            reset_to: None,
            create_tag: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerConfig {
    /// Local image repository; tagged with the resolved version.
    pub image: String,
    /// Extra repositories the built image is tagged and pushed as.
    pub push_repositories: Vec<String>,
    pub dockerfile: PathBuf,
    /// Defaults to `<project.name>-<run id prefix>`.
    pub name: Option<String>,
    pub container_port: u16,
    pub host_port: u16,
    pub platform: Option<String>,
    pub pull: bool,
    pub no_cache: bool,
    /// Env var that receives the joined runtime argument line.
    pub args_env: String,
    pub runtime_args: RuntimeArgsConfig,
    pub readiness: ReadinessConfig,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: "service".to_string(),
            push_repositories: Vec::new(),
            dockerfile: PathBuf::from("docker/Dockerfile"),
            name: None,
            container_port: 8443,
            host_port: 8444,
            platform: None,
            pull: true,
            no_cache: true,
            args_env: "APP_ARGS".to_string(),
            runtime_args: RuntimeArgsConfig::default(),
            readiness: ReadinessConfig::default(),
        }
    }
}

/// Arguments injected into the service at start.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeArgsConfig {
    /// Logical service names to register (e.g. vault names).
    pub names: Vec<String>,
    /// `name -> aliases`; `<port>` in an alias is replaced by the host port.
    pub aliases: BTreeMap<String, Vec<String>>,
    pub debug: bool,
    /// Feature toggles rendered as `--<key>=<value>`.
    pub flags: BTreeMap<String, String>,
    pub additional: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessKind {
    Log,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ReadinessConfig {
    pub kind: ReadinessKind,
    pub log_pattern: String,
    /// Probed as `<scheme>://localhost:<host_port><http_path>`.
    pub http_path: String,
    pub scheme: String,
    pub timeout_secs: u64,
    pub interval_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            kind: ReadinessKind::Log,
            log_pattern: "(?s).*Started .*".to_string(),
            http_path: "/ping".to_string(),
            scheme: "https".to_string(),
            timeout_secs: 60,
            interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ScenarioConfig {
    pub name: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct IntegrationConfig {
    /// Scenario command; receives `SHIPGATE_ENDPOINT` and `SHIPGATE_SCENARIO`.
    pub command: Vec<String>,
    pub scenarios: Vec<ScenarioConfig>,
    pub exclude_tags: Vec<String>,
    pub concurrency: usize,
    pub scenario_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub skip_exit_code: i32,
    pub scheme: String,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            scenarios: Vec::new(),
            exclude_tags: vec!["ignore".to_string()],
            concurrency: 4,
            scenario_timeout_secs: 300,
            connect_timeout_secs: 10,
            skip_exit_code: 77,
            scheme: "https".to_string(),
        }
    }
}

/// Coverage thresholds. Environment-specific policy; no value is canonical.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct GateThresholds {
    pub line: f64,
    pub branch: f64,
    pub unit_line: f64,
    pub unit_branch: f64,
    /// Units exempt from the per-unit check; `*` matches any run of characters.
    pub unit_excludes: Vec<String>,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            line: 0.8,
            branch: 0.7,
            unit_line: 0.5,
            unit_branch: 0.5,
            unit_excludes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PublishConfig {
    /// Directory-backed package repository the bundle is copied into.
    pub package_repository: Option<PathBuf>,
    pub push_image: bool,
    /// Publish records (release immutability ledger).
    pub registry_dir: PathBuf,
    pub registry_host: Option<String>,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            package_repository: None,
            push_image: false,
            registry_dir: PathBuf::from(".shipgate/published"),
            registry_host: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    pub max_parallel: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { max_parallel: 4 }
    }
}

impl PipelineConfig {
    /// Read, parse and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ShipgateError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let root = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_toml_str(&text, root)
    }

    /// Parse and validate TOML text with an explicit root directory.
    pub fn from_toml_str(text: &str, root: PathBuf) -> Result<Self> {
        let mut config: PipelineConfig = toml::from_str(text)
            .map_err(|e| ShipgateError::Config(format!("parse error: {e}")))?;
        config.root = root;
        config.validate()?;
        Ok(config)
    }

    /// Resolve a configured path against the config root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// A generated report under the reports directory.
    pub fn report_path(&self, name: &str) -> PathBuf {
        self.resolve(&self.paths.reports_dir).join(name)
    }

    /// Image reference `<image>:<version>`.
    pub fn image_ref(&self, version: &Version) -> String {
        format!("{}:{}", self.container.image, version)
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(ShipgateError::Config(msg));

        if self.project.name.trim().is_empty() {
            return bad("project.name must not be empty".to_string());
        }
        for (label, value) in [
            ("gates.line", self.gates.line),
            ("gates.branch", self.gates.branch),
            ("gates.unit_line", self.gates.unit_line),
            ("gates.unit_branch", self.gates.unit_branch),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return bad(format!("{label} must be within 0.0..=1.0, got {value}"));
            }
        }
        if self.executor.max_parallel == 0 {
            return bad("executor.max_parallel must be at least 1".to_string());
        }
        if self.integration.concurrency == 0 {
            return bad("integration.concurrency must be at least 1".to_string());
        }
        if self.container.readiness.timeout_secs == 0 {
            return bad("container.readiness.timeout_secs must be positive".to_string());
        }
        if self.container.readiness.interval_ms == 0 {
            return bad("container.readiness.interval_ms must be positive".to_string());
        }
        if regex::Regex::new(&self.container.readiness.log_pattern).is_err() {
            return bad(format!(
                "container.readiness.log_pattern is not a valid regex: {}",
                self.container.readiness.log_pattern
            ));
        }
        Version::parse(&self.version.start_from)
            .map_err(|e| ShipgateError::Config(format!("version.start_from: {e}")))?;
        if let Some(reset) = &self.version.reset_to {
            Version::parse(reset)
                .map_err(|e| ShipgateError::Config(format!("version.reset_to: {e}")))?;
        }

        let mut seen = std::collections::HashSet::new();
        for scenario in &self.integration.scenarios {
            if scenario.name.trim().is_empty() {
                return bad("integration scenario with empty name".to_string());
            }
            if !seen.insert(scenario.name.as_str()) {
                return bad(format!("duplicate integration scenario: {}", scenario.name));
            }
        }
        if !self.integration.scenarios.is_empty() && self.integration.command.is_empty() {
            return bad("integration.command is required when scenarios are declared".to_string());
        }
        crate::container::RuntimeArgs::validate_names(&self.container.runtime_args.names)?;
        Ok(())
    }
}

/// Registry credentials, read from the environment only.
#[derive(Clone)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl RegistryCredentials {
    pub const USER_ENV: &'static str = "SHIPGATE_REGISTRY_USER";
    pub const PASSWORD_ENV: &'static str = "SHIPGATE_REGISTRY_PASSWORD";

    /// `None` unless both variables are set and non-empty.
    pub fn from_env() -> Option<Self> {
        let username = std::env::var(Self::USER_ENV).ok().filter(|v| !v.is_empty())?;
        let password = std::env::var(Self::PASSWORD_ENV)
            .ok()
            .filter(|v| !v.is_empty())?;
        Some(Self { username, password })
    }
}
