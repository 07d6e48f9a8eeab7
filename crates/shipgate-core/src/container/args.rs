use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::config::RuntimeArgsConfig;
use crate::error::{Result, ShipgateError};

const PORT_PLACEHOLDER: &str = "<port>";
const NAME_PATTERN: &str = "^[0-9a-zA-Z-]+$";

fn is_valid_name(name: &str) -> bool {
    static NAME: OnceLock<Option<Regex>> = OnceLock::new();
    NAME.get_or_init(|| Regex::new(NAME_PATTERN).ok())
        .as_ref()
        .is_some_and(|re| re.is_match(name))
}

/// Argument line injected into the service container.
///
/// Rendered in a fixed order: relaxed ports, names, debug, aliases, flags,
/// additional args.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeArgs {
    relaxed_ports: bool,
    names: Vec<String>,
    debug: bool,
    aliases: BTreeMap<String, Vec<String>>,
    flags: BTreeMap<String, String>,
    additional: Vec<String>,
}

impl RuntimeArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject names outside `[0-9a-zA-Z-]+`.
    pub fn validate_names(names: &[String]) -> Result<()> {
        match names.iter().find(|n| !is_valid_name(n)) {
            Some(bad) => Err(ShipgateError::Config(format!(
                "invalid service name '{bad}': must match {NAME_PATTERN}"
            ))),
            None => Ok(()),
        }
    }

    /// Build from config, substituting `<port>` in aliases with `host_port`.
    pub fn from_config(
        config: &RuntimeArgsConfig,
        host_port: u16,
        container_port: u16,
    ) -> Result<Self> {
        let aliases = config
            .aliases
            .iter()
            .map(|(host, list)| {
                let list = list
                    .iter()
                    .map(|a| a.replace(PORT_PLACEHOLDER, &host_port.to_string()))
                    .collect();
                (host.clone(), list)
            })
            .collect();

        Ok(Self::new()
            .relaxed_ports(host_port != container_port)
            .names(&config.names)?
            .debug(config.debug)
            .aliases(aliases)
            .flags(config.flags.clone())
            .additional(config.additional.clone()))
    }

    pub fn relaxed_ports(mut self, relaxed: bool) -> Self {
        self.relaxed_ports = relaxed;
        self
    }

    pub fn names(mut self, names: &[String]) -> Result<Self> {
        Self::validate_names(names)?;
        self.names = names.to_vec();
        Ok(self)
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn aliases(mut self, aliases: BTreeMap<String, Vec<String>>) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn flags(mut self, flags: BTreeMap<String, String>) -> Self {
        self.flags = flags;
        self
    }

    pub fn additional(mut self, args: Vec<String>) -> Self {
        self.additional = args;
        self
    }

    pub fn build(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.relaxed_ports {
            args.push("--SERVICE_RELAXED_PORTS=true".to_string());
        }
        if !self.names.is_empty() {
            args.push(format!("--SERVICE_NAMES={}", self.names.join(",")));
        }
        if self.debug {
            args.push("--SERVICE_DEBUG_REQUEST_LOG=true".to_string());
        }
        let mappings: Vec<String> = self
            .aliases
            .iter()
            .flat_map(|(host, list)| {
                let mut sorted = list.clone();
                sorted.sort();
                sorted.dedup();
                sorted.into_iter().map(move |alias| format!("{host}={alias}"))
            })
            .collect();
        if !mappings.is_empty() {
            args.push(format!("--SERVICE_ALIASES={}", mappings.join(",")));
        }
        for (key, value) in &self.flags {
            args.push(format!("--{key}={value}"));
        }
        args.extend(self.additional.iter().cloned());
        args
    }

    /// Single space-joined line, as passed through the args env var.
    pub fn render(&self) -> String {
        self.build().join(" ")
    }
}
