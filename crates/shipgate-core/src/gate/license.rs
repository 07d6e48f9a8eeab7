use std::path::Path;

use crate::error::Result;
use crate::sbom::{Dependency, DependencyInventory};

use super::policy_list::PolicyList;
use super::{GateName, GateResult};

/// Accepted license names and license URLs.
#[derive(Debug, Clone, Default)]
pub struct LicenseAllowList {
    list: PolicyList,
}

impl LicenseAllowList {
    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self {
            list: PolicyList::load(path, "licenses")?,
        })
    }

    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            list: PolicyList {
                version: None,
                entries: entries.into_iter().map(Into::into).collect(),
            },
        }
    }

    pub fn version(&self) -> Option<&str> {
        self.list.version.as_deref()
    }

    /// A dependency passes if any declared license, or its override URL, is listed.
    pub fn permits(&self, dep: &Dependency) -> bool {
        let listed = |candidate: &str| {
            self.list
                .entries
                .iter()
                .any(|e| e.eq_ignore_ascii_case(candidate.trim()))
        };
        dep.licenses.iter().any(|l| listed(l)) || dep.license_url.as_deref().is_some_and(listed)
    }
}

pub fn evaluate(inventory: &DependencyInventory, allow_list: &LicenseAllowList) -> GateResult {
    let offending: Vec<String> = inventory
        .sorted()
        .into_iter()
        .filter(|dep| !allow_list.permits(dep))
        .map(|dep| {
            let declared = if dep.licenses.is_empty() {
                "no license declared".to_string()
            } else {
                dep.licenses.join(" / ")
            };
            format!("{} ({declared})", dep.coordinate())
        })
        .collect();

    if offending.is_empty() {
        GateResult::pass(
            GateName::License,
            format!(
                "{} dependencies use allowed licenses",
                inventory.dependencies.len()
            ),
        )
    } else {
        GateResult::fail(
            GateName::License,
            format!("licenses not on the allow-list: {}", offending.join(", ")),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dep(name: &str, licenses: &[&str], url: Option<&str>) -> Dependency {
        Dependency {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            licenses: licenses.iter().map(|s| s.to_string()).collect(),
            license_url: url.map(str::to_string),
            purl: None,
            vulnerabilities: Vec::new(),
        }
    }

    #[test]
    fn override_url_is_accepted() {
        let allow = LicenseAllowList::from_entries(["https://example.org/license.txt"]);
        assert!(allow.permits(&dep(
            "custom",
            &["Custom"],
            Some("https://example.org/license.txt")
        )));
    }

    #[test]
    fn names_match_case_insensitively() {
        let allow = LicenseAllowList::from_entries(["mit license"]);
        assert!(allow.permits(&dep("a", &["MIT License"], None)));
    }

    #[test]
    fn gate_lists_offending_dependencies() {
        let inventory = DependencyInventory {
            dependencies: vec![
                dep("ok", &["MIT"], None),
                dep("bad", &["GPL-3.0"], None),
                dep("bare", &[], None),
            ],
        };
        let result = evaluate(&inventory, &LicenseAllowList::from_entries(["MIT"]));
        assert!(!result.passed);
        assert!(result.detail.contains("bad@1.0.0 (GPL-3.0)"));
        assert!(result.detail.contains("bare@1.0.0 (no license declared)"));
        assert!(!result.detail.contains("ok@"));
    }
}
