use std::collections::HashSet;
use std::path::Path;

use crate::error::Result;
use crate::sbom::DependencyInventory;

use super::policy_list::PolicyList;
use super::{GateName, GateResult};

/// Vulnerability ids explicitly accepted for this release line.
#[derive(Debug, Clone, Default)]
pub struct ExclusionList {
    list: PolicyList,
}

impl ExclusionList {
    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self {
            list: PolicyList::load(path, "exclusions")?,
        })
    }

    pub fn new(version: Option<String>, ids: Vec<String>) -> Self {
        Self {
            list: PolicyList {
                version,
                entries: ids,
            },
        }
    }

    pub fn version(&self) -> Option<&str> {
        self.list.version.as_deref()
    }

    fn ids(&self) -> HashSet<&str> {
        self.list.entries.iter().map(String::as_str).collect()
    }
}

pub fn evaluate(inventory: &DependencyInventory, exclusions: &ExclusionList) -> GateResult {
    let excluded = exclusions.ids();
    let mut ignored = 0usize;
    let mut unmatched = Vec::new();
    for dep in inventory.sorted() {
        for id in &dep.vulnerabilities {
            if excluded.contains(id.as_str()) {
                ignored += 1;
            } else {
                unmatched.push(format!("{id} in {}", dep.coordinate()));
            }
        }
    }

    let list_version = exclusions.version().unwrap_or("unversioned");
    if unmatched.is_empty() {
        GateResult::pass(
            GateName::Vulnerability,
            format!("no unexcluded vulnerabilities ({ignored} excluded by list {list_version})"),
        )
    } else {
        GateResult::fail(
            GateName::Vulnerability,
            format!("unexcluded vulnerabilities: {}", unmatched.join(", ")),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sbom::Dependency;

    fn inventory() -> DependencyInventory {
        DependencyInventory {
            dependencies: vec![Dependency {
                name: "parser".to_string(),
                version: "3.2.1".to_string(),
                licenses: vec!["MIT".to_string()],
                license_url: None,
                purl: None,
                vulnerabilities: vec!["CVE-2024-1".to_string(), "CVE-2024-2".to_string()],
            }],
        }
    }

    #[test]
    fn fully_excluded_passes() {
        let list = ExclusionList::new(
            Some("3".into()),
            vec!["CVE-2024-1".into(), "CVE-2024-2".into()],
        );
        let result = evaluate(&inventory(), &list);
        assert!(result.passed);
        assert!(result.detail.contains("2 excluded by list 3"));
    }

    #[test]
    fn unmatched_id_fails_and_is_named() {
        let list = ExclusionList::new(None, vec!["CVE-2024-1".into()]);
        let result = evaluate(&inventory(), &list);
        assert!(!result.passed);
        assert_eq!(
            result.detail,
            "unexcluded vulnerabilities: CVE-2024-2 in parser@3.2.1"
        );
    }
}
