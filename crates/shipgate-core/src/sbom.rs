//! Software bill of materials and dependency license report.
//!
//! Both documents are derived from the dependency inventory produced by the
//! external resolver. Neither carries a timestamp, so regenerating them from
//! the same inventory yields the same bytes.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shipgate_state::write_atomic;

use crate::config::ProjectConfig;
use crate::error::{Result, ShipgateError};
use crate::gate::license::LicenseAllowList;
use crate::version::Version;

pub const BOM_FORMAT: &str = "CycloneDX";
pub const SPEC_VERSION: &str = "1.6";

/// One resolved third-party dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub licenses: Vec<String>,
    /// Override URL accepted by the allow-list in place of a license name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purl: Option<String>,
    /// Known vulnerability ids matched against this dependency.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vulnerabilities: Vec<String>,
}

impl Dependency {
    pub fn coordinate(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

/// The resolver's output: a JSON array of [`Dependency`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DependencyInventory {
    pub dependencies: Vec<Dependency>,
}

impl DependencyInventory {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            ShipgateError::Io(std::io::Error::new(
                e.kind(),
                format!("dependency inventory {}: {e}", path.display()),
            ))
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Dependencies sorted by name then version.
    pub fn sorted(&self) -> Vec<&Dependency> {
        let mut deps: Vec<&Dependency> = self.dependencies.iter().collect();
        deps.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));
        deps
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedText {
    pub content_type: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SbomLicense {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<AttachedText>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseChoice {
    pub license: SbomLicense,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SbomComponent {
    #[serde(rename = "type")]
    pub component_type: String,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purl: Option<String>,
    #[serde(default)]
    pub licenses: Vec<LicenseChoice>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SbomMetadata {
    pub component: SbomComponent,
}

/// CycloneDX-shaped inventory of embedded components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sbom {
    pub bom_format: String,
    pub spec_version: String,
    pub version: u32,
    pub metadata: SbomMetadata,
    pub components: Vec<SbomComponent>,
    /// SHA-256 over the serialized component list.
    pub digest: String,
}

impl Sbom {
    /// Build the SBOM for `project` at `version`; `license_text` is embedded
    /// into the root component.
    pub fn generate(
        project: &ProjectConfig,
        version: &Version,
        license_text: &str,
        inventory: &DependencyInventory,
    ) -> Result<Self> {
        let components: Vec<SbomComponent> = inventory
            .sorted()
            .into_iter()
            .map(|dep| SbomComponent {
                component_type: "library".to_string(),
                name: dep.name.clone(),
                version: dep.version.clone(),
                purl: dep.purl.clone(),
                licenses: dep
                    .licenses
                    .iter()
                    .map(|l| LicenseChoice {
                        license: SbomLicense {
                            name: Some(l.clone()),
                            url: dep.license_url.clone(),
                            text: None,
                        },
                    })
                    .collect(),
            })
            .collect();

        let root = SbomComponent {
            component_type: project.component_type.clone(),
            name: project.name.clone(),
            version: version.to_string(),
            purl: None,
            licenses: vec![LicenseChoice {
                license: SbomLicense {
                    name: Some(project.license_name.clone()),
                    url: project.license_url.clone(),
                    text: Some(AttachedText {
                        content_type: "text/plain".to_string(),
                        content: license_text.to_string(),
                    }),
                },
            }],
        };

        let digest = component_digest(&components)?;
        Ok(Self {
            bom_format: BOM_FORMAT.to_string(),
            spec_version: SPEC_VERSION.to_string(),
            version: 1,
            metadata: SbomMetadata { component: root },
            components,
            digest,
        })
    }

    /// Whether `digest` still matches the component list.
    pub fn verify(&self) -> bool {
        component_digest(&self.components)
            .map(|d| d == self.digest)
            .unwrap_or(false)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &bytes)?;
        Ok(())
    }
}

fn component_digest(components: &[SbomComponent]) -> Result<String> {
    let canonical = serde_json::to_vec(components)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseReportEntry {
    pub name: String,
    pub version: String,
    pub licenses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_url: Option<String>,
    pub allowed: bool,
}

/// Per-dependency license listing shipped inside the artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_list_version: Option<String>,
    pub dependencies: Vec<LicenseReportEntry>,
}

impl LicenseReport {
    pub fn build(inventory: &DependencyInventory, allow_list: &LicenseAllowList) -> Self {
        let dependencies = inventory
            .sorted()
            .into_iter()
            .map(|dep| LicenseReportEntry {
                name: dep.name.clone(),
                version: dep.version.clone(),
                licenses: dep.licenses.clone(),
                license_url: dep.license_url.clone(),
                allowed: allow_list.permits(dep),
            })
            .collect();
        Self {
            allow_list_version: allow_list.version().map(str::to_string),
            dependencies,
        }
    }

    pub fn disallowed(&self) -> impl Iterator<Item = &LicenseReportEntry> {
        self.dependencies.iter().filter(|d| !d.allowed)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &bytes)?;
        Ok(())
    }
}
