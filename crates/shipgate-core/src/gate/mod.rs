//! Release gate evaluation.
//!
//! Four independent checks (line coverage, branch coverage, license
//! allow-list, vulnerability exclusions) each produce a [`GateResult`]. The
//! [`ReleaseGate`] is their logical AND. All checks always run so the report
//! lists every failing gate at once.
//!
//! SBOM presence is a precondition rather than a gate: a missing or
//! tampered SBOM aborts evaluation with [`ShipgateError::MissingSbom`].

pub mod coverage;
pub mod license;
mod policy_list;
pub mod vulnerability;

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::config::{GateThresholds, PipelineConfig};
use crate::error::{Result, ShipgateError};
use crate::obs;
use crate::sbom::{DependencyInventory, Sbom};

pub use coverage::{CoverageReport, UnitCoverage};
pub use license::LicenseAllowList;
pub use policy_list::PolicyList;
pub use vulnerability::ExclusionList;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GateName {
    CoverageLine,
    CoverageBranch,
    License,
    Vulnerability,
}

impl GateName {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateName::CoverageLine => "coverage-line",
            GateName::CoverageBranch => "coverage-branch",
            GateName::License => "license",
            GateName::Vulnerability => "vulnerability",
        }
    }
}

impl fmt::Display for GateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: GateName,
    pub passed: bool,
    pub detail: String,
}

impl GateResult {
    pub fn pass(gate: GateName, detail: impl Into<String>) -> Self {
        Self {
            gate,
            passed: true,
            detail: detail.into(),
        }
    }

    pub fn fail(gate: GateName, detail: impl Into<String>) -> Self {
        Self {
            gate,
            passed: false,
            detail: detail.into(),
        }
    }
}

/// Aggregate decision; computed once per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseGate {
    pub results: Vec<GateResult>,
    pub passed: bool,
    pub evaluated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclusion_list_version: Option<String>,
}

/// Proof that a release gate passed. Only obtainable from a passing [`ReleaseGate`].
#[derive(Debug, Clone, PartialEq)]
pub struct PassedGate {
    evaluated_at: DateTime<Utc>,
}

impl PassedGate {
    pub fn evaluated_at(&self) -> DateTime<Utc> {
        self.evaluated_at
    }
}

impl ReleaseGate {
    pub fn from_results(
        results: Vec<GateResult>,
        exclusion_list_version: Option<String>,
    ) -> Self {
        let passed = results.iter().all(|r| r.passed);
        Self {
            results,
            passed,
            evaluated_at: Utc::now(),
            exclusion_list_version,
        }
    }

    pub fn failed(&self) -> impl Iterator<Item = &GateResult> {
        self.results.iter().filter(|r| !r.passed)
    }

    pub fn passed_token(&self) -> Option<PassedGate> {
        self.passed.then(|| PassedGate {
            evaluated_at: self.evaluated_at,
        })
    }

    /// `Ok(token)` if passed, else [`ShipgateError::GateFailed`] naming the gates.
    pub fn require_passed(&self) -> Result<PassedGate> {
        self.passed_token().ok_or_else(|| ShipgateError::GateFailed {
            failed: self.failed().map(|r| r.gate.to_string()).collect(),
        })
    }

    /// Consolidated summary listing only the failing gates.
    pub fn render_markdown(&self) -> String {
        let mut out = String::from("# Release Gate\n\n");
        if self.passed {
            out.push_str("**PASSED**: all gates passed.\n");
            return out;
        }
        out.push_str("**FAILED**\n\n");
        for result in self.failed() {
            out.push_str(&format!("- `{}`: {}\n", result.gate, result.detail));
        }
        out
    }
}

/// Already-loaded inputs for a gate evaluation.
pub struct GateInputs<'a> {
    pub coverage: &'a CoverageReport,
    pub inventory: &'a DependencyInventory,
    pub allow_list: &'a LicenseAllowList,
    pub exclusions: &'a ExclusionList,
}

pub struct QualityGateEvaluator<'a> {
    thresholds: &'a GateThresholds,
}

impl<'a> QualityGateEvaluator<'a> {
    pub fn new(thresholds: &'a GateThresholds) -> Self {
        Self { thresholds }
    }

    pub fn evaluate(&self, inputs: &GateInputs<'_>) -> Result<ReleaseGate> {
        let [line, branch] = coverage::evaluate(inputs.coverage, self.thresholds)?;
        let results = vec![
            line,
            branch,
            license::evaluate(inputs.inventory, inputs.allow_list),
            vulnerability::evaluate(inputs.inventory, inputs.exclusions),
        ];
        for r in &results {
            obs::emit_gate_evaluated(r.gate.as_str(), r.passed, &r.detail);
        }
        Ok(ReleaseGate::from_results(
            results,
            inputs.exclusions.version().map(str::to_string),
        ))
    }

    /// Read every policy input from disk and evaluate against `artifact`.
    ///
    /// The allow-list and exclusion list are read here, at evaluation start,
    /// never cached from an earlier stage.
    pub fn evaluate_files(
        &self,
        config: &PipelineConfig,
        artifact: &Artifact,
    ) -> Result<ReleaseGate> {
        require_sbom(artifact)?;

        let coverage = CoverageReport::load(&config.resolve(&config.paths.coverage_report))?;
        let inventory =
            DependencyInventory::load(&config.resolve(&config.paths.dependency_inventory))?;
        let allow_list = LicenseAllowList::load(&config.resolve(&config.paths.license_allow_list))?;
        let exclusions =
            ExclusionList::load(&config.resolve(&config.paths.vulnerability_exclusions))?;

        self.evaluate(&GateInputs {
            coverage: &coverage,
            inventory: &inventory,
            allow_list: &allow_list,
            exclusions: &exclusions,
        })
    }
}

/// The SBOM must be attached to the artifact and intact.
pub fn require_sbom(artifact: &Artifact) -> Result<()> {
    let path = artifact.bom_path();
    if !artifact.lists(Artifact::BOM_ENTRY) || !path.is_file() {
        return Err(ShipgateError::MissingSbom(path.display().to_string()));
    }
    let sbom = Sbom::load(&path)
        .map_err(|e| ShipgateError::MissingSbom(format!("{}: {e}", path.display())))?;
    if !sbom.verify() {
        return Err(ShipgateError::MissingSbom(format!(
            "{}: digest does not match components",
            path.display()
        )));
    }
    Ok(())
}

/// Write `release-gate.json` and `release-gate.md` into `dir`.
pub fn write_reports(gate: &ReleaseGate, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let json = serde_json::to_vec_pretty(gate)?;
    shipgate_state::write_atomic(&dir.join("release-gate.json"), &json)?;
    shipgate_state::write_atomic(
        &dir.join("release-gate.md"),
        gate.render_markdown().as_bytes(),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sbom::Dependency;

    fn inputs_with_coverage(line: (u64, u64), branch: (u64, u64)) -> ReleaseGate {
        let coverage = CoverageReport {
            units: vec![UnitCoverage {
                name: "com.example.Vault".to_string(),
                lines_covered: line.0,
                lines_missed: line.1,
                branches_covered: branch.0,
                branches_missed: branch.1,
            }],
            totals: None,
        };
        let inventory = DependencyInventory {
            dependencies: vec![Dependency {
                name: "json".to_string(),
                version: "1.0.0".to_string(),
                licenses: vec!["MIT".to_string()],
                license_url: None,
                purl: None,
                vulnerabilities: vec!["CVE-1".to_string()],
            }],
        };
        let allow = LicenseAllowList::from_entries(["MIT"]);
        let exclusions = ExclusionList::new(Some("v5".into()), vec!["CVE-1".into()]);
        let thresholds = GateThresholds::default();
        QualityGateEvaluator::new(&thresholds)
            .evaluate(&GateInputs {
                coverage: &coverage,
                inventory: &inventory,
                allow_list: &allow,
                exclusions: &exclusions,
            })
            .unwrap()
    }

    #[test]
    fn branch_shortfall_is_the_only_failure_reported() {
        let gate = inputs_with_coverage((82, 18), (65, 35));
        assert!(!gate.passed);
        let failed: Vec<GateName> = gate.failed().map(|r| r.gate).collect();
        assert_eq!(failed, vec![GateName::CoverageBranch]);
        assert!(gate.passed_token().is_none());

        let md = gate.render_markdown();
        assert!(md.contains("coverage-branch"));
        assert!(!md.contains("coverage-line"));
        assert!(!md.contains("`license`"));

        match gate.require_passed() {
            Err(ShipgateError::GateFailed { failed }) => {
                assert_eq!(failed, vec!["coverage-branch".to_string()])
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn all_gates_pass() {
        let gate = inputs_with_coverage((90, 10), (80, 20));
        assert!(gate.passed);
        assert_eq!(gate.results.len(), 4);
        assert_eq!(gate.exclusion_list_version.as_deref(), Some("v5"));
        assert!(gate.require_passed().is_ok());
    }

    #[test]
    fn gate_names_serialize_kebab_case() {
        let json = serde_json::to_string(&GateName::CoverageLine).unwrap();
        assert_eq!(json, "\"coverage-line\"");
    }

    #[test]
    fn reports_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let gate = inputs_with_coverage((82, 18), (65, 35));
        write_reports(&gate, dir.path()).unwrap();
        let back: ReleaseGate = serde_json::from_slice(
            &std::fs::read(dir.path().join("release-gate.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(back, gate);
        assert!(dir.path().join("release-gate.md").is_file());
    }
}
