//! Coverage thresholds at project and unit granularity.
//!
//! Input is either a JSON summary or a JaCoCo XML report. Only class-level
//! counters are read from JaCoCo; method counters are ignored. The project
//! ratio comes from the report-level counters when present. A report without
//! any line data fails both gates.

use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::GateThresholds;
use crate::error::{Result, ShipgateError};

use super::{GateName, GateResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitCoverage {
    pub name: String,
    pub lines_covered: u64,
    pub lines_missed: u64,
    #[serde(default)]
    pub branches_covered: u64,
    #[serde(default)]
    pub branches_missed: u64,
}

impl UnitCoverage {
    pub fn line_ratio(&self) -> f64 {
        ratio(self.lines_covered, self.lines_missed)
    }

    /// `1.0` for units without branches.
    pub fn branch_ratio(&self) -> f64 {
        ratio(self.branches_covered, self.branches_missed)
    }
}

const PROJECT: &str = "<project>";

fn ratio(covered: u64, missed: u64) -> f64 {
    let total = covered + missed;
    if total == 0 {
        1.0
    } else {
        covered as f64 / total as f64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageReport {
    pub units: Vec<UnitCoverage>,
    /// Report-level counters; summed from `units` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub totals: Option<UnitCoverage>,
}

fn apply_counters(re: &Regex, text: &str, unit: &mut UnitCoverage) -> bool {
    let mut found = false;
    for counter in re.captures_iter(text) {
        let missed: u64 = counter[2].parse().unwrap_or(0);
        let covered: u64 = counter[3].parse().unwrap_or(0);
        match &counter[1] {
            "LINE" => {
                unit.lines_missed = missed;
                unit.lines_covered = covered;
            }
            _ => {
                unit.branches_missed = missed;
                unit.branches_covered = covered;
            }
        }
        found = true;
    }
    found
}

impl CoverageReport {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ShipgateError::Io(std::io::Error::new(
                e.kind(),
                format!("coverage report {}: {e}", path.display()),
            ))
        })?;
        if text.trim_start().starts_with('<') {
            Self::from_jacoco_xml(&text)
        } else {
            Ok(serde_json::from_str(&text)?)
        }
    }

    /// Extract class-level LINE and BRANCH counters from a JaCoCo report.
    pub fn from_jacoco_xml(xml: &str) -> Result<Self> {
        let class_re = Regex::new(r#"(?s)<class\s+name="([^"]+)"[^>]*?>(.*?)</class>"#)
            .map_err(|e| ShipgateError::Config(e.to_string()))?;
        let counter_re =
            Regex::new(r#"<counter\s+type="(LINE|BRANCH)"\s+missed="(\d+)"\s+covered="(\d+)"\s*/>"#)
                .map_err(|e| ShipgateError::Config(e.to_string()))?;

        let mut units = Vec::new();
        for class in class_re.captures_iter(xml) {
            let name = class[1].replace('/', ".");
            let body = &class[2];
            // Class counters follow the last method element.
            let own = body
                .rfind("</method>")
                .map(|i| &body[i + "</method>".len()..])
                .unwrap_or(body);

            let mut unit = UnitCoverage {
                name,
                ..UnitCoverage::default()
            };
            apply_counters(&counter_re, own, &mut unit);
            units.push(unit);
        }

        // Report counters follow the last package (or class) element.
        let tail = ["</package>", "</class>"]
            .iter()
            .find_map(|end| xml.rfind(end).map(|i| &xml[i + end.len()..]))
            .unwrap_or(xml);
        let mut report = UnitCoverage {
            name: PROJECT.to_string(),
            ..UnitCoverage::default()
        };
        let totals = apply_counters(&counter_re, tail, &mut report).then_some(report);
        Ok(Self { units, totals })
    }

    pub fn project_totals(&self) -> UnitCoverage {
        if let Some(totals) = &self.totals {
            return totals.clone();
        }
        self.units.iter().fold(
            UnitCoverage {
                name: PROJECT.to_string(),
                ..UnitCoverage::default()
            },
            |mut acc, u| {
                acc.lines_covered += u.lines_covered;
                acc.lines_missed += u.lines_missed;
                acc.branches_covered += u.branches_covered;
                acc.branches_missed += u.branches_missed;
                acc
            },
        )
    }
}

/// Exclusion patterns where `*` matches any run of characters.
pub struct UnitExcludes {
    patterns: Vec<Regex>,
}

impl UnitExcludes {
    pub fn new(globs: &[String]) -> Result<Self> {
        let patterns = globs
            .iter()
            .map(|g| {
                let body = g
                    .split('*')
                    .map(regex::escape)
                    .collect::<Vec<_>>()
                    .join(".*");
                Regex::new(&format!("^{body}$"))
                    .map_err(|e| ShipgateError::Config(format!("unit exclude '{g}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn matches(&self, unit: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(unit))
    }
}

/// Produce the `coverage-line` and `coverage-branch` results.
///
/// Per-unit shortfalls fold into the matching result, so each gate fails if
/// either the project ratio or any non-excluded unit is below its minimum.
pub fn evaluate(report: &CoverageReport, thresholds: &GateThresholds) -> Result<[GateResult; 2]> {
    let excludes = UnitExcludes::new(&thresholds.unit_excludes)?;
    let totals = report.project_totals();
    if totals.lines_covered + totals.lines_missed == 0 {
        let detail = "coverage report contains no line data";
        return Ok([
            GateResult::fail(GateName::CoverageLine, detail),
            GateResult::fail(GateName::CoverageBranch, detail),
        ]);
    }

    let check = |gate: GateName,
                 project: f64,
                 min: f64,
                 unit_min: f64,
                 unit_ratio: fn(&UnitCoverage) -> f64| {
        let mut problems = Vec::new();
        if project < min {
            problems.push(format!("project {project:.2} < {min:.2}"));
        }
        let low: Vec<String> = report
            .units
            .iter()
            .filter(|u| !excludes.matches(&u.name))
            .filter(|u| unit_ratio(u) < unit_min)
            .map(|u| format!("{} {:.2}", u.name, unit_ratio(u)))
            .collect();
        if !low.is_empty() {
            problems.push(format!("units below {unit_min:.2}: {}", low.join(", ")));
        }
        if problems.is_empty() {
            GateResult::pass(gate, format!("project {project:.2} >= {min:.2}"))
        } else {
            GateResult::fail(gate, problems.join("; "))
        }
    };

    Ok([
        check(
            GateName::CoverageLine,
            totals.line_ratio(),
            thresholds.line,
            thresholds.unit_line,
            UnitCoverage::line_ratio,
        ),
        check(
            GateName::CoverageBranch,
            totals.branch_ratio(),
            thresholds.branch,
            thresholds.unit_branch,
            UnitCoverage::branch_ratio,
        ),
    ])
}
