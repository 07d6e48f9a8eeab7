use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::graph::{ExecutionReport, TaskOutcome};

pub const RUN_SUMMARY_SCHEMA: &str = "shipgate.run-summary/1";

/// One task line in the run summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSummaryEntry {
    pub task: String,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Canonical run summary written after every invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummaryArtifact {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    pub run_id: String,
    pub version: String,
    pub targets: Vec<String>,
    pub success: bool,
    pub exit_code: u8,
    pub duration_ms: u64,
    /// Plan order.
    pub tasks: Vec<TaskSummaryEntry>,
}

impl RunSummaryArtifact {
    pub fn from_report(report: &ExecutionReport, version: &str) -> Self {
        let tasks = report
            .plan
            .order
            .iter()
            .filter_map(|task| report.outcome(task).map(|o| (task, o)))
            .map(|(task, outcome)| {
                let (label, detail) = match outcome {
                    TaskOutcome::Succeeded => ("succeeded", None),
                    TaskOutcome::UpToDate => ("up-to-date", None),
                    TaskOutcome::Failed { error, .. } => ("failed", Some(error.clone())),
                    TaskOutcome::Blocked { by } => ("blocked", Some(format!("by {by}"))),
                    TaskOutcome::NotRequired => ("not-required", None),
                };
                TaskSummaryEntry {
                    task: task.clone(),
                    outcome: label.to_string(),
                    detail,
                }
            })
            .collect();
        Self {
            schema_version: RUN_SUMMARY_SCHEMA.to_string(),
            generated_at: Utc::now(),
            run_id: report.run_id.clone(),
            version: version.to_string(),
            targets: report.plan.targets.clone(),
            success: report.success(),
            exit_code: report.exit_code(),
            duration_ms: report.duration_ms,
            tasks,
        }
    }
}

/// Write run-summary.json in pretty JSON format.
pub fn write_run_summary_json(path: &Path, artifact: &RunSummaryArtifact) -> Result<()> {
    let content = serde_json::to_vec_pretty(artifact).context("serialize run summary")?;
    shipgate_state::write_atomic(path, &content)
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Render a markdown summary for CI logs.
pub fn render_run_summary_md(artifact: &RunSummaryArtifact) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "# shipgate {} ({})\n\n",
        artifact.version,
        if artifact.success { "success" } else { "FAILED" }
    ));
    out.push_str(&format!(
        "- run: `{}`\n- targets: {}\n- duration: {} ms\n\n",
        artifact.run_id,
        artifact.targets.join(", "),
        artifact.duration_ms
    ));
    out.push_str("| task | outcome | detail |\n|---|---|---|\n");
    for entry in &artifact.tasks {
        out.push_str(&format!(
            "| `{}` | {} | {} |\n",
            entry.task,
            entry.outcome,
            entry.detail.as_deref().unwrap_or("")
        ));
    }
    out
}
