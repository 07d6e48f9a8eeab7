//! Structured observability hooks for pipeline lifecycle events.
//!
//! This module provides:
//! - A run-scoped tracing span shared by every task of one graph run
//! - Emission functions for task, container, gate and publish events
//!
//! Events are emitted at `info!` level; filter with `RUST_LOG` and switch to
//! JSON lines with `--json`.

use tracing::{info, warn};

/// Run-scoped span; attach with `tracing::Instrument` so it survives awaits.
///
/// # Example
///
/// ```ignore
/// execute(graph).instrument(run_span("3f2a9c1e")).await;
/// // every event inside carries run_id = "3f2a9c1e"
/// ```
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("shipgate.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, targets: &[String], planned: usize) {
    info!(
        event = "run.started",
        run_id = %run_id,
        targets = %targets.join(","),
        planned = planned,
    );
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, failed: usize, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        failed = failed,
        success = success,
    );
}

pub fn emit_task_started(task: &str) {
    info!(event = "task.started", task = %task);
}

/// Emit event: task action completed (either way).
pub fn emit_task_finished(task: &str, duration_ms: u64, success: bool) {
    info!(
        event = "task.finished",
        task = %task,
        duration_ms = duration_ms,
        success = success,
    );
}

/// Emit event: task not executed (up-to-date, blocked, not required).
pub fn emit_task_skipped(task: &str, reason: &str) {
    info!(event = "task.skipped", task = %task, reason = %reason);
}

pub fn emit_container_state(container: &str, state: &str) {
    info!(event = "container.state", container = %container, state = %state);
}

/// Emit event: best-effort cleanup failed; never changes the verdict.
pub fn emit_cleanup_error(container: &str, error: &dyn std::fmt::Display) {
    warn!(event = "container.cleanup_error", container = %container, error = %error);
}

pub fn emit_scenario_finished(scenario: &str, status: &str, duration_ms: u64) {
    info!(
        event = "scenario.finished",
        scenario = %scenario,
        status = %status,
        duration_ms = duration_ms,
    );
}

pub fn emit_gate_evaluated(gate: &str, passed: bool, detail: &str) {
    info!(event = "gate.evaluated", gate = %gate, passed = passed, detail = %detail);
}

pub fn emit_publish_completed(name: &str, version: &str, destinations: usize) {
    info!(
        event = "publish.completed",
        name = %name,
        version = %version,
        destinations = destinations,
    );
}
