//! Structured observability hooks for the task lifecycle.
//!
//! Every emitter logs at `info!` (warnings at `warn!`) with an `event` field
//! so JSON log pipelines can filter on it.

use tracing::{info, warn};

/// RAII guard that enters a task-scoped tracing span.
///
/// ```ignore
/// let _span = TaskSpan::enter("3f2a...");
/// // everything logged here carries task_id = "3f2a..."
/// ```
pub struct TaskSpan {
    _span: tracing::span::EnteredSpan,
}

impl TaskSpan {
    pub fn enter(task_id: &str) -> Self {
        Self {
            _span: task_span(task_id).entered(),
        }
    }
}

/// Task-scoped span for instrumenting futures (`EnteredSpan` is not `Send`).
pub fn task_span(task_id: &str) -> tracing::Span {
    tracing::info_span!("mprg.task", task_id = %task_id)
}

pub fn emit_task_submitted(task_id: &str, agent_count: u32) {
    info!(event = "task.submitted", task_id = %task_id, agent_count = agent_count);
}

pub fn emit_task_status(task_id: &str, from: &str, to: &str) {
    info!(event = "task.status", task_id = %task_id, from = %from, to = %to);
}

pub fn emit_run_completed(
    task_id: &str,
    run_index: u32,
    role: &str,
    valid: bool,
    retry_count: u32,
    elapsed_ms: u64,
) {
    info!(
        event = "run.completed",
        task_id = %task_id,
        run_index = run_index,
        role = %role,
        valid = valid,
        retry_count = retry_count,
        elapsed_ms = elapsed_ms,
    );
}

pub fn emit_run_retry(task_id: &str, run_index: u32, reason: &str) {
    info!(event = "run.retry", task_id = %task_id, run_index = run_index, reason = %reason);
}

pub fn emit_cluster_completed(task_id: &str, valid_runs: usize, families: usize) {
    info!(
        event = "cluster.completed",
        task_id = %task_id,
        valid_runs = valid_runs,
        families = families,
    );
}

pub fn emit_verdict_scored(task_id: &str, verdict: &str, families: usize, confidence: f64) {
    info!(
        event = "verdict.scored",
        task_id = %task_id,
        verdict = %verdict,
        families = families,
        confidence = confidence,
    );
}

pub fn emit_gate_evaluated(task_id: &str, decision: &str, can_override: bool) {
    info!(
        event = "gate.evaluated",
        task_id = %task_id,
        decision = %decision,
        can_override = can_override,
    );
}

/// Task moved to FAILED (warning level).
pub fn emit_task_failed(task_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "task.failed", task_id = %task_id, error = %error);
}
