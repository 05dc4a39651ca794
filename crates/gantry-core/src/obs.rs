//! Structured lifecycle events for pipeline runs.
//!
//! Every event carries an `event = "..."` field so log collectors can filter
//! on it. Runs are wrapped in a span from [`run_span`]; stage and operation
//! events inherit its `run_id`.

use tracing::{info, warn};

use crate::gate::GateVerdict;
use crate::outcome::{Outcome, StageStatus};
use crate::runner::OperationResult;
use crate::versioner::TaggedArtifact;

/// Span tagging everything logged during a run.
pub fn run_span(run_id: &str, pipeline: &str, build_number: u64) -> tracing::Span {
    tracing::info_span!(
        "gantry.run",
        run_id = %run_id,
        pipeline = %pipeline,
        build_number = build_number
    )
}

pub fn emit_run_started(pipeline: &str, build_number: u64, stages: usize) {
    info!(
        event = "run.started",
        pipeline = %pipeline,
        build_number = build_number,
        stages = stages,
    );
}

pub fn emit_run_finished(outcome: Outcome, duration_ms: u64, deciding_stage: Option<&str>) {
    info!(
        event = "run.finished",
        outcome = %outcome,
        duration_ms = duration_ms,
        deciding_stage = deciding_stage.unwrap_or("-"),
    );
}

pub fn emit_stage_started(stage: &str, position: usize) {
    info!(event = "stage.started", stage = %stage, position = position);
}

pub fn emit_stage_finished(stage: &str, status: StageStatus, duration_ms: u64) {
    if status == StageStatus::Failure {
        warn!(event = "stage.finished", stage = %stage, status = %status, duration_ms);
    } else {
        info!(event = "stage.finished", stage = %stage, status = %status, duration_ms);
    }
}

/// Operation results; failures include the error at warn level.
pub fn emit_operation_finished(stage: &str, result: &OperationResult) {
    if result.passed() {
        info!(
            event = "operation.finished",
            stage = %stage,
            operation = %result.operation,
            duration_ms = result.duration_ms,
        );
    } else {
        warn!(
            event = "operation.finished",
            stage = %stage,
            operation = %result.operation,
            status = ?result.status,
            exit_code = ?result.exit_code,
            error = result.error.as_deref().unwrap_or(""),
            duration_ms = result.duration_ms,
        );
    }
}

pub fn emit_gate_evaluated(correlation_id: &str, verdict: GateVerdict, passed: bool, polls: u32) {
    info!(
        event = "gate.evaluated",
        correlation_id = %correlation_id,
        verdict = %verdict,
        passed = passed,
        polls = polls,
    );
}

pub fn emit_artifact_published(artifact: &TaggedArtifact, references: &[String]) {
    info!(
        event = "artifact.published",
        artifact = %artifact.artifact.name,
        digest = %artifact.artifact.content_digest,
        references = %references.join(","),
    );
}

pub fn emit_abort_observed(stage: Option<&str>) {
    warn!(event = "run.abort_observed", stage = stage.unwrap_or("-"));
}

/// Hook failures are logged and recorded, never propagated.
pub fn emit_hook_failed(hook: &str, error: &dyn std::fmt::Display) {
    warn!(event = "hook.failed", hook = %hook, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_emitters_do_not_panic() {
        let span = run_span("run-1", "shop", 42);
        let _entered = span.enter();
        emit_run_started("shop", 42, 3);
        emit_stage_started("test", 0);
        emit_operation_finished("test", &OperationResult::succeeded("unit", Duration::ZERO));
        emit_stage_finished("test", StageStatus::Success, 10);
        emit_gate_evaluated("task-1", GateVerdict::Ok, true, 2);
        emit_abort_observed(None);
        emit_hook_failed("cleanup", &"boom");
        emit_run_finished(Outcome::Success, 100, None);
    }
}
