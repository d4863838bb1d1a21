//! Structured observability hooks for the phase lifecycle.
//!
//! This module provides:
//! - The phase-scoped `gauntlet.phase` span via [`phase_span`]
//! - Emission functions for key lifecycle events
//!
//! Events are emitted at `info!` level unless they signal trouble.
//! For JSON output, start the binary with `--json`.

use tracing::{info, warn};

/// Span covering one phase run, attempts and judge/evaluator logs included.
///
/// Attach it to the phase future with `tracing::Instrument`:
///
/// ```ignore
/// drive(ctx).instrument(phase_span("sprint-1", "plan", None)).await
/// ```
pub fn phase_span(sprint_id: &str, phase: &str, branch: Option<&str>) -> tracing::Span {
    tracing::info_span!(
        "gauntlet.phase",
        sprint_id = %sprint_id,
        phase = %phase,
        branch = branch.unwrap_or("main"),
    )
}

pub fn emit_phase_started(sprint_id: &str, phase: &str, max_attempts: u32) {
    info!(
        event = "phase.started",
        sprint_id = %sprint_id,
        phase = %phase,
        max_attempts = max_attempts,
    );
}

/// Emit event: phase reached a terminal outcome.
pub fn emit_phase_finished(sprint_id: &str, phase: &str, outcome: &str, attempts: u32, duration_ms: u64) {
    info!(
        event = "phase.finished",
        sprint_id = %sprint_id,
        phase = %phase,
        outcome = %outcome,
        attempts = attempts,
        duration_ms = duration_ms,
    );
}

pub fn emit_attempt_finished(phase: &str, attempt: u32, passed: bool, score: f64) {
    info!(
        event = "attempt.finished",
        phase = %phase,
        attempt = attempt,
        passed = passed,
        score = score,
    );
}

/// Emit event: the judge could not score and a fallback picked the winner.
pub fn emit_judge_degraded(phase: &str, winner: &str, reason: &str) {
    warn!(
        event = "judge.degraded",
        phase = %phase,
        winner = %winner,
        reason = %reason,
    );
}

pub fn emit_escalation(sprint_id: &str, phase: &str, reason: &str) {
    warn!(
        event = "phase.escalated",
        sprint_id = %sprint_id,
        phase = %phase,
        reason = %reason,
    );
}

pub fn emit_checkpoint_created(sprint_id: &str, checkpoint_id: &str, label: &str, sequence: u64) {
    info!(
        event = "checkpoint.created",
        sprint_id = %sprint_id,
        checkpoint_id = %checkpoint_id,
        label = %label,
        sequence = sequence,
    );
}

/// Emit event: an observer failed to take an event (warning level).
pub fn emit_delivery_failure(room: &str, observer: &str, sequence: u64, error: &dyn std::fmt::Display) {
    warn!(
        event = "observer.delivery_failed",
        room = %room,
        observer = %observer,
        sequence = sequence,
        error = %error,
    );
}
