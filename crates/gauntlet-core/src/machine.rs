//! Phase state machine.
//!
//! `run_phase` drives one phase to a terminal outcome. Attempts run strictly
//! one after another, since each prompt depends on the feedback recorded by
//! the previous attempt; within an attempt the candidates race in parallel.
//!
//! ```text
//! pending -> running -> passed --checkpoint--> advanced
//!                    -> failed  -> retrying (budget left)
//!                               -> escalated (budget spent, checkpoint)
//! any suspension point -> cancelled
//! ```
//!
//! Every transition is emitted to the sprint's room. Emission failures are
//! logged and never stop the phase; checkpoint failures always do.

use std::sync::Arc;
use std::time::Instant;

use gauntlet_state::{Checkpoint, CheckpointState, CheckpointStore, SprintStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, warn, Instrument};

use crate::backend::BackendConfig;
use crate::domain::{
    AttemptStatus, EngineError, EvaluationResult, EventMeta, EventType, PhaseAttempt, Result,
};
use crate::emitter::EventEmitter;
use crate::evaluator::{EvaluationContext, EvaluationMode, EvaluatorRegistry};
use crate::executor::{CandidateExecutor, PromptJob};
use crate::feedback::{AttemptRecord, FeedbackMemory, DEFAULT_MAX_ATTEMPTS};
use crate::judge::{select_winner, Judge, Selection};
use crate::metrics::METRICS;
use crate::obs;
use crate::workspace::WorkspaceLease;

/// Evaluator name recorded when no candidate produced output.
pub const EXECUTION_CHECK: &str = "candidate_execution";

/// Cooperative cancellation shared by everything working on a sprint.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone without cancelling: never fires.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Everything a phase needs from the sprint around it.
pub struct PhaseContext {
    pub sprint_id: String,
    pub executor: Arc<CandidateExecutor>,
    pub backends: Vec<BackendConfig>,
    pub judge: Arc<Judge>,
    pub evaluators: Arc<EvaluatorRegistry>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub emitter: Arc<EventEmitter>,
    pub workspace: Option<WorkspaceLease>,
    /// Branch to append checkpoints to; `None` means the active branch
    pub branch: Option<String>,
    /// Forwarded to backends untouched
    pub parameters: serde_json::Value,
}

impl PhaseContext {
    fn meta(&self, phase: &str) -> EventMeta {
        EventMeta::phase(phase).with_branch(self.branch.clone())
    }

    fn workspace_ref(&self) -> Option<String> {
        self.workspace.as_ref().map(|w| w.reference().to_string())
    }

    async fn emit(&self, event_type: EventType, payload: serde_json::Value, meta: EventMeta) {
        if let Err(e) = self
            .emitter
            .emit(event_type, &self.sprint_id, payload, Some(meta))
            .await
        {
            warn!(sprint_id = %self.sprint_id, event_type = %event_type, error = %e, "event emission failed");
        }
    }
}

/// Terminal state of a phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Advanced,
    Escalated,
    Cancelled,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Advanced => "advanced",
            Self::Escalated => "escalated",
            Self::Cancelled => "cancelled",
        }
    }
}

/// What `run_phase` hands back.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseOutcome {
    pub phase: String,
    pub status: PhaseStatus,
    /// Finalized attempts, in order
    pub attempts: Vec<PhaseAttempt>,
    /// Success or escalation checkpoint; none when cancelled
    pub checkpoint: Option<Checkpoint>,
    /// Accepted output of the passing attempt
    pub output: Option<String>,
    pub escalation_reason: Option<String>,
    pub feedback: FeedbackMemory,
}

impl PhaseOutcome {
    pub fn is_advanced(&self) -> bool {
        self.status == PhaseStatus::Advanced
    }

    pub fn last_attempt(&self) -> Option<&PhaseAttempt> {
        self.attempts.last()
    }
}

enum AttemptRun {
    Finished(PhaseAttempt, AttemptRecord),
    Cancelled(PhaseAttempt),
}

/// Retry budget and evaluation depth for every phase it runs.
#[derive(Debug, Clone, Copy)]
pub struct PhaseStateMachine {
    max_attempts: u32,
    evaluation_mode: EvaluationMode,
}

impl Default for PhaseStateMachine {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, EvaluationMode::Full)
    }
}

impl PhaseStateMachine {
    pub fn new(max_attempts: u32, evaluation_mode: EvaluationMode) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            evaluation_mode,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn evaluation_mode(&self) -> EvaluationMode {
        self.evaluation_mode
    }

    /// Drive `phase` until it advances, escalates or is cancelled.
    ///
    /// Only a checkpoint write failure is an error; everything a backend,
    /// judge or evaluator does wrong becomes part of the outcome.
    pub async fn run_phase(
        &self,
        ctx: &PhaseContext,
        phase: &str,
        goal: &str,
        cancel: &CancelSignal,
    ) -> Result<PhaseOutcome> {
        let span = obs::phase_span(&ctx.sprint_id, phase, ctx.branch.as_deref());
        self.drive(ctx, phase, goal, cancel).instrument(span).await
    }

    async fn drive(
        &self,
        ctx: &PhaseContext,
        phase: &str,
        goal: &str,
        cancel: &CancelSignal,
    ) -> Result<PhaseOutcome> {
        let started = Instant::now();
        let mut feedback = FeedbackMemory::new(&ctx.sprint_id, phase, self.max_attempts);
        let mut attempts: Vec<PhaseAttempt> = Vec::new();

        obs::emit_phase_started(&ctx.sprint_id, phase, self.max_attempts);
        ctx.emit(
            EventType::PhaseStarted,
            json!({ "phase": phase, "max_attempts": self.max_attempts }),
            ctx.meta(phase),
        )
        .await;

        while feedback.can_retry() {
            if cancel.is_cancelled() {
                return Ok(self.cancelled(ctx, phase, attempts, feedback, started).await);
            }

            match self.run_attempt(ctx, phase, goal, &mut feedback, cancel).await? {
                AttemptRun::Cancelled(attempt) => {
                    attempts.push(attempt.finalize(AttemptStatus::Failed));
                    return Ok(self.cancelled(ctx, phase, attempts, feedback, started).await);
                }
                AttemptRun::Finished(attempt, record) => {
                    obs::emit_attempt_finished(phase, record.attempt, record.passed, record.score);
                    let meta = ctx.meta(phase).with_attempt(record.attempt);

                    if record.passed {
                        let attempt = attempt.finalize(AttemptStatus::Passed);
                        let checkpoint = self
                            .checkpoint(ctx, phase, SprintStatus::Active, "passed", &attempt, &record)
                            .await?;
                        ctx.emit(
                            EventType::PhasePassed,
                            json!({
                                "phase": phase,
                                "attempt": record.attempt,
                                "score": record.score,
                                "checkpoint_id": checkpoint.id,
                            }),
                            meta,
                        )
                        .await;
                        attempts.push(attempt);
                        finish(ctx, phase, PhaseStatus::Advanced, attempts.len(), started);
                        return Ok(PhaseOutcome {
                            phase: phase.to_string(),
                            status: PhaseStatus::Advanced,
                            attempts,
                            checkpoint: Some(checkpoint),
                            output: Some(record.output),
                            escalation_reason: None,
                            feedback,
                        });
                    }

                    ctx.emit(
                        EventType::AttemptFailed,
                        json!({
                            "phase": phase,
                            "attempt": record.attempt,
                            "score": record.score,
                            "failed": record.failed,
                        }),
                        meta.clone(),
                    )
                    .await;
                    attempts.push(attempt.finalize(AttemptStatus::Failed));

                    if feedback.can_retry() {
                        METRICS.inc_retries();
                        ctx.emit(
                            EventType::PhaseRetrying,
                            json!({
                                "phase": phase,
                                "next_attempt": feedback.current_attempt(),
                                "context": feedback.get_optimization_context(),
                            }),
                            meta,
                        )
                        .await;
                    }
                }
            }
        }

        self.escalate(ctx, phase, attempts, feedback, started).await
    }

    async fn run_attempt(
        &self,
        ctx: &PhaseContext,
        phase: &str,
        goal: &str,
        feedback: &mut FeedbackMemory,
        cancel: &CancelSignal,
    ) -> Result<AttemptRun> {
        let n = feedback.current_attempt();
        let mut attempt = PhaseAttempt::start(phase, n);
        let meta = ctx.meta(phase).with_attempt(n);
        METRICS.inc_attempts();

        ctx.emit(
            EventType::AttemptStarted,
            json!({
                "phase": phase,
                "attempt": n,
                "max_attempts": feedback.max_attempts(),
                "backends": ctx.backends.iter().map(BackendConfig::key).collect::<Vec<_>>(),
                "context": feedback.get_optimization_context(),
            }),
            meta.clone(),
        )
        .await;

        let job = PromptJob {
            sprint_id: ctx.sprint_id.clone(),
            phase: phase.to_string(),
            attempt: n,
            prompt: feedback.build_prompt(goal),
            workspace_ref: ctx.workspace_ref(),
            parameters: ctx.parameters.clone(),
        };
        let candidates = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                attempt.failure = Some("cancelled while candidates were running".into());
                return Ok(AttemptRun::Cancelled(attempt));
            }
            candidates = ctx.executor.run_all(&job, &ctx.backends) => candidates,
        };
        attempt.candidates = candidates;

        for candidate in &attempt.candidates {
            let event_type = if candidate.is_ok() {
                EventType::CandidateCompleted
            } else {
                EventType::CandidateFailed
            };
            ctx.emit(
                event_type,
                json!({
                    "candidate_id": candidate.id,
                    "provider": candidate.provider,
                    "model": candidate.model,
                    "status": candidate.status,
                    "duration_ms": candidate.duration_ms,
                    "tokens": candidate.tokens,
                    "trace_ref": candidate.trace_ref,
                    "error": candidate.error,
                }),
                meta.clone(),
            )
            .await;
        }

        let selection = select_winner(&ctx.judge, phase, &attempt.candidates).await;
        if let Selection::Judged(decision) = &selection {
            ctx.emit(
                EventType::JudgeDecided,
                json!({
                    "judge": ctx.judge.name(),
                    "winner": decision.winner,
                    "winner_id": decision.winner_id,
                    "score": decision.score,
                    "sub_scores": decision.sub_scores,
                    "rationale": decision.rationale,
                    "method": decision.method,
                }),
                meta.clone(),
            )
            .await;
            attempt.decision = Some(decision.clone());
        }
        attempt.selected = selection.index();

        let output = attempt
            .selected_candidate()
            .map(|c| c.output.clone())
            .unwrap_or_default();

        let results = match attempt.selected {
            None => {
                attempt.failure = Some("no candidate succeeded".into());
                vec![EvaluationResult::fail(
                    EXECUTION_CHECK,
                    "execution",
                    format!("all {} candidates failed", attempt.candidates.len()),
                )
                .with_suggestion("Produce output the backends can complete within their limits")]
            }
            Some(_) => {
                let eval_ctx = EvaluationContext {
                    sprint_id: ctx.sprint_id.clone(),
                    attempt: n,
                    goal: goal.to_string(),
                    workspace_ref: ctx.workspace_ref(),
                };
                let results = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        attempt.failure = Some("cancelled during evaluation".into());
                        return Ok(AttemptRun::Cancelled(attempt));
                    }
                    results = ctx.evaluators.evaluate(phase, &output, &eval_ctx, self.evaluation_mode) => results,
                };
                ctx.emit(
                    EventType::EvaluationCompleted,
                    json!({
                        "phase": phase,
                        "attempt": n,
                        "results": results,
                    }),
                    meta,
                )
                .await;
                results
            }
        };

        let record = feedback.add_attempt(output, &results)?;
        if !record.passed && attempt.failure.is_none() {
            let names: Vec<&str> = record.failed.iter().map(|f| f.evaluator.as_str()).collect();
            attempt.failure = Some(format!("failed evaluators: {}", names.join(", ")));
        }
        attempt.evaluations = results;
        Ok(AttemptRun::Finished(attempt, record))
    }

    async fn escalate(
        &self,
        ctx: &PhaseContext,
        phase: &str,
        mut attempts: Vec<PhaseAttempt>,
        mut feedback: FeedbackMemory,
        started: Instant,
    ) -> Result<PhaseOutcome> {
        let last_failure = attempts
            .last()
            .and_then(|a| a.failure.clone())
            .unwrap_or_else(|| "no attempts recorded".to_string());
        let reason = format!(
            "phase {phase} failed all {} attempts; last: {last_failure}",
            feedback.max_attempts()
        );
        feedback.escalate(reason.clone());
        if let Some(last) = attempts.last_mut() {
            last.status = AttemptStatus::Escalated;
        }

        let checkpoint = match (attempts.last(), feedback.attempts().last()) {
            (Some(attempt), Some(record)) => Some(
                self.checkpoint(ctx, phase, SprintStatus::Failed, "escalated", attempt, record)
                    .await?,
            ),
            _ => None,
        };

        METRICS.inc_escalations();
        obs::emit_escalation(&ctx.sprint_id, phase, &reason);
        ctx.emit(
            EventType::PhaseEscalated,
            json!({
                "phase": phase,
                "reason": reason,
                "attempts": attempts.len(),
                "checkpoint_id": checkpoint.as_ref().map(|c| &c.id),
                "insights": feedback.insights(),
            }),
            ctx.meta(phase),
        )
        .await;
        finish(ctx, phase, PhaseStatus::Escalated, attempts.len(), started);

        Ok(PhaseOutcome {
            phase: phase.to_string(),
            status: PhaseStatus::Escalated,
            attempts,
            checkpoint,
            output: None,
            escalation_reason: Some(reason),
            feedback,
        })
    }

    async fn cancelled(
        &self,
        ctx: &PhaseContext,
        phase: &str,
        attempts: Vec<PhaseAttempt>,
        feedback: FeedbackMemory,
        started: Instant,
    ) -> PhaseOutcome {
        ctx.emit(
            EventType::PhaseCancelled,
            json!({ "phase": phase, "attempts": attempts.len() }),
            ctx.meta(phase),
        )
        .await;
        finish(ctx, phase, PhaseStatus::Cancelled, attempts.len(), started);
        PhaseOutcome {
            phase: phase.to_string(),
            status: PhaseStatus::Cancelled,
            attempts,
            checkpoint: None,
            output: None,
            escalation_reason: None,
            feedback,
        }
    }

    /// Snapshot the workspace and write the attempt's checkpoint.
    ///
    /// A failure emits `phase_error` and aborts the phase.
    async fn checkpoint(
        &self,
        ctx: &PhaseContext,
        phase: &str,
        status: SprintStatus,
        suffix: &str,
        attempt: &PhaseAttempt,
        record: &AttemptRecord,
    ) -> Result<Checkpoint> {
        let label = format!("{phase}:{suffix}");
        let data = json!({
            "phase": phase,
            "attempt": record.attempt,
            "output": record.output,
            "score": record.score,
            "winner": attempt.selected_candidate().map(|c| c.key()),
            "failed": record.failed,
        });

        match persist(ctx, phase, &label, status, data).await {
            Ok(checkpoint) => {
                METRICS.inc_checkpoints();
                obs::emit_checkpoint_created(&ctx.sprint_id, &checkpoint.id.0, &label, checkpoint.sequence);
                ctx.emit(
                    EventType::CheckpointCreated,
                    json!({
                        "checkpoint_id": checkpoint.id,
                        "label": label,
                        "sequence": checkpoint.sequence,
                        "parent_id": checkpoint.parent_id,
                        "branch": checkpoint.branch,
                        "state_digest": checkpoint.state_digest,
                    }),
                    ctx.meta(phase).with_attempt(record.attempt),
                )
                .await;
                Ok(checkpoint)
            }
            Err(reason) => {
                error!(sprint_id = %ctx.sprint_id, phase = %phase, reason = %reason, "checkpoint write failed");
                ctx.emit(
                    EventType::PhaseError,
                    json!({ "phase": phase, "attempt": record.attempt, "reason": reason }),
                    ctx.meta(phase).with_attempt(record.attempt),
                )
                .await;
                Err(EngineError::Checkpoint {
                    phase: phase.to_string(),
                    reason,
                })
            }
        }
    }
}

async fn persist(
    ctx: &PhaseContext,
    phase: &str,
    label: &str,
    status: SprintStatus,
    data: serde_json::Value,
) -> std::result::Result<Checkpoint, String> {
    let workspace_ref = match &ctx.workspace {
        Some(lease) => Some(
            lease
                .snapshot(label)
                .await
                .map_err(|e| format!("workspace snapshot failed: {e:#}"))?,
        ),
        None => None,
    };
    let state = CheckpointState::new(status)
        .with_phase(phase)
        .with_workspace_ref(workspace_ref)
        .with_data(data);

    let written = match &ctx.branch {
        Some(branch) => {
            ctx.checkpoints
                .create_checkpoint_on(&ctx.sprint_id, branch, label, state)
                .await
        }
        None => ctx.checkpoints.create_checkpoint(&ctx.sprint_id, label, state).await,
    };
    written.map_err(|e| e.to_string())
}

fn finish(ctx: &PhaseContext, phase: &str, status: PhaseStatus, attempts: usize, started: Instant) {
    obs::emit_phase_finished(
        &ctx.sprint_id,
        phase,
        status.as_str(),
        attempts as u32,
        started.elapsed().as_millis() as u64,
    );
}
