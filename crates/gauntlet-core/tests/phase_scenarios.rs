//! End-to-end phase behavior against scripted backends, judges and evaluators.

mod common;

use std::sync::Arc;

use common::{
    event_types, phase_context, registry, BrokenEvaluator, Behavior, FailingStore, FixedJudge,
    ScriptedBackend, ScriptedEvaluator,
};
use gauntlet_core::machine::EXECUTION_CHECK;
use gauntlet_core::metrics::METRICS;
use gauntlet_core::{
    AttemptStatus, BackendConfig, CancelSignal, CandidateStatus, DecisionMethod, EngineError,
    EvaluationMode, EventType, PhaseStateMachine, PhaseStatus,
};
use gauntlet_state::{CheckpointStore, SprintStatus};

fn two_backends() -> Vec<BackendConfig> {
    vec![
        BackendConfig::new("anthropic", "claude"),
        BackendConfig::new("openai", "gpt"),
    ]
}

#[tokio::test]
async fn test_judge_picks_higher_score_and_phase_advances() {
    let backend = Arc::new(
        ScriptedBackend::new()
            .with("anthropic", Behavior::Reply("plan A".into()))
            .with("openai", Behavior::Reply("plan B".into())),
    );
    let judge = Arc::new(FixedJudge::new(&[("anthropic", 0.85), ("openai", 0.42)]));
    let ctx = phase_context(
        "sprint-a",
        backend,
        two_backends(),
        judge.clone(),
        registry(vec![Arc::new(ScriptedEvaluator::new("tests", &[true]))]),
    );

    let outcome = PhaseStateMachine::default()
        .run_phase(&ctx, "plan", "ship it", &CancelSignal::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, PhaseStatus::Advanced);
    assert_eq!(outcome.attempts.len(), 1);
    assert_eq!(outcome.output.as_deref(), Some("plan A"));

    let attempt = &outcome.attempts[0];
    assert_eq!(attempt.status, AttemptStatus::Passed);
    let decision = attempt.decision.as_ref().unwrap();
    assert_eq!(decision.winner, "anthropic/claude");
    assert_eq!(decision.method, DecisionMethod::Scored);
    assert!((decision.score - 0.85).abs() < 1e-9);
    assert_eq!(judge.calls(), 1);

    let types = event_types(&ctx.emitter, "sprint-a").await;
    assert!(types.contains(&EventType::JudgeDecided));
    assert!(types.contains(&EventType::CheckpointCreated));
    assert_eq!(types.last(), Some(&EventType::PhasePassed));

    let checkpoints = ctx.checkpoints.list_checkpoints("sprint-a").await.unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].label, "plan:passed");
    assert_eq!(checkpoints[0].state.data["winner"], "anthropic/claude");
}

#[tokio::test]
async fn test_third_attempt_sees_full_history_and_final_marker() {
    let backend = Arc::new(ScriptedBackend::new().with("solo", Behavior::EchoAttempt("draft".into())));
    let ctx = phase_context(
        "sprint-b",
        backend.clone(),
        vec![BackendConfig::new("solo", "m")],
        Arc::new(FixedJudge::default()),
        registry(vec![Arc::new(ScriptedEvaluator::new("review", &[false, false, true]))]),
    );

    let outcome = PhaseStateMachine::new(3, EvaluationMode::Full)
        .run_phase(&ctx, "build", "write the parser", &CancelSignal::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, PhaseStatus::Advanced);
    assert_eq!(outcome.attempts.len(), 3);
    assert_eq!(outcome.output.as_deref(), Some("draft #3"));

    let prompts = backend.prompts_for("solo");
    assert_eq!(prompts.len(), 3);
    assert_eq!(prompts[0], "write the parser");
    assert!(prompts[1].contains("issue on attempt 1"));
    assert!(!prompts[1].contains("FINAL ATTEMPT"));
    assert!(prompts[2].contains("issue on attempt 1"));
    assert!(prompts[2].contains("issue on attempt 2"));
    assert!(prompts[2].contains("FINAL ATTEMPT (3 of 3)"));
    assert!(prompts[2].contains("cover the error paths"));

    let types = event_types(&ctx.emitter, "sprint-b").await;
    assert_eq!(types.iter().filter(|t| **t == EventType::PhaseRetrying).count(), 2);
    assert_eq!(types.iter().filter(|t| **t == EventType::AttemptFailed).count(), 2);
}

#[tokio::test]
async fn test_exhausted_retries_escalate_with_checkpoint() {
    let escalations_before = METRICS.escalations();
    let ctx = phase_context(
        "sprint-b2",
        Arc::new(ScriptedBackend::new()),
        vec![BackendConfig::new("solo", "m")],
        Arc::new(FixedJudge::default()),
        registry(vec![Arc::new(ScriptedEvaluator::new("review", &[false, false, false]))]),
    );

    let outcome = PhaseStateMachine::new(3, EvaluationMode::Full)
        .run_phase(&ctx, "build", "goal", &CancelSignal::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, PhaseStatus::Escalated);
    assert_eq!(outcome.attempts.len(), 3);
    assert_eq!(outcome.attempts[2].status, AttemptStatus::Escalated);
    assert!(outcome.escalation_reason.as_deref().unwrap().contains("review"));
    assert!(!outcome.feedback.can_retry());
    assert_eq!(outcome.feedback.insights(), ["cover the error paths".to_string()]);

    let checkpoint = outcome.checkpoint.unwrap();
    assert_eq!(checkpoint.label, "build:escalated");
    assert_eq!(checkpoint.state.status, SprintStatus::Failed);
    assert!(METRICS.escalations() > escalations_before);

    let types = event_types(&ctx.emitter, "sprint-b2").await;
    assert_eq!(types.last(), Some(&EventType::PhaseEscalated));
    assert_eq!(types.iter().filter(|t| **t == EventType::PhaseRetrying).count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_candidate_leaves_sole_success_without_judging() {
    let backend = Arc::new(
        ScriptedBackend::new()
            .with("anthropic", Behavior::Hang)
            .with("openai", Behavior::Reply("only answer".into())),
    );
    let judge = Arc::new(FixedJudge::new(&[("anthropic", 1.0), ("openai", 0.1)]));
    let ctx = phase_context(
        "sprint-c",
        backend,
        vec![
            BackendConfig::new("anthropic", "claude").with_timeout_secs(5),
            BackendConfig::new("openai", "gpt"),
        ],
        judge.clone(),
        registry(vec![]),
    );

    let outcome = PhaseStateMachine::default()
        .run_phase(&ctx, "plan", "goal", &CancelSignal::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, PhaseStatus::Advanced);
    let attempt = &outcome.attempts[0];
    assert_eq!(attempt.candidates[0].status, CandidateStatus::TimedOut);
    assert_eq!(attempt.candidates[1].status, CandidateStatus::Ok);
    assert_eq!(attempt.selected, Some(1));
    assert!(attempt.decision.is_none());
    assert_eq!(judge.calls(), 0);
    assert_eq!(outcome.output.as_deref(), Some("only answer"));

    let types = event_types(&ctx.emitter, "sprint-c").await;
    assert!(types.contains(&EventType::CandidateFailed));
    assert!(!types.contains(&EventType::JudgeDecided));
}

#[tokio::test]
async fn test_zero_successes_fail_the_attempt() {
    let backend = Arc::new(
        ScriptedBackend::new()
            .with("a", Behavior::Fail("quota".into()))
            .with("b", Behavior::Fail("500".into())),
    );
    let ctx = phase_context(
        "sprint-z",
        backend.clone(),
        vec![BackendConfig::new("a", "m"), BackendConfig::new("b", "m")],
        Arc::new(FixedJudge::default()),
        registry(vec![Arc::new(ScriptedEvaluator::new("never-run", &[]))]),
    );

    let outcome = PhaseStateMachine::new(2, EvaluationMode::Full)
        .run_phase(&ctx, "plan", "goal", &CancelSignal::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, PhaseStatus::Escalated);
    assert_eq!(backend.requests().len(), 4);
    for attempt in &outcome.attempts {
        assert!(attempt.selected.is_none());
        assert_eq!(attempt.evaluations.len(), 1);
        assert_eq!(attempt.evaluations[0].evaluator, EXECUTION_CHECK);
    }
    let types = event_types(&ctx.emitter, "sprint-z").await;
    assert!(!types.contains(&EventType::EvaluationCompleted));
}

#[tokio::test]
async fn test_evaluator_error_fails_only_itself() {
    let ctx = phase_context(
        "sprint-e",
        Arc::new(ScriptedBackend::new()),
        vec![BackendConfig::new("solo", "m")],
        Arc::new(FixedJudge::default()),
        registry(vec![
            Arc::new(BrokenEvaluator),
            Arc::new(ScriptedEvaluator::new("ok", &[true])),
        ]),
    );

    let outcome = PhaseStateMachine::new(1, EvaluationMode::Full)
        .run_phase(&ctx, "plan", "goal", &CancelSignal::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, PhaseStatus::Escalated);
    let evaluations = &outcome.attempts[0].evaluations;
    assert_eq!(evaluations.len(), 2);
    assert_eq!(evaluations[0].evaluator, "broken");
    assert!(!evaluations[0].passed);
    assert!(evaluations[0].feedback.contains("linter crashed"));
    assert!(evaluations[1].passed);
}

#[tokio::test]
async fn test_fast_mode_skips_subjective_evaluators() {
    let ctx = phase_context(
        "sprint-f",
        Arc::new(ScriptedBackend::new()),
        vec![BackendConfig::new("solo", "m")],
        Arc::new(FixedJudge::default()),
        registry(vec![Arc::new(ScriptedEvaluator::new("taste", &[false]).subjective())]),
    );

    let outcome = PhaseStateMachine::new(1, EvaluationMode::Fast)
        .run_phase(&ctx, "plan", "goal", &CancelSignal::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, PhaseStatus::Advanced);
    assert!(outcome.attempts[0].evaluations.is_empty());
}

#[tokio::test]
async fn test_judge_failure_degrades_to_self_report() {
    let backend = Arc::new(
        ScriptedBackend::new()
            .with("a", Behavior::Confident("low".into(), 0.3))
            .with("b", Behavior::Confident("high".into(), 0.9)),
    );
    let ctx = phase_context(
        "sprint-j",
        backend,
        vec![BackendConfig::new("a", "m"), BackendConfig::new("b", "m")],
        Arc::new(FixedJudge::failing()),
        registry(vec![]),
    );

    let outcome = PhaseStateMachine::default()
        .run_phase(&ctx, "plan", "goal", &CancelSignal::new())
        .await
        .unwrap();

    let decision = outcome.attempts[0].decision.as_ref().unwrap();
    assert!(decision.is_degraded());
    assert_eq!(decision.winner, "b/m");
    assert_eq!(outcome.output.as_deref(), Some("high"));

    let replay = ctx.emitter.replay("sprint-j", 0).await;
    let judged = replay
        .events
        .iter()
        .find(|e| e.event_type == EventType::JudgeDecided)
        .unwrap();
    assert_eq!(judged.payload["method"], "degraded");
}

#[tokio::test]
async fn test_checkpoint_write_failure_is_fatal() {
    let mut ctx = phase_context(
        "sprint-x",
        Arc::new(ScriptedBackend::new()),
        vec![BackendConfig::new("solo", "m")],
        Arc::new(FixedJudge::default()),
        registry(vec![]),
    );
    ctx.checkpoints = Arc::new(FailingStore::default());

    let err = PhaseStateMachine::default()
        .run_phase(&ctx, "plan", "goal", &CancelSignal::new())
        .await
        .unwrap_err();

    match err {
        EngineError::Checkpoint { phase, reason } => {
            assert_eq!(phase, "plan");
            assert!(reason.contains("disk full"));
        }
        other => panic!("unexpected error: {other}"),
    }
    let types = event_types(&ctx.emitter, "sprint-x").await;
    assert_eq!(types.last(), Some(&EventType::PhaseError));
    assert!(!types.contains(&EventType::PhasePassed));
}

#[tokio::test]
async fn test_cancel_before_first_attempt_emits_terminal_event() {
    let backend = Arc::new(ScriptedBackend::new());
    let ctx = phase_context(
        "sprint-k",
        backend.clone(),
        vec![BackendConfig::new("solo", "m")],
        Arc::new(FixedJudge::default()),
        registry(vec![]),
    );
    let cancel = CancelSignal::new();
    cancel.cancel();

    let outcome = PhaseStateMachine::default()
        .run_phase(&ctx, "plan", "goal", &cancel)
        .await
        .unwrap();

    assert_eq!(outcome.status, PhaseStatus::Cancelled);
    assert!(outcome.attempts.is_empty());
    assert!(backend.requests().is_empty());
    assert_eq!(
        event_types(&ctx.emitter, "sprint-k").await,
        vec![EventType::PhaseStarted, EventType::PhaseCancelled]
    );
}

#[tokio::test]
async fn test_branch_context_writes_to_named_branch() {
    let mut ctx = phase_context(
        "sprint-br",
        Arc::new(ScriptedBackend::new()),
        vec![BackendConfig::new("solo", "m")],
        Arc::new(FixedJudge::default()),
        registry(vec![]),
    );
    let root = ctx
        .checkpoints
        .create_checkpoint("sprint-br", "sprint:start", gauntlet_state::CheckpointState::new(SprintStatus::Active))
        .await
        .unwrap();
    let branch = ctx
        .checkpoints
        .branch_from(&root.id, gauntlet_state::BranchConfig::named("alt"))
        .await
        .unwrap();
    ctx.branch = Some(branch.name.clone());

    let outcome = PhaseStateMachine::default()
        .run_phase(&ctx, "plan", "goal", &CancelSignal::new())
        .await
        .unwrap();

    let cp = outcome.checkpoint.unwrap();
    assert_eq!(cp.branch, "alt");
    assert_eq!(cp.parent_id.as_ref(), Some(&root.id));
    let events = ctx.emitter.replay("sprint-br", 0).await.events;
    assert!(events
        .iter()
        .all(|e| e.meta.as_ref().and_then(|m| m.branch.as_deref()) == Some("alt")));
}
