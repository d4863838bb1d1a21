//! Gauntlet Core Library
//!
//! The phase execution engine: competing candidates, judging, evaluation,
//! feedback-driven retries, checkpoints and replayable room events.

pub mod backend;
pub mod command_backend;
pub mod config;
pub mod domain;
pub mod emitter;
pub mod evaluator;
pub mod executor;
pub mod feedback;
pub mod judge;
pub mod machine;
pub mod metrics;
pub mod obs;
pub mod sprint;
pub mod telemetry;
pub mod workspace;

/// Crate version, for `--version` output and report headers.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use backend::{BackendConfig, BackendExecutor, BackendResponse, CandidateRequest};
pub use command_backend::CommandBackend;
pub use config::{ConfigError, EngineConfig, JudgeSpec};

pub use domain::{
    aggregate, AttemptStatus, Candidate, CandidateStatus, CriterionResult, DecisionMethod,
    EngineError, EvaluationResult, Event, EventMeta, EventType, FeedbackError, JudgeDecision,
    PhaseAttempt, Result, TokenUsage, Verdict,
};

pub use emitter::{
    replay_digest, EmitterConfig, EmitterError, EventEmitter, ObserverTransport, ReplayBatch,
    Subscription,
};
pub use evaluator::{
    EvaluationContext, EvaluationMode, Evaluator, EvaluatorRegistry, EvaluatorSpec, LengthBounds,
    NonEmptyOutput, PatternEvaluator, PhaseScope, RubricEvaluator,
};
pub use executor::{CandidateExecutor, PromptJob};
pub use feedback::{AttemptRecord, FeedbackMemory, OptimizationContext};
pub use judge::{select_winner, Judge, JudgeBackend, Judges, ModelJudge, SelfReportJudge, Selection};
pub use machine::{CancelSignal, PhaseContext, PhaseOutcome, PhaseStateMachine, PhaseStatus};
pub use sprint::{FailureReport, SprintReport, SprintRunner};
pub use workspace::{DirWorkspaceProvider, WorkspaceHandle, WorkspaceLease, WorkspaceProvider};

pub use gauntlet_state::{
    Branch, BranchConfig, Checkpoint, CheckpointId, CheckpointState, CheckpointStore,
    MemoryCheckpointStore, MemoryRecordStore, MemorySequenceCounter, RecordStore,
    SequenceCounter, SprintStatus,
};
