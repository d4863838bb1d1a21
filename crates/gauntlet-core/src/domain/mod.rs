//! Domain models for Gauntlet.
//!
//! Canonical definitions for the core entities:
//! - `PhaseAttempt`: one try at a phase, sealed once finished
//! - `Candidate`: one backend's output for an attempt
//! - `JudgeDecision`: winner selection among candidates
//! - `EvaluationResult`: one evaluator's verdict
//! - `Event`: sequenced room event

pub mod attempt;
pub mod candidate;
pub mod error;
pub mod evaluation;
pub mod event;

pub use attempt::{AttemptStatus, PhaseAttempt};
pub use candidate::{Candidate, CandidateStatus, DecisionMethod, JudgeDecision, TokenUsage};
pub use error::{EngineError, FeedbackError, Result};
pub use evaluation::{aggregate, clamp_score, CriterionResult, EvaluationResult, Verdict};
pub use event::{Event, EventMeta, EventType};
