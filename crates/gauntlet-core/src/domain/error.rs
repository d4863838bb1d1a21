//! Engine error taxonomy.

use gauntlet_state::StorageError;

/// Errors produced by FeedbackMemory bookkeeping.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum FeedbackError {
    #[error("phase {phase} is escalated; no further attempts may be recorded")]
    Escalated { phase: String },

    #[error("phase {phase} already recorded {max_attempts} attempts")]
    Exhausted { phase: String, max_attempts: u32 },
}

/// Errors that stop a phase or sprint.
///
/// Candidate, judge and evaluator failures never show up here: they become
/// failed candidates, degraded decisions and failing results instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("checkpoint write failed for phase {phase}: {reason}")]
    Checkpoint { phase: String, reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("record store error for sprint {sprint_id}: {source}")]
    Records {
        sprint_id: String,
        #[source]
        source: StorageError,
    },

    #[error("workspace error: {0}")]
    Workspace(String),

    #[error("sprint {sprint_id} cancelled before start")]
    Cancelled { sprint_id: String },

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("feedback error: {0}")]
    Feedback(#[from] FeedbackError),

    #[error("unknown judge: {0}")]
    UnknownJudge(String),

    #[error("no configured backend matches providers {0:?}")]
    NoBackends(Vec<String>),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
