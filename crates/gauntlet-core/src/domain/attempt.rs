//! Phase attempt lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::candidate::{Candidate, JudgeDecision};
use super::evaluation::EvaluationResult;

/// Status of a phase attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Escalated,
}

impl AttemptStatus {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Passed | Self::Failed | Self::Escalated)
    }
}

/// A single attempt at a phase.
///
/// Built up by the state machine while the attempt runs, then sealed by
/// [`PhaseAttempt::finalize`], which consumes the builder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseAttempt {
    pub phase: String,
    /// 1-based
    pub attempt: u32,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub candidates: Vec<Candidate>,
    /// Index into `candidates` of the accepted output
    pub selected: Option<usize>,
    pub decision: Option<JudgeDecision>,
    pub evaluations: Vec<EvaluationResult>,
    /// Why the attempt failed, when it did
    pub failure: Option<String>,
}

impl PhaseAttempt {
    pub fn start(phase: impl Into<String>, attempt: u32) -> Self {
        Self {
            phase: phase.into(),
            attempt,
            status: AttemptStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            candidates: Vec::new(),
            selected: None,
            decision: None,
            evaluations: Vec::new(),
            failure: None,
        }
    }

    /// The accepted candidate, if one was selected.
    pub fn selected_candidate(&self) -> Option<&Candidate> {
        self.selected.and_then(|i| self.candidates.get(i))
    }

    /// Seal the attempt with a final status.
    pub fn finalize(mut self, status: AttemptStatus) -> Self {
        debug_assert!(status.is_final());
        self.status = status;
        self.finished_at = Some(Utc::now());
        self
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64)
    }
}
