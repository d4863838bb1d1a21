//! Room events broadcast to observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Classification of an emitted event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SprintStarted,
    PhaseStarted,
    AttemptStarted,
    CandidateCompleted,
    CandidateFailed,
    JudgeDecided,
    EvaluationCompleted,
    AttemptFailed,
    PhaseRetrying,
    CheckpointCreated,
    PhasePassed,
    PhaseEscalated,
    PhaseCancelled,
    PhaseError,
    SprintCompleted,
    SprintFailed,
    BranchCreated,
    CheckpointRewound,
    HistoryRestored,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SprintStarted => "sprint_started",
            Self::PhaseStarted => "phase_started",
            Self::AttemptStarted => "attempt_started",
            Self::CandidateCompleted => "candidate_completed",
            Self::CandidateFailed => "candidate_failed",
            Self::JudgeDecided => "judge_decided",
            Self::EvaluationCompleted => "evaluation_completed",
            Self::AttemptFailed => "attempt_failed",
            Self::PhaseRetrying => "phase_retrying",
            Self::CheckpointCreated => "checkpoint_created",
            Self::PhasePassed => "phase_passed",
            Self::PhaseEscalated => "phase_escalated",
            Self::PhaseCancelled => "phase_cancelled",
            Self::PhaseError => "phase_error",
            Self::SprintCompleted => "sprint_completed",
            Self::SprintFailed => "sprint_failed",
            Self::BranchCreated => "branch_created",
            Self::CheckpointRewound => "checkpoint_rewound",
            Self::HistoryRestored => "history_restored",
        }
    }

    /// Events after which no further events follow for the phase.
    pub fn is_phase_terminal(&self) -> bool {
        matches!(
            self,
            Self::PhasePassed | Self::PhaseEscalated | Self::PhaseCancelled | Self::PhaseError
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional tracing metadata attached to an event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl EventMeta {
    pub fn phase(phase: impl Into<String>) -> Self {
        Self {
            phase: Some(phase.into()),
            ..Self::default()
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_branch(mut self, branch: Option<String>) -> Self {
        self.branch = branch;
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

/// A sequenced event in a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Strictly increasing and gapless within the room
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// Room identifier (the sprint id)
    pub room: String,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<EventMeta>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_display_matches_serde() {
        for ty in [
            EventType::SprintStarted,
            EventType::CandidateFailed,
            EventType::PhaseEscalated,
            EventType::HistoryRestored,
        ] {
            let json = serde_json::to_string(&ty).unwrap();
            assert_eq!(json, format!("\"{}\"", ty));
        }
    }

    #[test]
    fn event_serializes_type_field() {
        let event = Event {
            id: Uuid::new_v4(),
            event_type: EventType::PhasePassed,
            sequence: 7,
            timestamp: Utc::now(),
            room: "s1".into(),
            payload: serde_json::json!({"phase": "plan"}),
            meta: None,
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "phase_passed");
        assert_eq!(v["sequence"], 7);
        assert!(v.get("meta").is_none());
    }
}
