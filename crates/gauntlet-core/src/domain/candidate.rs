//! Candidate outputs and judge decisions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of a single backend invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Ok,
    Error,
    TimedOut,
}

/// Token accounting reported by a backend.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self { input, output }
    }

    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

/// One backend's attempt at a phase. Read-only after completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candidate {
    pub id: Uuid,
    pub provider: String,
    pub model: String,
    pub status: CandidateStatus,
    /// Output text (empty for failed candidates)
    pub output: String,
    pub tool_calls: u32,
    pub duration_ms: u64,
    pub tokens: TokenUsage,
    pub trace_ref: Option<String>,
    /// Backend's own confidence in its output, if it reports one
    pub self_confidence: Option<f64>,
    /// Failure detail for `Error` and `TimedOut`
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl Candidate {
    /// A successful candidate with the given output.
    pub fn ok(provider: impl Into<String>, model: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider: provider.into(),
            model: model.into(),
            status: CandidateStatus::Ok,
            output: output.into(),
            tool_calls: 0,
            duration_ms: 0,
            tokens: TokenUsage::default(),
            trace_ref: None,
            self_confidence: None,
            error: None,
            completed_at: Utc::now(),
        }
    }

    /// A failed candidate.
    pub fn failed(
        provider: impl Into<String>,
        model: impl Into<String>,
        status: CandidateStatus,
        error: impl Into<String>,
    ) -> Self {
        Self {
            status,
            output: String::new(),
            error: Some(error.into()),
            ..Self::ok(provider, model, "")
        }
    }

    pub fn with_tokens(mut self, tokens: TokenUsage) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.self_confidence = Some(confidence);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == CandidateStatus::Ok
    }

    /// `provider/model`
    pub fn key(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }
}

/// How a judge decision was reached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionMethod {
    /// Clear winner by judge score
    Scored,
    /// Top scores within epsilon; resolved by cost then provider name
    TieBreak,
    /// Judge unavailable; fallback selection
    Degraded,
}

/// A judge's choice among two or more successful candidates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JudgeDecision {
    /// Index of the winner in the candidate list the judge received
    pub winner_index: usize,
    pub winner_id: Uuid,
    /// `provider/model` of the winner
    pub winner: String,
    /// Winner score in [0, 1]
    pub score: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sub_scores: BTreeMap<String, f64>,
    pub rationale: String,
    pub method: DecisionMethod,
}

impl JudgeDecision {
    pub fn is_degraded(&self) -> bool {
        self.method == DecisionMethod::Degraded
    }
}
