//! Evaluation results and aggregation.

use serde::{Deserialize, Serialize};

/// Pass/fail detail for a single criterion checked by an evaluator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CriterionResult {
    pub name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CriterionResult {
    pub fn new(name: impl Into<String>, passed: bool) -> Self {
        Self {
            name: name.into(),
            passed,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// One evaluator's verdict on an accepted output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationResult {
    pub evaluator: String,
    pub category: String,
    pub passed: bool,
    /// Score in [0, 1]
    pub score: f64,
    pub feedback: String,
    #[serde(default)]
    pub criteria: Vec<CriterionResult>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl EvaluationResult {
    pub fn pass(evaluator: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            evaluator: evaluator.into(),
            category: category.into(),
            passed: true,
            score: 1.0,
            feedback: String::new(),
            criteria: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    pub fn fail(
        evaluator: impl Into<String>,
        category: impl Into<String>,
        feedback: impl Into<String>,
    ) -> Self {
        Self {
            passed: false,
            score: 0.0,
            feedback: feedback.into(),
            ..Self::pass(evaluator, category)
        }
    }

    /// Failing result standing in for an evaluator that errored or panicked.
    pub fn errored(
        evaluator: impl Into<String>,
        category: impl Into<String>,
        error: impl std::fmt::Display,
    ) -> Self {
        Self::fail(evaluator, category, format!("evaluator error: {error}"))
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = clamp_score(score);
        self
    }

    pub fn with_feedback(mut self, feedback: impl Into<String>) -> Self {
        self.feedback = feedback.into();
        self
    }

    pub fn with_criterion(mut self, criterion: CriterionResult) -> Self {
        self.criteria.push(criterion);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Clamp into [0, 1]; NaN becomes 0.
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// Combined verdict over all evaluator results of an attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Verdict {
    /// Logical AND of every result's `passed`
    pub passed: bool,
    /// Mean of the individual scores (informational)
    pub score: f64,
    /// Names of evaluators that failed
    pub failed: Vec<String>,
}

/// Aggregate evaluator results. An empty result set passes with score 1.0.
pub fn aggregate(results: &[EvaluationResult]) -> Verdict {
    if results.is_empty() {
        return Verdict {
            passed: true,
            score: 1.0,
            failed: Vec::new(),
        };
    }
    let failed: Vec<String> = results
        .iter()
        .filter(|r| !r.passed)
        .map(|r| r.evaluator.clone())
        .collect();
    let score = results.iter().map(|r| clamp_score(r.score)).sum::<f64>() / results.len() as f64;
    Verdict {
        passed: failed.is_empty(),
        score,
        failed,
    }
}
