//! Per-phase retry memory.
//!
//! `FeedbackMemory` records every attempt of one (sprint, phase) and turns
//! that history into retry context whose detail grows with the attempt
//! number:
//!
//! - attempt 1: nothing, the prompt is the bare goal
//! - attempt 2: the previous attempt's failed-evaluator feedback
//! - attempt 3+: additionally the full attempt history, recurring issues
//!   and the score trend
//!
//! The final allowed attempt is flagged explicitly. Escalation is terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{aggregate, EvaluationResult, FeedbackError};

/// Default attempt budget per phase.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Feedback from one failed evaluator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedCheck {
    pub evaluator: String,
    pub feedback: String,
}

/// Summary of one recorded attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub passed: bool,
    /// Mean evaluator score
    pub score: f64,
    pub output: String,
    pub failed: Vec<FailedCheck>,
    pub suggestions: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Compact history line for retry prompts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptSummary {
    pub attempt: u32,
    pub score: f64,
    pub passed: bool,
    pub failed: Vec<FailedCheck>,
}

impl From<&AttemptRecord> for AttemptSummary {
    fn from(r: &AttemptRecord) -> Self {
        Self {
            attempt: r.attempt,
            score: r.score,
            passed: r.passed,
            failed: r.failed.clone(),
        }
    }
}

/// Retry context for the upcoming attempt. Absent tiers are omitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OptimizationContext {
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_feedback: Option<Vec<FailedCheck>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_history: Option<Vec<AttemptSummary>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurring_issues: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_trend: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_attempt: Option<bool>,
}

impl OptimizationContext {
    pub fn is_empty(&self) -> bool {
        self.previous_feedback.is_none() && self.attempt_history.is_none()
    }
}

/// Attempt history and retry budget for one phase of one sprint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackMemory {
    sprint_id: String,
    phase: String,
    max_attempts: u32,
    attempts: Vec<AttemptRecord>,
    /// Recurring issue strings, deduplicated in first-seen order
    insights: Vec<String>,
    escalation: Option<String>,
}

impl FeedbackMemory {
    pub fn new(sprint_id: impl Into<String>, phase: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            sprint_id: sprint_id.into(),
            phase: phase.into(),
            max_attempts: max_attempts.max(1),
            attempts: Vec::new(),
            insights: Vec::new(),
            escalation: None,
        }
    }

    pub fn sprint_id(&self) -> &str {
        &self.sprint_id
    }

    pub fn phase(&self) -> &str {
        &self.phase
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    pub fn insights(&self) -> &[String] {
        &self.insights
    }

    /// Number of the next attempt to run.
    pub fn current_attempt(&self) -> u32 {
        self.attempts.len() as u32 + 1
    }

    pub fn can_retry(&self) -> bool {
        (self.attempts.len() as u32) < self.max_attempts && self.escalation.is_none()
    }

    pub fn is_final_attempt(&self) -> bool {
        self.current_attempt() == self.max_attempts
    }

    pub fn is_escalated(&self) -> bool {
        self.escalation.is_some()
    }

    pub fn escalation_reason(&self) -> Option<&str> {
        self.escalation.as_deref()
    }

    /// Mark the phase as needing a human. Later calls keep the first reason.
    pub fn escalate(&mut self, reason: impl Into<String>) {
        if self.escalation.is_none() {
            self.escalation = Some(reason.into());
        }
    }

    /// Record a finished attempt.
    pub fn add_attempt(
        &mut self,
        output: impl Into<String>,
        results: &[EvaluationResult],
    ) -> Result<AttemptRecord, FeedbackError> {
        if self.is_escalated() {
            return Err(FeedbackError::Escalated {
                phase: self.phase.clone(),
            });
        }
        if self.attempts.len() as u32 >= self.max_attempts {
            return Err(FeedbackError::Exhausted {
                phase: self.phase.clone(),
                max_attempts: self.max_attempts,
            });
        }

        let verdict = aggregate(results);
        let failed: Vec<FailedCheck> = results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| FailedCheck {
                evaluator: r.evaluator.clone(),
                feedback: r.feedback.clone(),
            })
            .collect();
        let mut suggestions: Vec<String> = Vec::new();
        for s in results.iter().flat_map(|r| &r.suggestions) {
            if !suggestions.contains(s) {
                suggestions.push(s.clone());
            }
        }

        let record = AttemptRecord {
            attempt: self.current_attempt(),
            passed: verdict.passed,
            score: verdict.score,
            output: output.into(),
            failed,
            suggestions,
            recorded_at: Utc::now(),
        };
        self.attempts.push(record.clone());
        self.refresh_insights();
        Ok(record)
    }

    fn issues(record: &AttemptRecord) -> Vec<String> {
        let mut issues: Vec<String> = record
            .failed
            .iter()
            .map(|f| f.feedback.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();
        issues.extend(record.suggestions.iter().map(|s| s.trim().to_string()));
        issues.dedup();
        issues
    }

    /// Promote issues seen in two or more attempts into the insight set.
    fn refresh_insights(&mut self) {
        let per_attempt: Vec<Vec<String>> = self.attempts.iter().map(Self::issues).collect();
        for (i, issues) in per_attempt.iter().enumerate() {
            for issue in issues {
                let seen_elsewhere = per_attempt
                    .iter()
                    .enumerate()
                    .any(|(j, other)| j != i && other.contains(issue));
                if seen_elsewhere && !self.insights.contains(issue) {
                    self.insights.push(issue.clone());
                }
            }
        }
    }

    /// Context for the upcoming attempt.
    pub fn get_optimization_context(&self) -> OptimizationContext {
        let attempt = self.current_attempt();
        let mut ctx = OptimizationContext {
            attempt,
            max_attempts: self.max_attempts,
            ..OptimizationContext::default()
        };
        let Some(last) = self.attempts.last() else {
            return ctx;
        };

        ctx.previous_feedback = Some(last.failed.clone());
        if attempt >= 3 {
            ctx.attempt_history = Some(self.attempts.iter().map(AttemptSummary::from).collect());
            ctx.recurring_issues = Some(self.insights.clone());
            ctx.score_trend = Some(self.attempts.iter().map(|a| a.score).collect());
        }
        if self.is_final_attempt() {
            ctx.final_attempt = Some(true);
        }
        ctx
    }

    /// Human-readable rendering of the optimization context.
    pub fn get_summary_for_prompt(&self) -> String {
        let ctx = self.get_optimization_context();
        let mut out = String::new();

        if let Some(history) = &ctx.attempt_history {
            out.push_str("## Previous attempts\n");
            for a in history {
                out.push_str(&format!("### Attempt {} (score {:.2})\n", a.attempt, a.score));
                for f in &a.failed {
                    out.push_str(&format!("- {}: {}\n", f.evaluator, f.feedback));
                }
            }
        } else if let Some(previous) = &ctx.previous_feedback {
            out.push_str(&format!("## Feedback from attempt {}\n", ctx.attempt - 1));
            for f in previous {
                out.push_str(&format!("- {}: {}\n", f.evaluator, f.feedback));
            }
        }

        if let Some(issues) = ctx.recurring_issues.as_ref().filter(|i| !i.is_empty()) {
            out.push_str("\n## Recurring issues\n");
            for issue in issues {
                out.push_str(&format!("- {issue}\n"));
            }
        }
        if let Some(trend) = &ctx.score_trend {
            let rendered: Vec<String> = trend.iter().map(|s| format!("{s:.2}")).collect();
            out.push_str(&format!("\nScore trend: {}\n", rendered.join(" -> ")));
        }
        if ctx.final_attempt == Some(true) {
            out.push_str(&format!(
                "\nFINAL ATTEMPT ({} of {}): address every issue above; failure escalates to a human.\n",
                ctx.attempt, ctx.max_attempts
            ));
        }
        out
    }

    /// Prompt for the upcoming attempt: the goal plus any retry context.
    pub fn build_prompt(&self, goal: &str) -> String {
        let summary = self.get_summary_for_prompt();
        if summary.is_empty() {
            goal.to_string()
        } else {
            format!("{goal}\n\n{summary}")
        }
    }
}
