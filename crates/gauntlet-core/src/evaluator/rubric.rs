//! Model-graded subjective evaluator.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;

use super::{EvaluationContext, Evaluator};
use crate::backend::{BackendConfig, BackendExecutor, CandidateRequest};
use crate::domain::{clamp_score, EvaluationResult};
use crate::judge::extract_json;

/// Grades output against a rubric through a backend.
///
/// The backend is expected to reply with
/// `{"score": f, "feedback": s, "suggestions": [..]}`, optionally
/// surrounded by prose. The result passes when `score >= threshold`.
pub struct RubricEvaluator {
    name: String,
    backend: Arc<dyn BackendExecutor>,
    config: BackendConfig,
    rubric: String,
    threshold: f64,
}

#[derive(Deserialize)]
struct Grade {
    score: f64,
    #[serde(default)]
    feedback: String,
    #[serde(default)]
    suggestions: Vec<String>,
}

impl RubricEvaluator {
    pub fn new(
        name: impl Into<String>,
        backend: Arc<dyn BackendExecutor>,
        config: BackendConfig,
        rubric: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            backend,
            config,
            rubric: rubric.into(),
            threshold: 0.7,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    fn prompt(&self, phase: &str, output: &str, ctx: &EvaluationContext) -> String {
        format!(
            "Grade the output of phase \"{phase}\" against the rubric.\n\n\
             ## Goal\n{goal}\n\n## Rubric\n{rubric}\n\n## Output\n{output}\n\n\
             Reply with JSON: {{\"score\": <0..1>, \"feedback\": <string>, \"suggestions\": [<string>]}}",
            goal = ctx.goal,
            rubric = self.rubric,
        )
    }
}

#[async_trait]
impl Evaluator for RubricEvaluator {
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> &str {
        "quality"
    }

    fn is_deterministic(&self) -> bool {
        false
    }

    async fn evaluate(&self, phase: &str, output: &str, ctx: &EvaluationContext) -> anyhow::Result<EvaluationResult> {
        let request = CandidateRequest {
            sprint_id: ctx.sprint_id.clone(),
            phase: phase.to_string(),
            attempt: ctx.attempt,
            prompt: self.prompt(phase, output, ctx),
            config: self.config.clone(),
            workspace_ref: ctx.workspace_ref.clone(),
            parameters: serde_json::Value::Null,
        };
        let response = tokio::time::timeout(self.config.timeout(), self.backend.run(&request))
            .await
            .map_err(|_| anyhow::anyhow!("rubric grading timed out after {}s", self.config.timeout_secs))??;
        let json = extract_json(&response.output).context("grader reply contains no JSON object")?;
        let grade: Grade = serde_json::from_str(json).context("grader reply is not a valid grade")?;
        anyhow::ensure!(grade.score.is_finite(), "grader returned a non-finite score");

        let score = clamp_score(grade.score);
        Ok(EvaluationResult {
            evaluator: self.name.clone(),
            category: self.category().to_string(),
            passed: score >= self.threshold,
            score,
            feedback: grade.feedback,
            criteria: Vec::new(),
            suggestions: grade.suggestions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendResponse;

    struct Canned(&'static str);

    #[async_trait]
    impl BackendExecutor for Canned {
        async fn run(&self, _: &CandidateRequest) -> anyhow::Result<BackendResponse> {
            Ok(BackendResponse::text(self.0))
        }
    }

    fn rubric(reply: &'static str) -> RubricEvaluator {
        RubricEvaluator::new(
            "clarity",
            Arc::new(Canned(reply)),
            BackendConfig::new("grader", "m"),
            "Is it clear?",
        )
    }

    #[tokio::test]
    async fn passes_at_threshold() {
        let r = rubric(r#"Sure. {"score": 0.7, "feedback": "ok"}"#)
            .evaluate("p", "out", &EvaluationContext::default())
            .await
            .unwrap();
        assert!(r.passed);
        assert_eq!(r.category, "quality");
    }

    #[tokio::test]
    async fn fails_below_threshold_with_suggestions() {
        let r = rubric(r#"{"score": 0.4, "feedback": "vague", "suggestions": ["name the files"]}"#)
            .evaluate("p", "out", &EvaluationContext::default())
            .await
            .unwrap();
        assert!(!r.passed);
        assert_eq!(r.suggestions, vec!["name the files".to_string()]);
    }

    #[tokio::test]
    async fn garbage_reply_is_an_error() {
        let err = rubric("I refuse")
            .evaluate("p", "out", &EvaluationContext::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no JSON"));
    }

    #[test]
    fn subjective() {
        assert!(!rubric("").is_deterministic());
    }
}
