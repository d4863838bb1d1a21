//! Deterministic built-in evaluators.

use async_trait::async_trait;
use regex::Regex;

use super::{EvaluationContext, Evaluator};
use crate::domain::{CriterionResult, EvaluationResult};

/// Fails empty or whitespace-only output.
#[derive(Debug, Clone)]
pub struct NonEmptyOutput {
    name: String,
}

impl NonEmptyOutput {
    pub fn new() -> Self {
        Self::named("non_empty")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for NonEmptyOutput {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Evaluator for NonEmptyOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> &str {
        "structure"
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    async fn evaluate(&self, _phase: &str, output: &str, _ctx: &EvaluationContext) -> anyhow::Result<EvaluationResult> {
        if output.trim().is_empty() {
            Ok(EvaluationResult::fail(&self.name, self.category(), "output is empty")
                .with_suggestion("Produce a non-empty answer for this phase"))
        } else {
            Ok(EvaluationResult::pass(&self.name, self.category()))
        }
    }
}

/// Checks required and forbidden regex patterns.
///
/// Every pattern is a criterion; the score is the fraction satisfied.
#[derive(Debug, Clone)]
pub struct PatternEvaluator {
    name: String,
    required: Vec<Regex>,
    forbidden: Vec<Regex>,
}

impl PatternEvaluator {
    pub fn new<S: AsRef<str>>(
        name: impl Into<String>,
        required: &[S],
        forbidden: &[S],
    ) -> Result<Self, regex::Error> {
        let compile = |patterns: &[S]| {
            patterns
                .iter()
                .map(|p| Regex::new(p.as_ref()))
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Self {
            name: name.into(),
            required: compile(required)?,
            forbidden: compile(forbidden)?,
        })
    }
}

#[async_trait]
impl Evaluator for PatternEvaluator {
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> &str {
        "content"
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    async fn evaluate(&self, _phase: &str, output: &str, _ctx: &EvaluationContext) -> anyhow::Result<EvaluationResult> {
        let mut criteria = Vec::new();
        let mut suggestions = Vec::new();

        for re in &self.required {
            let found = re.is_match(output);
            if !found {
                suggestions.push(format!("Include content matching `{}`", re.as_str()));
            }
            criteria.push(CriterionResult::new(format!("requires `{}`", re.as_str()), found));
        }
        for re in &self.forbidden {
            let hit = re.find(output);
            if let Some(m) = &hit {
                suggestions.push(format!("Remove content matching `{}`", re.as_str()));
                criteria.push(
                    CriterionResult::new(format!("forbids `{}`", re.as_str()), false)
                        .with_detail(format!("found `{}`", m.as_str())),
                );
            } else {
                criteria.push(CriterionResult::new(format!("forbids `{}`", re.as_str()), true));
            }
        }

        let total = criteria.len();
        let satisfied = criteria.iter().filter(|c| c.passed).count();
        let score = if total == 0 { 1.0 } else { satisfied as f64 / total as f64 };
        let passed = satisfied == total;
        let feedback = if passed {
            String::new()
        } else {
            let failed: Vec<&str> = criteria.iter().filter(|c| !c.passed).map(|c| c.name.as_str()).collect();
            format!("pattern checks failed: {}", failed.join(", "))
        };

        Ok(EvaluationResult {
            evaluator: self.name.clone(),
            category: self.category().to_string(),
            passed,
            score,
            feedback,
            criteria,
            suggestions,
        })
    }
}

/// Bounds on output length in characters.
#[derive(Debug, Clone)]
pub struct LengthBounds {
    name: String,
    min_chars: usize,
    max_chars: Option<usize>,
}

impl LengthBounds {
    pub fn new(name: impl Into<String>, min_chars: usize, max_chars: Option<usize>) -> Self {
        Self {
            name: name.into(),
            min_chars,
            max_chars,
        }
    }
}

#[async_trait]
impl Evaluator for LengthBounds {
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> &str {
        "structure"
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    async fn evaluate(&self, _phase: &str, output: &str, _ctx: &EvaluationContext) -> anyhow::Result<EvaluationResult> {
        let len = output.chars().count();
        let result = if len < self.min_chars {
            EvaluationResult::fail(
                &self.name,
                self.category(),
                format!("output has {len} characters, minimum is {}", self.min_chars),
            )
            .with_score(len as f64 / self.min_chars as f64)
            .with_suggestion("Expand the answer with the missing detail")
        } else if let Some(max) = self.max_chars.filter(|&max| len > max) {
            EvaluationResult::fail(
                &self.name,
                self.category(),
                format!("output has {len} characters, maximum is {max}"),
            )
            .with_score(max as f64 / len as f64)
            .with_suggestion("Trim the answer to the essentials")
        } else {
            EvaluationResult::pass(&self.name, self.category())
        };
        Ok(result)
    }
}
