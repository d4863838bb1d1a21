//! Pluggable evaluators for accepted phase output.
//!
//! - `Evaluator`: the plugin trait (deterministic or subjective)
//! - `EvaluatorRegistry`: scoped registration and isolated execution
//! - `builtin`: deterministic checks (non-empty, patterns, length)
//! - `rubric`: model-graded subjective check
//! - `EvaluatorSpec`: config-file description of a built-in evaluator

pub mod builtin;
pub mod registry;
pub mod rubric;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backend::{BackendConfig, BackendExecutor};
use crate::config::ConfigError;
use crate::domain::EvaluationResult;

pub use builtin::{LengthBounds, NonEmptyOutput, PatternEvaluator};
pub use registry::EvaluatorRegistry;
pub use rubric::RubricEvaluator;

/// What an evaluator knows about the attempt it is checking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationContext {
    pub sprint_id: String,
    pub attempt: u32,
    pub goal: String,
    pub workspace_ref: Option<String>,
}

/// A pluggable check over a phase's accepted output.
///
/// Errors are arbitrary; the registry turns them into failing results.
#[async_trait]
pub trait Evaluator: Send + Sync {
    fn name(&self) -> &str;

    /// Free-form grouping tag ("structure", "quality", ...)
    fn category(&self) -> &str;

    /// Deterministic evaluators run in both fast and full mode.
    fn is_deterministic(&self) -> bool;

    async fn evaluate(
        &self,
        phase: &str,
        output: &str,
        ctx: &EvaluationContext,
    ) -> anyhow::Result<EvaluationResult>;
}

/// Which phases an evaluator applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseScope {
    All,
    Phases(Vec<String>),
}

impl PhaseScope {
    pub fn phases<I, S>(phases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Phases(phases.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, phase: &str) -> bool {
        match self {
            Self::All => true,
            Self::Phases(phases) => phases.iter().any(|p| p == phase),
        }
    }
}

/// Which evaluators to run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationMode {
    /// Deterministic evaluators only
    Fast,
    /// Deterministic and subjective evaluators
    #[default]
    Full,
}

impl std::str::FromStr for EvaluationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "full" => Ok(Self::Full),
            other => Err(format!("unknown evaluation mode: {other}")),
        }
    }
}

fn default_threshold() -> f64 {
    0.7
}

/// Config-file description of a built-in evaluator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvaluatorKind {
    NonEmpty,
    Pattern {
        #[serde(default)]
        required: Vec<String>,
        #[serde(default)]
        forbidden: Vec<String>,
    },
    Length {
        #[serde(default)]
        min_chars: usize,
        #[serde(default)]
        max_chars: Option<usize>,
    },
    Rubric {
        rubric: String,
        provider: String,
        model: String,
        #[serde(default = "default_threshold")]
        threshold: f64,
    },
}

/// `[[evaluators]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluatorSpec {
    /// Defaults to the kind name
    #[serde(default)]
    pub name: Option<String>,
    /// Empty means all phases
    #[serde(default)]
    pub phases: Vec<String>,
    #[serde(flatten)]
    pub kind: EvaluatorKind,
}

impl EvaluatorSpec {
    pub fn scope(&self) -> PhaseScope {
        if self.phases.is_empty() {
            PhaseScope::All
        } else {
            PhaseScope::Phases(self.phases.clone())
        }
    }

    /// Instantiate the evaluator. Rubric evaluators grade through `backend`.
    pub fn build(&self, backend: Arc<dyn BackendExecutor>) -> Result<Arc<dyn Evaluator>, ConfigError> {
        let name = |default: &str| self.name.clone().unwrap_or_else(|| default.to_string());
        let evaluator: Arc<dyn Evaluator> = match &self.kind {
            EvaluatorKind::NonEmpty => Arc::new(NonEmptyOutput::named(name("non_empty"))),
            EvaluatorKind::Pattern { required, forbidden } => Arc::new(
                PatternEvaluator::new(name("pattern"), required.as_slice(), forbidden.as_slice())
                    .map_err(|e| ConfigError::Invalid(format!("bad evaluator pattern: {e}")))?,
            ),
            EvaluatorKind::Length { min_chars, max_chars } => {
                if let Some(max) = max_chars {
                    if max < min_chars {
                        return Err(ConfigError::Invalid(format!(
                            "length evaluator max_chars {max} is below min_chars {min_chars}"
                        )));
                    }
                }
                Arc::new(LengthBounds::new(name("length"), *min_chars, *max_chars))
            }
            EvaluatorKind::Rubric {
                rubric,
                provider,
                model,
                threshold,
            } => {
                if !(0.0..=1.0).contains(threshold) {
                    return Err(ConfigError::Invalid(format!(
                        "rubric threshold {threshold} is outside [0, 1]"
                    )));
                }
                Arc::new(
                    RubricEvaluator::new(name("rubric"), backend, BackendConfig::new(provider, model), rubric)
                        .with_threshold(*threshold),
                )
            }
        };
        Ok(evaluator)
    }
}
