//! Evaluator registration and isolated execution.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{instrument, warn};

use super::{EvaluationContext, EvaluationMode, Evaluator, PhaseScope};
use crate::domain::{clamp_score, EvaluationResult};
use crate::executor::AbortOnDrop;

struct Entry {
    evaluator: Arc<dyn Evaluator>,
    scope: PhaseScope,
}

/// Evaluators registered for all phases or a phase subset.
///
/// Built once at startup and shared by reference with the state machine.
#[derive(Default)]
pub struct EvaluatorRegistry {
    entries: Vec<Entry>,
}

impl EvaluatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, evaluator: Arc<dyn Evaluator>, scope: PhaseScope) {
        self.entries.push(Entry { evaluator, scope });
    }

    /// Builder-style `register`.
    pub fn with(mut self, evaluator: Arc<dyn Evaluator>, scope: PhaseScope) -> Self {
        self.register(evaluator, scope);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evaluators that apply to `phase` under `mode`, in registration order.
    pub fn evaluators_for(&self, phase: &str, mode: EvaluationMode) -> Vec<Arc<dyn Evaluator>> {
        self.entries
            .iter()
            .filter(|e| e.scope.matches(phase))
            .filter(|e| mode == EvaluationMode::Full || e.evaluator.is_deterministic())
            .map(|e| Arc::clone(&e.evaluator))
            .collect()
    }

    /// Run every applicable evaluator in its own task.
    ///
    /// An evaluator that errors or panics yields a failing result under its
    /// own name; the others are unaffected. Results keep registration order.
    /// Dropping the returned future aborts evaluators still running.
    #[instrument(skip(self, output, ctx), fields(attempt = ctx.attempt))]
    pub async fn evaluate(
        &self,
        phase: &str,
        output: &str,
        ctx: &EvaluationContext,
        mode: EvaluationMode,
    ) -> Vec<EvaluationResult> {
        let evaluators = self.evaluators_for(phase, mode);
        let output: Arc<str> = Arc::from(output);
        let ctx = Arc::new(ctx.clone());

        let tasks: Vec<_> = evaluators
            .iter()
            .map(|evaluator| {
                let evaluator = Arc::clone(evaluator);
                let phase = phase.to_string();
                let output = Arc::clone(&output);
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move { evaluator.evaluate(&phase, &output, &ctx).await })
            })
            .collect();
        let _abort = AbortOnDrop(tasks.iter().map(|t| t.abort_handle()).collect());

        join_all(tasks)
            .await
            .into_iter()
            .zip(&evaluators)
            .map(|(joined, evaluator)| {
                let (name, category) = (evaluator.name(), evaluator.category());
                match joined {
                    Ok(Ok(mut result)) => {
                        result.score = clamp_score(result.score);
                        result
                    }
                    Ok(Err(e)) => {
                        warn!(evaluator = %name, error = %e, "evaluator failed");
                        EvaluationResult::errored(name, category, format!("{e:#}"))
                    }
                    Err(e) => {
                        warn!(evaluator = %name, error = %e, "evaluator panicked");
                        EvaluationResult::errored(name, category, format!("panicked: {e}"))
                    }
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregate;
    use async_trait::async_trait;

    struct Stub {
        name: &'static str,
        deterministic: bool,
        behavior: &'static str,
    }

    #[async_trait]
    impl Evaluator for Stub {
        fn name(&self) -> &str {
            self.name
        }
        fn category(&self) -> &str {
            "test"
        }
        fn is_deterministic(&self) -> bool {
            self.deterministic
        }
        async fn evaluate(&self, _: &str, _: &str, _: &EvaluationContext) -> anyhow::Result<EvaluationResult> {
            match self.behavior {
                "pass" => Ok(EvaluationResult::pass(self.name, "test")),
                "fail" => Ok(EvaluationResult::fail(self.name, "test", "bad output")),
                "error" => anyhow::bail!("linter crashed"),
                _ => panic!("evaluator bug"),
            }
        }
    }

    fn stub(name: &'static str, deterministic: bool, behavior: &'static str) -> Arc<dyn Evaluator> {
        Arc::new(Stub {
            name,
            deterministic,
            behavior,
        })
    }

    #[test]
    fn fast_mode_skips_subjective() {
        let reg = EvaluatorRegistry::new()
            .with(stub("det", true, "pass"), PhaseScope::All)
            .with(stub("subj", false, "pass"), PhaseScope::All);
        assert_eq!(reg.evaluators_for("p", EvaluationMode::Fast).len(), 1);
        assert_eq!(reg.evaluators_for("p", EvaluationMode::Full).len(), 2);
    }

    #[test]
    fn scope_filters_phases() {
        let reg = EvaluatorRegistry::new()
            .with(stub("all", true, "pass"), PhaseScope::All)
            .with(stub("build-only", true, "pass"), PhaseScope::phases(["build"]));
        assert_eq!(reg.evaluators_for("plan", EvaluationMode::Full).len(), 1);
        assert_eq!(reg.evaluators_for("build", EvaluationMode::Full).len(), 2);
    }

    #[tokio::test]
    async fn errors_and_panics_become_failing_results() {
        let reg = EvaluatorRegistry::new()
            .with(stub("ok", true, "pass"), PhaseScope::All)
            .with(stub("err", true, "error"), PhaseScope::All)
            .with(stub("boom", true, "panic"), PhaseScope::All)
            .with(stub("also-ok", true, "pass"), PhaseScope::All);
        let results = reg
            .evaluate("p", "output", &EvaluationContext::default(), EvaluationMode::Full)
            .await;

        let names: Vec<_> = results.iter().map(|r| r.evaluator.as_str()).collect();
        assert_eq!(names, vec!["ok", "err", "boom", "also-ok"]);
        assert!(results[0].passed);
        assert!(!results[1].passed);
        assert!(results[1].feedback.contains("linter crashed"));
        assert!(!results[2].passed);
        assert!(results[3].passed);

        let verdict = aggregate(&results);
        assert!(!verdict.passed);
        assert_eq!(verdict.failed, vec!["err".to_string(), "boom".to_string()]);
    }

    struct Slow(Arc<std::sync::atomic::AtomicBool>);

    #[async_trait]
    impl Evaluator for Slow {
        fn name(&self) -> &str {
            "slow"
        }
        fn category(&self) -> &str {
            "test"
        }
        fn is_deterministic(&self) -> bool {
            false
        }
        async fn evaluate(&self, _: &str, _: &str, _: &EvaluationContext) -> anyhow::Result<EvaluationResult> {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(EvaluationResult::pass("slow", "test"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_evaluation_aborts_running_evaluators() {
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let reg = EvaluatorRegistry::new().with(Arc::new(Slow(Arc::clone(&finished))), PhaseScope::All);

        let ctx = EvaluationContext::default();
        let cut_short = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            reg.evaluate("p", "out", &ctx, EvaluationMode::Full),
        )
        .await;
        assert!(cut_short.is_err());

        tokio::time::sleep(std::time::Duration::from_secs(120)).await;
        assert!(!finished.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn no_applicable_evaluators_passes() {
        let reg = EvaluatorRegistry::new().with(stub("x", true, "fail"), PhaseScope::phases(["other"]));
        let results = reg
            .evaluate("p", "", &EvaluationContext::default(), EvaluationMode::Full)
            .await;
        assert!(results.is_empty());
        assert!(aggregate(&results).passed);
    }
}
