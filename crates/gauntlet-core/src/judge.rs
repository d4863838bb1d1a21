//! Winner selection among competing candidates.
//!
//! A [`JudgeBackend`] scores the successful candidates; [`Judge`] turns the
//! scores into a [`JudgeDecision`] with a deterministic tie-break. When the
//! backend fails the judge falls back to self-reported confidence (or the
//! first success) and marks the decision as degraded.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::backend::{BackendConfig, BackendExecutor, CandidateRequest};
use crate::domain::{clamp_score, Candidate, DecisionMethod, JudgeDecision};
use crate::metrics::METRICS;
use crate::obs;

/// Default score window within which candidates count as tied.
pub const DEFAULT_EPSILON: f64 = 0.02;

/// Errors from [`Judge::decide`].
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum JudgeError {
    #[error("judging needs at least two successful candidates, got {0}")]
    NotEnoughCandidates(usize),
}

/// Result type for judge operations.
pub type Result<T> = std::result::Result<T, JudgeError>;

/// A judge backend's assessment of one candidate.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CandidateScore {
    pub score: f64,
    #[serde(default)]
    pub sub_scores: BTreeMap<String, f64>,
    #[serde(default)]
    pub rationale: String,
}

impl CandidateScore {
    pub fn new(score: f64) -> Self {
        Self {
            score,
            ..Self::default()
        }
    }
}

/// Scores candidates. Must return one score per candidate, in order.
#[async_trait]
pub trait JudgeBackend: Send + Sync {
    async fn score(&self, phase: &str, candidates: &[Candidate]) -> anyhow::Result<Vec<CandidateScore>>;
}

/// Scores each candidate by its own confidence report (0.5 when absent).
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfReportJudge;

#[async_trait]
impl JudgeBackend for SelfReportJudge {
    async fn score(&self, _phase: &str, candidates: &[Candidate]) -> anyhow::Result<Vec<CandidateScore>> {
        Ok(candidates
            .iter()
            .map(|c| CandidateScore {
                score: c.self_confidence.unwrap_or(0.5),
                sub_scores: BTreeMap::new(),
                rationale: "self-reported confidence".to_string(),
            })
            .collect())
    }
}

/// Asks a model backend to grade the candidates.
///
/// The backend must answer with `{"scores": [{"score": f, "rationale": s}, ...]}`
/// (one entry per candidate, in order), optionally wrapped in prose.
pub struct ModelJudge {
    backend: Arc<dyn BackendExecutor>,
    config: BackendConfig,
}

impl ModelJudge {
    pub fn new(backend: Arc<dyn BackendExecutor>, config: BackendConfig) -> Self {
        Self { backend, config }
    }

    fn prompt(phase: &str, candidates: &[Candidate]) -> String {
        let mut prompt = format!(
            "You are judging {} candidate outputs for the phase \"{phase}\".\n\
             Score each from 0 to 1 and reply with JSON: \
             {{\"scores\": [{{\"score\": <number>, \"rationale\": <string>}}, ...]}} \
             in candidate order.\n",
            candidates.len()
        );
        for (i, c) in candidates.iter().enumerate() {
            prompt.push_str(&format!("\n### Candidate {}\n{}\n", i + 1, c.output));
        }
        prompt
    }
}

#[derive(Deserialize)]
struct ScoreEnvelope {
    scores: Vec<CandidateScore>,
}

/// Extract the outermost JSON object from free-form model text.
pub(crate) fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[async_trait]
impl JudgeBackend for ModelJudge {
    async fn score(&self, phase: &str, candidates: &[Candidate]) -> anyhow::Result<Vec<CandidateScore>> {
        let request = CandidateRequest {
            sprint_id: String::new(),
            phase: phase.to_string(),
            attempt: 0,
            prompt: Self::prompt(phase, candidates),
            config: self.config.clone(),
            workspace_ref: None,
            parameters: serde_json::Value::Null,
        };
        let response =
            tokio::time::timeout(self.config.timeout(), self.backend.run(&request))
                .await
                .map_err(|_| anyhow::anyhow!("judge timed out after {}s", self.config.timeout_secs))??;
        let json = extract_json(&response.output)
            .ok_or_else(|| anyhow::anyhow!("judge reply contains no JSON object"))?;
        let envelope: ScoreEnvelope = serde_json::from_str(json)?;
        Ok(envelope.scores)
    }
}

/// Turns judge scores into a decision.
pub struct Judge {
    name: String,
    backend: Arc<dyn JudgeBackend>,
    epsilon: f64,
}

impl Judge {
    pub fn new(name: impl Into<String>, backend: Arc<dyn JudgeBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
            epsilon: DEFAULT_EPSILON,
        }
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Pick a winner among the successful candidates.
    ///
    /// `winner_index` refers to the full `candidates` slice, failed entries
    /// included.
    #[instrument(skip(self, candidates), fields(judge = %self.name, n = candidates.len()))]
    pub async fn decide(&self, phase: &str, candidates: &[Candidate]) -> Result<JudgeDecision> {
        let ok: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_ok())
            .map(|(i, _)| i)
            .collect();
        if ok.len() < 2 {
            return Err(JudgeError::NotEnoughCandidates(ok.len()));
        }
        let contenders: Vec<Candidate> = ok.iter().map(|&i| candidates[i].clone()).collect();

        let scores = match self.backend.score(phase, &contenders).await {
            Ok(scores) if scores.len() == contenders.len() => scores,
            Ok(scores) => {
                let reason = format!(
                    "judge returned {} scores for {} candidates",
                    scores.len(),
                    contenders.len()
                );
                return Ok(self.degraded(phase, candidates, &ok, &reason));
            }
            Err(e) => return Ok(self.degraded(phase, candidates, &ok, &format!("{e:#}"))),
        };
        if scores.iter().any(|s| !s.score.is_finite()) {
            return Ok(self.degraded(phase, candidates, &ok, "judge returned a non-finite score"));
        }

        let best = scores
            .iter()
            .map(|s| clamp_score(s.score))
            .fold(f64::MIN, f64::max);
        let tied: Vec<usize> = (0..contenders.len())
            .filter(|&k| best - clamp_score(scores[k].score) <= self.epsilon + f64::EPSILON)
            .collect();

        let (pick, method) = if tied.len() == 1 {
            (tied[0], DecisionMethod::Scored)
        } else {
            let pick = tied
                .iter()
                .copied()
                .min_by(|&a, &b| {
                    let (ca, cb) = (&contenders[a], &contenders[b]);
                    ca.tokens
                        .total()
                        .cmp(&cb.tokens.total())
                        .then_with(|| ca.provider.cmp(&cb.provider))
                        .then_with(|| ca.model.cmp(&cb.model))
                })
                .unwrap_or(tied[0]);
            (pick, DecisionMethod::TieBreak)
        };

        let winner = &contenders[pick];
        let chosen = &scores[pick];
        let mut rationale = chosen.rationale.clone();
        if method == DecisionMethod::TieBreak {
            let note = format!(
                "{} candidates within {:.3}; chose lowest token usage then provider name",
                tied.len(),
                self.epsilon
            );
            rationale = if rationale.is_empty() {
                note
            } else {
                format!("{rationale} ({note})")
            };
        }
        debug!(winner = %winner.key(), score = chosen.score, ?method, "judge decided");

        Ok(JudgeDecision {
            winner_index: ok[pick],
            winner_id: winner.id,
            winner: winner.key(),
            score: clamp_score(chosen.score),
            sub_scores: chosen.sub_scores.clone(),
            rationale,
            method,
        })
    }

    fn degraded(&self, phase: &str, candidates: &[Candidate], ok: &[usize], reason: &str) -> JudgeDecision {
        // Highest self-report wins; earlier candidates win ties.
        let by_confidence = ok
            .iter()
            .copied()
            .filter_map(|i| candidates[i].self_confidence.filter(|c| c.is_finite()).map(|c| (i, c)))
            .fold(None::<(usize, f64)>, |best, (i, c)| match best {
                Some((_, b)) if b >= c => best,
                _ => Some((i, c)),
            });
        let (index, score, how) = match by_confidence {
            Some((i, c)) => (i, clamp_score(c), "highest self-reported confidence"),
            None => (ok[0], 0.0, "first successful candidate"),
        };
        let winner = &candidates[index];

        METRICS.inc_degraded_decisions();
        obs::emit_judge_degraded(phase, &winner.key(), reason);

        JudgeDecision {
            winner_index: index,
            winner_id: winner.id,
            winner: winner.key(),
            score,
            sub_scores: BTreeMap::new(),
            rationale: format!("degraded: {reason}; selected {how}"),
            method: DecisionMethod::Degraded,
        }
    }
}

/// How an attempt's output was chosen.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// Exactly one candidate succeeded; no judge was involved
    Single(usize),
    /// Two or more succeeded and the judge decided
    Judged(JudgeDecision),
    /// No candidate succeeded; the attempt fails
    NoneSucceeded,
}

impl Selection {
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::Single(i) => Some(*i),
            Self::Judged(d) => Some(d.winner_index),
            Self::NoneSucceeded => None,
        }
    }
}

/// Select the attempt's output: auto-pick a lone success, judge several.
pub async fn select_winner(judge: &Judge, phase: &str, candidates: &[Candidate]) -> Selection {
    let ok: Vec<usize> = candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_ok())
        .map(|(i, _)| i)
        .collect();
    match ok.as_slice() {
        [] => Selection::NoneSucceeded,
        [only] => Selection::Single(*only),
        _ => match judge.decide(phase, candidates).await {
            Ok(decision) => Selection::Judged(decision),
            // decide only rejects fewer than two successes, ruled out above
            Err(_) => Selection::Single(ok[0]),
        },
    }
}

/// Named judges, with a default.
#[derive(Clone)]
pub struct Judges {
    default: Arc<Judge>,
    named: HashMap<String, Arc<Judge>>,
}

impl Judges {
    pub fn new(default: Judge) -> Self {
        Self {
            default: Arc::new(default),
            named: HashMap::new(),
        }
    }

    pub fn with_named(mut self, judge: Judge) -> Self {
        self.named.insert(judge.name().to_string(), Arc::new(judge));
        self
    }

    pub fn default_judge(&self) -> Arc<Judge> {
        Arc::clone(&self.default)
    }

    /// Resolve a judge by name; `None` yields the default.
    pub fn get(&self, name: Option<&str>) -> Option<Arc<Judge>> {
        match name {
            None => Some(self.default_judge()),
            Some(n) if n == self.default.name() => Some(self.default_judge()),
            Some(n) => self.named.get(n).cloned(),
        }
    }
}
