//! Scripted collaborators shared by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gauntlet_core::judge::CandidateScore;
use gauntlet_core::{
    BackendConfig, BackendExecutor, BackendResponse, Candidate, CandidateExecutor, CandidateRequest,
    EmitterConfig, EvaluationContext, EvaluationResult, Evaluator, EvaluatorRegistry, Event,
    EventEmitter, EventType, Judge, JudgeBackend, ObserverTransport, PhaseContext, PhaseScope,
};
use gauntlet_state::{
    Branch, BranchConfig, Checkpoint, CheckpointId, CheckpointState, CheckpointStore, HistorySlot,
    MemoryCheckpointStore, MemorySequenceCounter, StorageError, StorageResult,
};

/// How a scripted provider answers.
#[derive(Debug, Clone)]
pub enum Behavior {
    Reply(String),
    /// Reply with a self-reported confidence
    Confident(String, f64),
    Fail(String),
    /// Sleep far past any timeout
    Hang,
    /// Reply with the attempt number appended
    EchoAttempt(String),
}

/// Backend that answers per provider and records every request.
#[derive(Default)]
pub struct ScriptedBackend {
    behaviors: HashMap<String, Behavior>,
    requests: Mutex<Vec<CandidateRequest>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(provider.to_string(), behavior);
        self
    }

    pub fn requests(&self) -> Vec<CandidateRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Prompts sent to `provider`, in call order.
    pub fn prompts_for(&self, provider: &str) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|r| r.config.provider == provider)
            .map(|r| r.prompt)
            .collect()
    }
}

#[async_trait]
impl BackendExecutor for ScriptedBackend {
    async fn run(&self, request: &CandidateRequest) -> anyhow::Result<BackendResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let behavior = self
            .behaviors
            .get(&request.config.provider)
            .cloned()
            .unwrap_or_else(|| Behavior::Reply(format!("{} output", request.config.provider)));
        match behavior {
            Behavior::Reply(text) => Ok(BackendResponse::text(text)),
            Behavior::Confident(text, confidence) => {
                let mut response = BackendResponse::text(text);
                response.self_confidence = Some(confidence);
                Ok(response)
            }
            Behavior::Fail(message) => anyhow::bail!(message),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                Ok(BackendResponse::text("too late"))
            }
            Behavior::EchoAttempt(text) => Ok(BackendResponse::text(format!("{text} #{}", request.attempt))),
        }
    }
}

/// Evaluator whose verdict depends on the attempt number.
pub struct ScriptedEvaluator {
    name: String,
    /// passed flag for attempt 1, 2, ...; missing entries pass
    verdicts: Vec<bool>,
    deterministic: bool,
}

impl ScriptedEvaluator {
    pub fn new(name: &str, verdicts: &[bool]) -> Self {
        Self {
            name: name.to_string(),
            verdicts: verdicts.to_vec(),
            deterministic: true,
        }
    }

    pub fn subjective(mut self) -> Self {
        self.deterministic = false;
        self
    }
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> &str {
        "scripted"
    }

    fn is_deterministic(&self) -> bool {
        self.deterministic
    }

    async fn evaluate(&self, _phase: &str, _output: &str, ctx: &EvaluationContext) -> anyhow::Result<EvaluationResult> {
        let index = ctx.attempt.saturating_sub(1) as usize;
        let passed = self.verdicts.get(index).copied().unwrap_or(true);
        Ok(if passed {
            EvaluationResult::pass(&self.name, self.category())
        } else {
            EvaluationResult::fail(&self.name, self.category(), format!("issue on attempt {}", ctx.attempt))
                .with_suggestion("cover the error paths")
        })
    }
}

/// Evaluator that always errors.
pub struct BrokenEvaluator;

#[async_trait]
impl Evaluator for BrokenEvaluator {
    fn name(&self) -> &str {
        "broken"
    }

    fn category(&self) -> &str {
        "scripted"
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    async fn evaluate(&self, _: &str, _: &str, _: &EvaluationContext) -> anyhow::Result<EvaluationResult> {
        anyhow::bail!("linter crashed")
    }
}

/// Judge backend with fixed scores per provider; counts invocations.
#[derive(Default)]
pub struct FixedJudge {
    scores: HashMap<String, f64>,
    calls: AtomicUsize,
    fail: bool,
}

impl FixedJudge {
    pub fn new(scores: &[(&str, f64)]) -> Self {
        Self {
            scores: scores.iter().map(|(p, s)| (p.to_string(), *s)).collect(),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JudgeBackend for FixedJudge {
    async fn score(&self, _phase: &str, candidates: &[Candidate]) -> anyhow::Result<Vec<CandidateScore>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::ensure!(!self.fail, "judge backend unavailable");
        Ok(candidates
            .iter()
            .map(|c| CandidateScore {
                score: self.scores.get(&c.provider).copied().unwrap_or(0.0),
                rationale: format!("fixed score for {}", c.provider),
                ..CandidateScore::default()
            })
            .collect())
    }
}

/// Checkpoint store whose writes fail; reads delegate to memory.
#[derive(Default)]
pub struct FailingStore {
    inner: MemoryCheckpointStore,
}

impl FailingStore {
    fn refused() -> StorageError {
        StorageError::Backend("disk full".to_string())
    }
}

#[async_trait]
impl CheckpointStore for FailingStore {
    async fn create_checkpoint(&self, _: &str, _: &str, _: CheckpointState) -> StorageResult<Checkpoint> {
        Err(Self::refused())
    }

    async fn create_checkpoint_on(
        &self,
        _: &str,
        _: &str,
        _: &str,
        _: CheckpointState,
    ) -> StorageResult<Checkpoint> {
        Err(Self::refused())
    }

    async fn insert_checkpoint(&self, _: Checkpoint) -> StorageResult<Checkpoint> {
        Err(Self::refused())
    }

    async fn branch_from(&self, id: &CheckpointId, config: BranchConfig) -> StorageResult<Branch> {
        self.inner.branch_from(id, config).await
    }

    async fn rewind(&self, sprint_id: &str, id: &CheckpointId) -> StorageResult<HistorySlot> {
        self.inner.rewind(sprint_id, id).await
    }

    async fn restore(&self, sprint_id: &str, version: u32) -> StorageResult<HistorySlot> {
        self.inner.restore(sprint_id, version).await
    }

    async fn list_checkpoints(&self, sprint_id: &str) -> StorageResult<Vec<Checkpoint>> {
        self.inner.list_checkpoints(sprint_id).await
    }

    async fn get_checkpoint(&self, id: &CheckpointId) -> StorageResult<Checkpoint> {
        self.inner.get_checkpoint(id).await
    }

    async fn lineage(&self, id: &CheckpointId) -> StorageResult<Vec<Checkpoint>> {
        self.inner.lineage(id).await
    }

    async fn current(&self, sprint_id: &str) -> StorageResult<Option<Checkpoint>> {
        self.inner.current(sprint_id).await
    }

    async fn active_branch(&self, sprint_id: &str) -> StorageResult<String> {
        self.inner.active_branch(sprint_id).await
    }

    async fn checkout(&self, sprint_id: &str, branch: &str) -> StorageResult<Branch> {
        self.inner.checkout(sprint_id, branch).await
    }

    async fn get_branch(&self, sprint_id: &str, name: &str) -> StorageResult<Branch> {
        self.inner.get_branch(sprint_id, name).await
    }

    async fn branches(&self, sprint_id: &str) -> StorageResult<Vec<Branch>> {
        self.inner.branches(sprint_id).await
    }

    async fn history(&self, sprint_id: &str) -> StorageResult<Vec<HistorySlot>> {
        self.inner.history(sprint_id).await
    }
}

/// Observer that records deliveries and refuses every `refuse_every`th sequence.
pub struct RecordingObserver {
    id: String,
    refuse_every: Option<u64>,
    delivered: Mutex<Vec<u64>>,
}

impl RecordingObserver {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            refuse_every: None,
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn refusing_every(mut self, n: u64) -> Self {
        self.refuse_every = Some(n);
        self
    }

    pub fn delivered(&self) -> Vec<u64> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObserverTransport for RecordingObserver {
    fn id(&self) -> &str {
        &self.id
    }

    async fn deliver(&self, event: &Event) -> anyhow::Result<()> {
        if let Some(n) = self.refuse_every {
            anyhow::ensure!(event.sequence % n != 0, "socket closed");
        }
        self.delivered.lock().unwrap().push(event.sequence);
        Ok(())
    }
}

pub fn emitter() -> Arc<EventEmitter> {
    Arc::new(EventEmitter::new(
        Arc::new(MemorySequenceCounter::new()),
        EmitterConfig::default(),
    ))
}

pub fn registry(evaluators: Vec<Arc<dyn Evaluator>>) -> EvaluatorRegistry {
    evaluators
        .into_iter()
        .fold(EvaluatorRegistry::new(), |r, e| r.with(e, PhaseScope::All))
}

/// A phase context over in-memory stores.
pub fn phase_context(
    sprint_id: &str,
    backend: Arc<dyn BackendExecutor>,
    backends: Vec<BackendConfig>,
    judge: Arc<dyn JudgeBackend>,
    evaluators: EvaluatorRegistry,
) -> PhaseContext {
    PhaseContext {
        sprint_id: sprint_id.to_string(),
        executor: Arc::new(CandidateExecutor::new(backend)),
        backends,
        judge: Arc::new(Judge::new("default", judge)),
        evaluators: Arc::new(evaluators),
        checkpoints: Arc::new(MemoryCheckpointStore::new()),
        emitter: emitter(),
        workspace: None,
        branch: None,
        parameters: serde_json::Value::Null,
    }
}

pub async fn event_types(emitter: &EventEmitter, room: &str) -> Vec<EventType> {
    emitter
        .replay(room, 0)
        .await
        .events
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

/// Asserts sequences run 1..=n without gaps.
pub fn assert_gapless(sequences: &[u64]) {
    for (i, seq) in sequences.iter().enumerate() {
        assert_eq!(*seq, i as u64 + 1, "sequence gap at position {i}: {sequences:?}");
    }
}
