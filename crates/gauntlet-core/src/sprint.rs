//! Sprint runner: ordered phases on top of the phase state machine.
//!
//! Owns the sprint-level lifecycle the phases don't see: record status,
//! workspace provisioning and disposal, the root checkpoint, and the
//! `sprint_*` events. Also the entry point for branch, rewind and restore,
//! so those show up in the room's event stream.

use std::sync::Arc;

use gauntlet_state::{
    Branch, BranchConfig, CheckpointId, CheckpointState, CheckpointStore, HistorySlot, RecordStore,
    SprintStatus, StorageError,
};
use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::backend::BackendConfig;
use crate::domain::{EngineError, EventMeta, EventType, PhaseAttempt, Result};
use crate::emitter::EventEmitter;
use crate::evaluator::EvaluatorRegistry;
use crate::executor::CandidateExecutor;
use crate::judge::{Judge, Judges};
use crate::machine::{CancelSignal, PhaseContext, PhaseOutcome, PhaseStateMachine, PhaseStatus};
use crate::metrics::METRICS;
use crate::obs;
use crate::workspace::{WorkspaceLease, WorkspaceProvider};

/// Label of the checkpoint taken before the first phase.
pub const START_LABEL: &str = "sprint:start";

/// Why a sprint ended up `failed`, for the human who picks it up.
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub reason: String,
    pub phase: String,
    /// Latest checkpoint written before the failure
    pub last_checkpoint: Option<CheckpointId>,
    /// Attempt history of the failing phase
    pub attempts: Vec<PhaseAttempt>,
}

/// Result of running a sprint or continuing a branch.
#[derive(Debug, Clone, Serialize)]
pub struct SprintReport {
    pub sprint_id: String,
    /// Final coarse status: `completed` or `failed`
    pub status: SprintStatus,
    /// Branch the phases ran on; `None` for the active branch
    pub branch: Option<String>,
    pub phases: Vec<PhaseOutcome>,
    pub failure: Option<FailureReport>,
}

impl SprintReport {
    pub fn is_success(&self) -> bool {
        self.status == SprintStatus::Completed
    }
}

/// Runs a sprint's phases with shared collaborators.
pub struct SprintRunner {
    records: Arc<dyn RecordStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    emitter: Arc<EventEmitter>,
    workspaces: Option<Arc<dyn WorkspaceProvider>>,
    executor: Arc<CandidateExecutor>,
    backends: Vec<BackendConfig>,
    judges: Judges,
    evaluators: Arc<EvaluatorRegistry>,
    machine: PhaseStateMachine,
}

/// What a run needs beyond the runner's own collaborators.
struct RunPlan {
    branch: Option<String>,
    phases: Vec<String>,
    backends: Vec<BackendConfig>,
    judge: Arc<Judge>,
    parameters: serde_json::Value,
    /// Output carried into the first phase's goal
    carried_output: Option<String>,
}

impl SprintRunner {
    pub fn new(
        records: Arc<dyn RecordStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        emitter: Arc<EventEmitter>,
        executor: Arc<CandidateExecutor>,
        backends: Vec<BackendConfig>,
        judges: Judges,
        evaluators: Arc<EvaluatorRegistry>,
    ) -> Self {
        Self {
            records,
            checkpoints,
            emitter,
            workspaces: None,
            executor,
            backends,
            judges,
            evaluators,
            machine: PhaseStateMachine::default(),
        }
    }

    pub fn with_workspaces(mut self, provider: Arc<dyn WorkspaceProvider>) -> Self {
        self.workspaces = Some(provider);
        self
    }

    pub fn with_machine(mut self, machine: PhaseStateMachine) -> Self {
        self.machine = machine;
        self
    }

    pub fn emitter(&self) -> &Arc<EventEmitter> {
        &self.emitter
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    /// Run `phases` in order on the sprint's active branch.
    #[instrument(skip(self, phases, cancel), fields(phases = phases.len()))]
    pub async fn run(&self, sprint_id: &str, phases: &[String], cancel: &CancelSignal) -> Result<SprintReport> {
        let plan = RunPlan {
            branch: None,
            phases: phases.to_vec(),
            backends: self.backends.clone(),
            judge: self.judges.default_judge(),
            parameters: serde_json::Value::Null,
            carried_output: None,
        };
        self.execute(sprint_id, plan, true, cancel).await
    }

    /// Resume execution on `branch` from its head, applying its overrides.
    ///
    /// A `replay_phase` override replaces `phases` with that single phase.
    #[instrument(skip(self, phases, cancel))]
    pub async fn continue_branch(
        &self,
        sprint_id: &str,
        branch: &str,
        phases: &[String],
        cancel: &CancelSignal,
    ) -> Result<SprintReport> {
        let record = self.checkpoints.get_branch(sprint_id, branch).await?;
        let config = &record.config;

        let backends = match &config.backends {
            Some(providers) => {
                let subset: Vec<BackendConfig> = self
                    .backends
                    .iter()
                    .filter(|b| providers.contains(&b.provider))
                    .cloned()
                    .collect();
                if subset.is_empty() {
                    return Err(EngineError::NoBackends(providers.clone()));
                }
                subset
            }
            None => self.backends.clone(),
        };
        let judge = self
            .judges
            .get(config.judge.as_deref())
            .ok_or_else(|| EngineError::UnknownJudge(config.judge.clone().unwrap_or_default()))?;
        let phases = match &config.replay_phase {
            Some(phase) => vec![phase.clone()],
            None => phases.to_vec(),
        };

        let head = self.checkpoints.get_checkpoint(&record.head).await?;
        let carried_output = head
            .state
            .data
            .get("output")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        self.checkpoints.checkout(sprint_id, branch).await?;
        info!(sprint_id = %sprint_id, branch = %branch, head = %record.head, "continuing branch");

        let plan = RunPlan {
            branch: Some(record.name.clone()),
            phases,
            backends,
            judge,
            parameters: config.parameters.clone(),
            carried_output,
        };
        self.execute(sprint_id, plan, false, cancel).await
    }

    /// Fork a new branch at `checkpoint_id`.
    pub async fn branch(&self, checkpoint_id: &CheckpointId, config: BranchConfig) -> Result<Branch> {
        let branch = self.checkpoints.branch_from(checkpoint_id, config).await?;
        self.emit(
            EventType::BranchCreated,
            &branch.sprint_id,
            json!({
                "branch": branch.name,
                "origin": branch.origin,
                "config": branch.config,
            }),
            Some(EventMeta::default().with_branch(Some(branch.name.clone()))),
        )
        .await;
        Ok(branch)
    }

    /// Rewind the active branch to `checkpoint_id`; the abandoned tail stays
    /// recoverable through the returned history slot.
    pub async fn rewind(&self, sprint_id: &str, checkpoint_id: &CheckpointId) -> Result<HistorySlot> {
        let slot = self.checkpoints.rewind(sprint_id, checkpoint_id).await?;
        self.emit(
            EventType::CheckpointRewound,
            sprint_id,
            json!({
                "rewound_to": slot.rewound_to,
                "previous_head": slot.previous_head,
                "history_version": slot.version,
                "archived": slot.checkpoints.len(),
            }),
            Some(EventMeta::default().with_branch(Some(slot.branch.clone()))),
        )
        .await;
        Ok(slot)
    }

    /// Bring back an archived history slot.
    pub async fn restore(&self, sprint_id: &str, version: u32) -> Result<HistorySlot> {
        let displaced = self.checkpoints.restore(sprint_id, version).await?;
        self.emit(
            EventType::HistoryRestored,
            sprint_id,
            json!({
                "restored_version": version,
                "history_version": displaced.version,
                "archived": displaced.checkpoints.len(),
            }),
            Some(EventMeta::default().with_branch(Some(displaced.branch.clone()))),
        )
        .await;
        Ok(displaced)
    }

    async fn execute(
        &self,
        sprint_id: &str,
        plan: RunPlan,
        take_root: bool,
        cancel: &CancelSignal,
    ) -> Result<SprintReport> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled {
                sprint_id: sprint_id.to_string(),
            });
        }

        let goal = self.records.goal(sprint_id).await.map_err(records_error(sprint_id))?;
        self.records
            .set_status(sprint_id, SprintStatus::Active, None)
            .await
            .map_err(records_error(sprint_id))?;
        self.emit(
            EventType::SprintStarted,
            sprint_id,
            json!({ "goal": goal, "phases": plan.phases }),
            Some(EventMeta::default().with_branch(plan.branch.clone())),
        )
        .await;

        let workspace = match self.provision(sprint_id).await {
            Ok(workspace) => workspace,
            Err(e) => return Err(self.abort(sprint_id, &plan, e).await),
        };

        let result = self
            .run_phases(sprint_id, &goal, &plan, take_root, workspace.clone(), cancel)
            .await;

        if let Some(lease) = workspace {
            if let Err(e) = lease.release().await {
                warn!(sprint_id = %sprint_id, error = %e, "workspace disposal failed");
            }
        }

        match result {
            Ok((phases, failure)) => self.conclude(sprint_id, &plan, phases, failure).await,
            Err(e) => Err(self.abort(sprint_id, &plan, e).await),
        }
    }

    async fn provision(&self, sprint_id: &str) -> Result<Option<WorkspaceLease>> {
        match &self.workspaces {
            Some(provider) => WorkspaceLease::acquire(Arc::clone(provider), sprint_id)
                .await
                .map(Some)
                .map_err(|e| EngineError::Workspace(format!("{e:#}"))),
            None => Ok(None),
        }
    }

    async fn run_phases(
        &self,
        sprint_id: &str,
        goal: &str,
        plan: &RunPlan,
        take_root: bool,
        workspace: Option<WorkspaceLease>,
        cancel: &CancelSignal,
    ) -> Result<(Vec<PhaseOutcome>, Option<FailureReport>)> {
        let mut last_checkpoint = match &plan.branch {
            Some(name) => Some(self.checkpoints.get_branch(sprint_id, name).await?.head),
            None => self.checkpoints.current(sprint_id).await?.map(|c| c.id),
        };

        if take_root {
            let state = CheckpointState::new(SprintStatus::Active)
                .with_workspace_ref(workspace.as_ref().map(|w| w.reference().to_string()))
                .with_data(json!({ "goal": goal, "phases": plan.phases }));
            let root = self
                .checkpoints
                .create_checkpoint(sprint_id, START_LABEL, state)
                .await
                .map_err(|e| EngineError::Checkpoint {
                    phase: START_LABEL.to_string(),
                    reason: e.to_string(),
                })?;
            METRICS.inc_checkpoints();
            obs::emit_checkpoint_created(sprint_id, &root.id.0, START_LABEL, root.sequence);
            self.emit(
                EventType::CheckpointCreated,
                sprint_id,
                json!({
                    "checkpoint_id": root.id,
                    "label": START_LABEL,
                    "sequence": root.sequence,
                    "parent_id": root.parent_id,
                    "branch": root.branch,
                    "state_digest": root.state_digest,
                }),
                None,
            )
            .await;
            last_checkpoint = Some(root.id);
        }

        let ctx = PhaseContext {
            sprint_id: sprint_id.to_string(),
            executor: Arc::clone(&self.executor),
            backends: plan.backends.clone(),
            judge: Arc::clone(&plan.judge),
            evaluators: Arc::clone(&self.evaluators),
            checkpoints: Arc::clone(&self.checkpoints),
            emitter: Arc::clone(&self.emitter),
            workspace,
            branch: plan.branch.clone(),
            parameters: plan.parameters.clone(),
        };

        let mut outcomes = Vec::with_capacity(plan.phases.len());
        let mut previous = plan.carried_output.clone();
        for phase in &plan.phases {
            let phase_goal = phase_goal(goal, phase, previous.as_deref());
            let outcome = self.machine.run_phase(&ctx, phase, &phase_goal, cancel).await?;
            if let Some(cp) = &outcome.checkpoint {
                last_checkpoint = Some(cp.id.clone());
            }

            let failure = match outcome.status {
                PhaseStatus::Advanced => None,
                PhaseStatus::Escalated => Some(FailureReport {
                    reason: outcome
                        .escalation_reason
                        .clone()
                        .unwrap_or_else(|| format!("phase {phase} escalated")),
                    phase: phase.clone(),
                    last_checkpoint: last_checkpoint.clone(),
                    attempts: outcome.attempts.clone(),
                }),
                PhaseStatus::Cancelled => Some(FailureReport {
                    reason: format!("cancelled during phase {phase}"),
                    phase: phase.clone(),
                    last_checkpoint: last_checkpoint.clone(),
                    attempts: outcome.attempts.clone(),
                }),
            };
            previous = outcome.output.clone();
            outcomes.push(outcome);
            if failure.is_some() {
                return Ok((outcomes, failure));
            }
        }
        Ok((outcomes, None))
    }

    async fn conclude(
        &self,
        sprint_id: &str,
        plan: &RunPlan,
        phases: Vec<PhaseOutcome>,
        failure: Option<FailureReport>,
    ) -> Result<SprintReport> {
        let meta = Some(EventMeta::default().with_branch(plan.branch.clone()));
        let status = match &failure {
            None => {
                self.records
                    .set_status(sprint_id, SprintStatus::Completed, None)
                    .await
                    .map_err(records_error(sprint_id))?;
                self.emit(
                    EventType::SprintCompleted,
                    sprint_id,
                    json!({
                        "phases": phases.iter().map(|p| &p.phase).collect::<Vec<_>>(),
                        "last_checkpoint": phases.last().and_then(|p| p.checkpoint.as_ref()).map(|c| &c.id),
                    }),
                    meta,
                )
                .await;
                SprintStatus::Completed
            }
            Some(report) => {
                let detail = json!({
                    "reason": report.reason,
                    "phase": report.phase,
                    "last_checkpoint": report.last_checkpoint,
                    "attempts": report.attempts.len(),
                });
                self.records
                    .set_status(sprint_id, SprintStatus::Failed, Some(detail.clone()))
                    .await
                    .map_err(records_error(sprint_id))?;
                self.emit(EventType::SprintFailed, sprint_id, detail, meta).await;
                SprintStatus::Failed
            }
        };
        info!(sprint_id = %sprint_id, status = ?status, phases = phases.len(), "sprint finished");

        Ok(SprintReport {
            sprint_id: sprint_id.to_string(),
            status,
            branch: plan.branch.clone(),
            phases,
            failure,
        })
    }

    /// Record an engine error as a failed sprint and hand it back.
    async fn abort(&self, sprint_id: &str, plan: &RunPlan, error: EngineError) -> EngineError {
        let detail = json!({ "error": error.to_string() });
        if let Err(e) = self
            .records
            .set_status(sprint_id, SprintStatus::Failed, Some(detail.clone()))
            .await
        {
            warn!(sprint_id = %sprint_id, error = %e, "failed to record sprint failure");
        }
        self.emit(
            EventType::SprintFailed,
            sprint_id,
            detail,
            Some(EventMeta::default().with_branch(plan.branch.clone())),
        )
        .await;
        error
    }

    async fn emit(&self, event_type: EventType, room: &str, payload: serde_json::Value, meta: Option<EventMeta>) {
        if let Err(e) = self.emitter.emit(event_type, room, payload, meta).await {
            warn!(room = %room, event_type = %event_type, error = %e, "event emission failed");
        }
    }
}

fn records_error(sprint_id: &str) -> impl Fn(StorageError) -> EngineError + '_ {
    move |source| EngineError::Records {
        sprint_id: sprint_id.to_string(),
        source,
    }
}

/// Goal handed to one phase: the sprint goal, the phase name, and the
/// previous phase's accepted output.
pub fn phase_goal(goal: &str, phase: &str, previous: Option<&str>) -> String {
    let mut out = format!("{goal}\n\n## Phase\n{phase}");
    if let Some(previous) = previous.filter(|p| !p.trim().is_empty()) {
        out.push_str("\n\n## Previous phase output\n");
        out.push_str(previous);
    }
    out
}
