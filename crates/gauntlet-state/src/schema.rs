//! Record types for the checkpoint tree
//!
//! - `Checkpoint`: immutable node (one parent, except the root)
//! - `Branch`: named pointer into the tree plus its execution overrides
//! - `HistorySlot`: checkpoints archived by a rewind, recoverable by version

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage_traits::ContentDigest;

/// Name of the branch created with a sprint's root checkpoint.
pub const MAIN_BRANCH: &str = "main";

/// Unique identifier of a checkpoint node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointId(pub String);

impl CheckpointId {
    /// Generate a new random id
    pub fn new() -> Self {
        CheckpointId(Uuid::new_v4().to_string())
    }

    /// Short form (first 8 chars)
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl Default for CheckpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CheckpointId {
    fn from(s: &str) -> Self {
        CheckpointId(s.to_string())
    }
}

/// Coarse-grained sprint status written back to the record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SprintStatus {
    Planned,
    Active,
    Completed,
    Failed,
}

impl std::fmt::Display for SprintStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Planned => "planned",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Captured execution state stored in a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Sprint status at capture time
    pub status: SprintStatus,
    /// Phase the sprint was in (None before the first phase)
    pub current_phase: Option<String>,
    /// Opaque workspace snapshot reference
    pub workspace_ref: Option<String>,
    /// Engine-defined payload (attempt summaries, winning output, ...)
    pub data: serde_json::Value,
}

impl CheckpointState {
    pub fn new(status: SprintStatus) -> Self {
        Self {
            status,
            current_phase: None,
            workspace_ref: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.current_phase = Some(phase.into());
        self
    }

    pub fn with_workspace_ref(mut self, workspace_ref: Option<String>) -> Self {
        self.workspace_ref = workspace_ref;
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// SHA-256 over the canonical JSON form (object keys sorted).
    pub fn digest(&self) -> ContentDigest {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        ContentDigest::from_bytes(&bytes)
    }
}

/// Immutable node in a sprint's checkpoint tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub sprint_id: String,
    /// Monotonic within the sprint, across all branches
    pub sequence: u64,
    pub label: String,
    /// None only for the sprint's root
    pub parent_id: Option<CheckpointId>,
    /// Branch the checkpoint was written on
    pub branch: String,
    pub state: CheckpointState,
    pub state_digest: ContentDigest,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Build a new node. The sequence is assigned by the store on insert.
    pub fn new(
        sprint_id: &str,
        branch: &str,
        label: &str,
        parent_id: Option<CheckpointId>,
        state: CheckpointState,
    ) -> Self {
        let state_digest = state.digest();
        Checkpoint {
            id: CheckpointId::new(),
            sprint_id: sprint_id.to_string(),
            sequence: 0,
            label: label.to_string(),
            parent_id,
            branch: branch.to_string(),
            state,
            state_digest,
            created_at: Utc::now(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Overrides applied when execution continues on a branch.
///
/// The store keeps these verbatim; the engine interprets them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BranchConfig {
    /// Branch name (generated when absent)
    #[serde(default)]
    pub name: Option<String>,
    /// Restrict candidates to these backend providers
    #[serde(default)]
    pub backends: Option<Vec<String>>,
    /// Named judge to use instead of the default
    #[serde(default)]
    pub judge: Option<String>,
    /// Re-run only this phase
    #[serde(default)]
    pub replay_phase: Option<String>,
    /// Free-form parameters forwarded to backends
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl BranchConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_backends(mut self, providers: Vec<String>) -> Self {
        self.backends = Some(providers);
        self
    }

    pub fn with_judge(mut self, judge: impl Into<String>) -> Self {
        self.judge = Some(judge.into());
        self
    }

    pub fn replaying(mut self, phase: impl Into<String>) -> Self {
        self.replay_phase = Some(phase.into());
        self
    }
}

/// Named pointer into the checkpoint tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    pub sprint_id: String,
    /// Checkpoint the branch diverged from (the root for `main`)
    pub origin: CheckpointId,
    /// Latest checkpoint on the branch
    pub head: CheckpointId,
    pub config: BranchConfig,
    pub created_at: DateTime<Utc>,
}

/// Checkpoints moved out of the live tree by a rewind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySlot {
    /// 1-based, increasing per sprint
    pub version: u32,
    pub branch: String,
    /// Checkpoint the branch head was moved to
    pub rewound_to: CheckpointId,
    /// Branch head before the rewind
    pub previous_head: CheckpointId,
    /// Archived nodes, oldest first
    pub checkpoints: Vec<Checkpoint>,
    pub archived_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_digest_is_stable() {
        let a = CheckpointState::new(SprintStatus::Active)
            .with_phase("plan")
            .with_data(serde_json::json!({"b": 1, "a": 2}));
        let b = CheckpointState::new(SprintStatus::Active)
            .with_phase("plan")
            .with_data(serde_json::json!({"a": 2, "b": 1}));
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn state_digest_changes_with_phase() {
        let a = CheckpointState::new(SprintStatus::Active).with_phase("plan");
        let b = CheckpointState::new(SprintStatus::Active).with_phase("build");
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn sprint_status_serializes_snake_case() {
        let json = serde_json::to_string(&SprintStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
        assert_eq!(SprintStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn branch_config_builder() {
        let cfg = BranchConfig::named("alt")
            .with_backends(vec!["openai".into()])
            .with_judge("strict")
            .replaying("build");
        assert_eq!(cfg.name.as_deref(), Some("alt"));
        assert_eq!(cfg.backends.as_ref().unwrap().len(), 1);
        assert_eq!(cfg.judge.as_deref(), Some("strict"));
        assert_eq!(cfg.replay_phase.as_deref(), Some("build"));
    }

    #[test]
    fn new_checkpoint_carries_digest() {
        let state = CheckpointState::new(SprintStatus::Planned);
        let cp = Checkpoint::new("s1", MAIN_BRANCH, "root", None, state.clone());
        assert!(cp.is_root());
        assert_eq!(cp.state_digest, state.digest());
    }
}
