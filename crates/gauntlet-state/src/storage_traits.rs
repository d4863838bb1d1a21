//! Storage trait definitions for Gauntlet
//!
//! These traits define the persistence seams the engine depends on:
//! - `CheckpointStore`: branchable checkpoint tree with recoverable rewinds
//! - `SequenceCounter`: per-room gapless sequence allocation
//! - `RecordStore`: sprint goal lookup and coarse status write-back
//!
//! All traits are async and backend-agnostic. In-memory implementations are
//! provided in the `memory` module.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;
use crate::schema::{
    Branch, BranchConfig, Checkpoint, CheckpointId, CheckpointState, HistorySlot, SprintStatus,
};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ContentDigest
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// CheckpointStore
// ---------------------------------------------------------------------------

/// Branchable checkpoint history for sprints.
///
/// Guarantees:
/// - Checkpoints are immutable once written.
/// - The tree is acyclic; every checkpoint but the root has exactly one parent,
///   and the parent belongs to the same sprint.
/// - `sequence` is strictly increasing per sprint across all branches.
/// - Branching never mutates the source checkpoint or its lineage.
/// - Rewinds archive (never discard) what lay beyond the target.
/// - Writes to one sprint are linearizable.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Append a checkpoint to the sprint's active branch.
    ///
    /// The first checkpoint of a sprint becomes the root and creates `main`.
    async fn create_checkpoint(
        &self,
        sprint_id: &str,
        label: &str,
        state: CheckpointState,
    ) -> StorageResult<Checkpoint>;

    /// Append a checkpoint to a named branch of the sprint.
    async fn create_checkpoint_on(
        &self,
        sprint_id: &str,
        branch: &str,
        label: &str,
        state: CheckpointState,
    ) -> StorageResult<Checkpoint>;

    /// Write an externally built node, validating parent and acyclicity.
    ///
    /// The node is appended to its declared branch (created if unknown when
    /// the node is a root) and receives the next sprint sequence.
    async fn insert_checkpoint(&self, checkpoint: Checkpoint) -> StorageResult<Checkpoint>;

    /// Create a branch rooted at an existing checkpoint.
    async fn branch_from(
        &self,
        checkpoint_id: &CheckpointId,
        config: BranchConfig,
    ) -> StorageResult<Branch>;

    /// Move the active branch head back to `checkpoint_id`, archiving the
    /// checkpoints beyond it into a new history slot.
    async fn rewind(
        &self,
        sprint_id: &str,
        checkpoint_id: &CheckpointId,
    ) -> StorageResult<HistorySlot>;

    /// Bring an archived slot back onto its branch.
    ///
    /// Whatever currently lies beyond the slot's rewind point is archived
    /// first, so a restore is itself recoverable. Returns that new slot.
    async fn restore(&self, sprint_id: &str, version: u32) -> StorageResult<HistorySlot>;

    /// Live (non-archived) checkpoints ordered by sequence.
    async fn list_checkpoints(&self, sprint_id: &str) -> StorageResult<Vec<Checkpoint>>;

    /// Fetch a checkpoint by id, archived or live.
    async fn get_checkpoint(&self, checkpoint_id: &CheckpointId) -> StorageResult<Checkpoint>;

    /// Ancestry from the root down to `checkpoint_id` (inclusive).
    async fn lineage(&self, checkpoint_id: &CheckpointId) -> StorageResult<Vec<Checkpoint>>;

    /// Head of the sprint's active branch, if any checkpoint exists.
    async fn current(&self, sprint_id: &str) -> StorageResult<Option<Checkpoint>>;

    /// Name of the sprint's active branch.
    async fn active_branch(&self, sprint_id: &str) -> StorageResult<String>;

    /// Make `branch` the sprint's active branch.
    async fn checkout(&self, sprint_id: &str, branch: &str) -> StorageResult<Branch>;

    /// Look up a branch by name.
    async fn get_branch(&self, sprint_id: &str, name: &str) -> StorageResult<Branch>;

    /// All branches of a sprint, ordered by creation.
    async fn branches(&self, sprint_id: &str) -> StorageResult<Vec<Branch>>;

    /// Rewind history of a sprint, oldest slot first.
    async fn history(&self, sprint_id: &str) -> StorageResult<Vec<HistorySlot>>;
}

// ---------------------------------------------------------------------------
// SequenceCounter
// ---------------------------------------------------------------------------

/// Shared counter service allocating per-room event sequence numbers.
///
/// Guarantees:
/// - The first value for a room is 1.
/// - Values are strictly increasing and gapless per room, even with
///   concurrent callers; a value is never handed out twice.
#[async_trait]
pub trait SequenceCounter: Send + Sync {
    /// Allocate the next sequence number for `room`.
    async fn next(&self, room: &str) -> StorageResult<u64>;

    /// Last allocated number for `room` (0 if none).
    async fn current(&self, room: &str) -> StorageResult<u64>;
}

// ---------------------------------------------------------------------------
// RecordStore
// ---------------------------------------------------------------------------

/// External sprint record service.
///
/// The engine only reads the goal and writes coarse status; it does not
/// own the sprint schema.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// The sprint's goal text.
    async fn goal(&self, sprint_id: &str) -> StorageResult<String>;

    /// Current status of the sprint.
    async fn status(&self, sprint_id: &str) -> StorageResult<SprintStatus>;

    /// Overwrite the sprint status, with an optional detail document.
    async fn set_status(
        &self,
        sprint_id: &str,
        status: SprintStatus,
        detail: Option<serde_json::Value>,
    ) -> StorageResult<()>;
}
