//! Error types for gauntlet-state

use thiserror::Error;

/// Errors produced by the storage traits.
///
/// Lookup failures never leave partial writes behind: every operation
/// validates its inputs before touching the tree.
#[derive(Error, Debug)]
pub enum StorageError {
    /// No checkpoint with the given id exists in any sprint
    #[error("checkpoint not found: {checkpoint_id}")]
    CheckpointNotFound { checkpoint_id: String },

    /// The sprint has no checkpoint tree (or no record)
    #[error("sprint not found: {sprint_id}")]
    SprintNotFound { sprint_id: String },

    /// Branch name unknown within the sprint
    #[error("branch {branch} not found in sprint {sprint_id}")]
    BranchNotFound { sprint_id: String, branch: String },

    /// Branch name already taken within the sprint
    #[error("branch {branch} already exists in sprint {sprint_id}")]
    BranchExists { sprint_id: String, branch: String },

    /// A checkpoint with this id was already written
    #[error("checkpoint {checkpoint_id} already exists")]
    DuplicateCheckpoint { checkpoint_id: String },

    /// The declared parent would make the tree cyclic
    #[error("checkpoint {checkpoint_id} would create a cycle through parent {parent_id}")]
    CycleDetected {
        checkpoint_id: String,
        parent_id: String,
    },

    /// A non-root write without a parent, or a second root
    #[error("invalid parent for checkpoint {checkpoint_id}: {reason}")]
    InvalidParent {
        checkpoint_id: String,
        reason: String,
    },

    /// Rewind/restore target is not on the active branch lineage
    #[error("checkpoint {checkpoint_id} is not on the lineage of branch {branch}")]
    NotOnLineage {
        checkpoint_id: String,
        branch: String,
    },

    /// Unknown rewind history slot
    #[error("history version {version} not found for sprint {sprint_id}")]
    HistoryNotFound { sprint_id: String, version: u32 },

    /// The slot's checkpoints are already back in the live tree
    #[error("history version {version} of sprint {sprint_id} was already restored")]
    HistoryAlreadyRestored { sprint_id: String, version: u32 },

    /// Digest string is not 64 hex chars
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Underlying storage backend failure
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl StorageError {
    /// Whether this error reports a missing entity rather than a failed write.
    pub fn is_lookup(&self) -> bool {
        matches!(
            self,
            Self::CheckpointNotFound { .. }
                | Self::SprintNotFound { .. }
                | Self::BranchNotFound { .. }
                | Self::HistoryNotFound { .. }
        )
    }
}
