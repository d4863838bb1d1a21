//! In-memory implementations of the storage traits
//!
//! Provides `MemoryCheckpointStore`, `MemorySequenceCounter`, and
//! `MemoryRecordStore`. They back the CLI and double as fakes in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::error::StorageError;
use crate::schema::{
    Branch, BranchConfig, Checkpoint, CheckpointId, CheckpointState, HistorySlot, SprintStatus,
};
use crate::storage_traits::{CheckpointStore, RecordStore, SequenceCounter, StorageResult};
use crate::tree::SprintTree;

// ---------------------------------------------------------------------------
// MemoryCheckpointStore
// ---------------------------------------------------------------------------

type TreeHandle = Arc<Mutex<SprintTree>>;

/// Checkpoint store keeping one `SprintTree` per sprint.
///
/// Each sprint has its own lock, so writes to one sprint are linearizable
/// while different sprints proceed independently.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    sprints: RwLock<HashMap<String, TreeHandle>>,
    /// checkpoint id -> owning sprint
    index: RwLock<HashMap<CheckpointId, String>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn tree(&self, sprint_id: &str) -> StorageResult<TreeHandle> {
        self.sprints
            .read()
            .await
            .get(sprint_id)
            .cloned()
            .ok_or_else(|| StorageError::SprintNotFound {
                sprint_id: sprint_id.to_string(),
            })
    }

    async fn tree_or_create(&self, sprint_id: &str) -> TreeHandle {
        let mut sprints = self.sprints.write().await;
        sprints
            .entry(sprint_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SprintTree::new(sprint_id))))
            .clone()
    }

    async fn owner_of(&self, checkpoint_id: &CheckpointId) -> StorageResult<String> {
        self.index
            .read()
            .await
            .get(checkpoint_id)
            .cloned()
            .ok_or_else(|| StorageError::CheckpointNotFound {
                checkpoint_id: checkpoint_id.to_string(),
            })
    }

    async fn remember(&self, checkpoint: &Checkpoint) {
        self.index
            .write()
            .await
            .insert(checkpoint.id.clone(), checkpoint.sprint_id.clone());
    }

    async fn append(
        &self,
        sprint_id: &str,
        branch: Option<&str>,
        label: &str,
        state: CheckpointState,
    ) -> StorageResult<Checkpoint> {
        let handle = self.tree_or_create(sprint_id).await;
        let mut tree = handle.lock().await;
        let branch = match branch {
            Some(b) => b.to_string(),
            None => tree.active_branch().to_string(),
        };
        let checkpoint = tree.append(&branch, label, state)?;
        self.remember(&checkpoint).await;
        Ok(checkpoint)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn create_checkpoint(
        &self,
        sprint_id: &str,
        label: &str,
        state: CheckpointState,
    ) -> StorageResult<Checkpoint> {
        self.append(sprint_id, None, label, state).await
    }

    async fn create_checkpoint_on(
        &self,
        sprint_id: &str,
        branch: &str,
        label: &str,
        state: CheckpointState,
    ) -> StorageResult<Checkpoint> {
        self.append(sprint_id, Some(branch), label, state).await
    }

    async fn insert_checkpoint(&self, checkpoint: Checkpoint) -> StorageResult<Checkpoint> {
        if let Some(parent) = &checkpoint.parent_id {
            if let Ok(owner) = self.owner_of(parent).await {
                if owner != checkpoint.sprint_id {
                    return Err(StorageError::InvalidParent {
                        checkpoint_id: checkpoint.id.to_string(),
                        reason: format!("parent {parent} belongs to sprint {owner}"),
                    });
                }
            }
        }
        if self.index.read().await.contains_key(&checkpoint.id) {
            return Err(StorageError::DuplicateCheckpoint {
                checkpoint_id: checkpoint.id.to_string(),
            });
        }

        // A non-root node cannot open a sprint; avoid creating an empty tree
        // for a write that is going to fail.
        let handle = if checkpoint.is_root() {
            self.tree_or_create(&checkpoint.sprint_id).await
        } else {
            self.tree(&checkpoint.sprint_id)
                .await
                .map_err(|_| StorageError::InvalidParent {
                    checkpoint_id: checkpoint.id.to_string(),
                    reason: format!("sprint {} has no checkpoints", checkpoint.sprint_id),
                })?
        };

        let mut tree = handle.lock().await;
        let written = tree.insert(checkpoint)?;
        self.remember(&written).await;
        Ok(written)
    }

    async fn branch_from(
        &self,
        checkpoint_id: &CheckpointId,
        config: BranchConfig,
    ) -> StorageResult<Branch> {
        let sprint_id = self.owner_of(checkpoint_id).await?;
        let handle = self.tree(&sprint_id).await?;
        let mut tree = handle.lock().await;
        let branch = tree.branch_from(checkpoint_id, config)?;
        info!(
            sprint_id = %sprint_id,
            branch = %branch.name,
            origin = %checkpoint_id.short(),
            "branch created"
        );
        Ok(branch)
    }

    async fn rewind(
        &self,
        sprint_id: &str,
        checkpoint_id: &CheckpointId,
    ) -> StorageResult<HistorySlot> {
        let handle = self.tree(sprint_id).await?;
        let mut tree = handle.lock().await;
        let slot = tree.rewind(checkpoint_id)?;
        info!(
            sprint_id = %sprint_id,
            target = %checkpoint_id.short(),
            version = slot.version,
            archived = slot.checkpoints.len(),
            "sprint rewound"
        );
        Ok(slot)
    }

    async fn restore(&self, sprint_id: &str, version: u32) -> StorageResult<HistorySlot> {
        let handle = self.tree(sprint_id).await?;
        let mut tree = handle.lock().await;
        let displaced = tree.restore(version)?;
        info!(
            sprint_id = %sprint_id,
            version,
            displaced_version = displaced.version,
            "history restored"
        );
        Ok(displaced)
    }

    async fn list_checkpoints(&self, sprint_id: &str) -> StorageResult<Vec<Checkpoint>> {
        let handle = self.tree(sprint_id).await?;
        let tree = handle.lock().await;
        Ok(tree.live())
    }

    async fn get_checkpoint(&self, checkpoint_id: &CheckpointId) -> StorageResult<Checkpoint> {
        let sprint_id = self.owner_of(checkpoint_id).await?;
        let handle = self.tree(&sprint_id).await?;
        let tree = handle.lock().await;
        tree.get(checkpoint_id).cloned()
    }

    async fn lineage(&self, checkpoint_id: &CheckpointId) -> StorageResult<Vec<Checkpoint>> {
        let sprint_id = self.owner_of(checkpoint_id).await?;
        let handle = self.tree(&sprint_id).await?;
        let tree = handle.lock().await;
        tree.lineage(checkpoint_id)
    }

    async fn current(&self, sprint_id: &str) -> StorageResult<Option<Checkpoint>> {
        match self.tree(sprint_id).await {
            Ok(handle) => Ok(handle.lock().await.current().cloned()),
            Err(StorageError::SprintNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn active_branch(&self, sprint_id: &str) -> StorageResult<String> {
        let handle = self.tree(sprint_id).await?;
        let tree = handle.lock().await;
        Ok(tree.active_branch().to_string())
    }

    async fn checkout(&self, sprint_id: &str, branch: &str) -> StorageResult<Branch> {
        let handle = self.tree(sprint_id).await?;
        let mut tree = handle.lock().await;
        tree.checkout(branch)?;
        tree.branch(branch).cloned()
    }

    async fn get_branch(&self, sprint_id: &str, name: &str) -> StorageResult<Branch> {
        let handle = self.tree(sprint_id).await?;
        let tree = handle.lock().await;
        tree.branch(name).cloned()
    }

    async fn branches(&self, sprint_id: &str) -> StorageResult<Vec<Branch>> {
        let handle = self.tree(sprint_id).await?;
        let tree = handle.lock().await;
        Ok(tree.branches().to_vec())
    }

    async fn history(&self, sprint_id: &str) -> StorageResult<Vec<HistorySlot>> {
        let handle = self.tree(sprint_id).await?;
        let tree = handle.lock().await;
        Ok(tree.history().to_vec())
    }
}

// ---------------------------------------------------------------------------
// MemorySequenceCounter
// ---------------------------------------------------------------------------

/// Per-room atomic counters.
#[derive(Debug, Default)]
pub struct MemorySequenceCounter {
    rooms: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl MemorySequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    async fn counter(&self, room: &str) -> Arc<AtomicU64> {
        if let Some(c) = self.rooms.read().await.get(room) {
            return c.clone();
        }
        self.rooms
            .write()
            .await
            .entry(room.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }
}

#[async_trait]
impl SequenceCounter for MemorySequenceCounter {
    async fn next(&self, room: &str) -> StorageResult<u64> {
        let counter = self.counter(room).await;
        Ok(counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn current(&self, room: &str) -> StorageResult<u64> {
        Ok(self
            .rooms
            .read()
            .await
            .get(room)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0))
    }
}

// ---------------------------------------------------------------------------
// MemoryRecordStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct SprintRecord {
    goal: String,
    status: SprintStatus,
    detail: Option<serde_json::Value>,
}

/// Sprint records keyed by sprint id.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<String, SprintRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sprint in `Planned` status.
    pub async fn insert_sprint(&self, sprint_id: &str, goal: &str) {
        self.records.write().await.insert(
            sprint_id.to_string(),
            SprintRecord {
                goal: goal.to_string(),
                status: SprintStatus::Planned,
                detail: None,
            },
        );
    }

    /// Last detail document written with a status, if any.
    pub async fn detail(&self, sprint_id: &str) -> Option<serde_json::Value> {
        self.records
            .read()
            .await
            .get(sprint_id)
            .and_then(|r| r.detail.clone())
    }

    async fn record(&self, sprint_id: &str) -> StorageResult<SprintRecord> {
        self.records
            .read()
            .await
            .get(sprint_id)
            .cloned()
            .ok_or_else(|| StorageError::SprintNotFound {
                sprint_id: sprint_id.to_string(),
            })
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn goal(&self, sprint_id: &str) -> StorageResult<String> {
        Ok(self.record(sprint_id).await?.goal)
    }

    async fn status(&self, sprint_id: &str) -> StorageResult<SprintStatus> {
        Ok(self.record(sprint_id).await?.status)
    }

    async fn set_status(
        &self,
        sprint_id: &str,
        status: SprintStatus,
        detail: Option<serde_json::Value>,
    ) -> StorageResult<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(sprint_id)
            .ok_or_else(|| StorageError::SprintNotFound {
                sprint_id: sprint_id.to_string(),
            })?;
        record.status = status;
        if detail.is_some() {
            record.detail = detail;
        }
        Ok(())
    }
}
