//! In-memory checkpoint tree for a single sprint.
//!
//! `SprintTree` is the synchronous core behind `MemoryCheckpointStore`: it
//! owns the nodes, branch pointers and rewind history of one sprint and
//! enforces the tree invariants on every write. Callers serialize access
//! (the store keeps one lock per sprint).

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tracing::debug;

use crate::error::StorageError;
use crate::schema::{
    Branch, BranchConfig, Checkpoint, CheckpointId, CheckpointState, HistorySlot, MAIN_BRANCH,
};
use crate::storage_traits::StorageResult;

#[derive(Debug)]
pub struct SprintTree {
    sprint_id: String,
    nodes: HashMap<CheckpointId, Checkpoint>,
    /// Insertion order, which is also sequence order
    order: Vec<CheckpointId>,
    /// Archived node -> history version holding it
    archived: HashMap<CheckpointId, u32>,
    branches: Vec<Branch>,
    active: String,
    history: Vec<HistorySlot>,
    /// Slot versions already brought back
    restored: HashSet<u32>,
    next_sequence: u64,
}

impl SprintTree {
    pub fn new(sprint_id: &str) -> Self {
        Self {
            sprint_id: sprint_id.to_string(),
            nodes: HashMap::new(),
            order: Vec::new(),
            archived: HashMap::new(),
            branches: Vec::new(),
            active: MAIN_BRANCH.to_string(),
            history: Vec::new(),
            restored: HashSet::new(),
            next_sequence: 1,
        }
    }

    pub fn sprint_id(&self) -> &str {
        &self.sprint_id
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &CheckpointId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn active_branch(&self) -> &str {
        &self.active
    }

    pub fn get(&self, id: &CheckpointId) -> StorageResult<&Checkpoint> {
        self.nodes
            .get(id)
            .ok_or_else(|| StorageError::CheckpointNotFound {
                checkpoint_id: id.to_string(),
            })
    }

    pub fn branch(&self, name: &str) -> StorageResult<&Branch> {
        self.branches
            .iter()
            .find(|b| b.name == name)
            .ok_or_else(|| StorageError::BranchNotFound {
                sprint_id: self.sprint_id.clone(),
                branch: name.to_string(),
            })
    }

    fn branch_mut(&mut self, name: &str) -> StorageResult<&mut Branch> {
        let sprint_id = self.sprint_id.clone();
        self.branches
            .iter_mut()
            .find(|b| b.name == name)
            .ok_or(StorageError::BranchNotFound {
                sprint_id,
                branch: name.to_string(),
            })
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub fn history(&self) -> &[HistorySlot] {
        &self.history
    }

    /// Live checkpoints in sequence order.
    pub fn live(&self) -> Vec<Checkpoint> {
        self.order
            .iter()
            .filter(|id| !self.archived.contains_key(*id))
            .filter_map(|id| self.nodes.get(id).cloned())
            .collect()
    }

    /// Head of the active branch.
    pub fn current(&self) -> Option<&Checkpoint> {
        self.branch(&self.active)
            .ok()
            .and_then(|b| self.nodes.get(&b.head))
    }

    /// Make `name` the active branch.
    pub fn checkout(&mut self, name: &str) -> StorageResult<()> {
        self.branch(name)?;
        self.active = name.to_string();
        Ok(())
    }

    /// Append a new checkpoint to `branch`.
    ///
    /// On an empty tree this writes the root and creates the branch.
    pub fn append(
        &mut self,
        branch: &str,
        label: &str,
        state: CheckpointState,
    ) -> StorageResult<Checkpoint> {
        let parent = if self.is_empty() {
            None
        } else {
            Some(self.branch(branch)?.head.clone())
        };
        let checkpoint = Checkpoint::new(&self.sprint_id, branch, label, parent, state);
        self.insert(checkpoint)
    }

    /// Validate and write a node.
    ///
    /// Rejects duplicate ids, a second root, unknown parents, parents that
    /// are not the head of an existing target branch, and any parent chain
    /// that already contains the new id.
    pub fn insert(&mut self, mut checkpoint: Checkpoint) -> StorageResult<Checkpoint> {
        if self.nodes.contains_key(&checkpoint.id) {
            return Err(StorageError::DuplicateCheckpoint {
                checkpoint_id: checkpoint.id.to_string(),
            });
        }
        if checkpoint.sprint_id != self.sprint_id {
            return Err(StorageError::InvalidParent {
                checkpoint_id: checkpoint.id.to_string(),
                reason: format!(
                    "checkpoint belongs to sprint {}, not {}",
                    checkpoint.sprint_id, self.sprint_id
                ),
            });
        }

        match &checkpoint.parent_id {
            None => {
                if !self.is_empty() {
                    return Err(StorageError::InvalidParent {
                        checkpoint_id: checkpoint.id.to_string(),
                        reason: "sprint already has a root".to_string(),
                    });
                }
            }
            Some(parent) => {
                if !self.nodes.contains_key(parent) {
                    return Err(StorageError::InvalidParent {
                        checkpoint_id: checkpoint.id.to_string(),
                        reason: format!("parent {parent} is not in sprint {}", self.sprint_id),
                    });
                }
                if self.ancestors(parent).any(|a| a.id == checkpoint.id) {
                    return Err(StorageError::CycleDetected {
                        checkpoint_id: checkpoint.id.to_string(),
                        parent_id: parent.to_string(),
                    });
                }
                if let Ok(b) = self.branch(&checkpoint.branch) {
                    if &b.head != parent {
                        return Err(StorageError::InvalidParent {
                            checkpoint_id: checkpoint.id.to_string(),
                            reason: format!(
                                "parent {parent} is not the head of branch {}",
                                checkpoint.branch
                            ),
                        });
                    }
                }
            }
        }

        checkpoint.sequence = self.next_sequence;
        self.next_sequence += 1;

        let id = checkpoint.id.clone();
        match self.branch_mut(&checkpoint.branch) {
            Ok(b) => b.head = id.clone(),
            Err(_) => {
                let origin = checkpoint.parent_id.clone().unwrap_or_else(|| id.clone());
                if checkpoint.is_root() {
                    self.active = checkpoint.branch.clone();
                }
                self.branches.push(Branch {
                    name: checkpoint.branch.clone(),
                    sprint_id: self.sprint_id.clone(),
                    origin,
                    head: id.clone(),
                    config: BranchConfig::named(checkpoint.branch.clone()),
                    created_at: Utc::now(),
                });
            }
        }

        debug!(
            sprint_id = %self.sprint_id,
            checkpoint = %id.short(),
            sequence = checkpoint.sequence,
            branch = %checkpoint.branch,
            "checkpoint written"
        );
        self.order.push(id.clone());
        self.nodes.insert(id, checkpoint.clone());
        Ok(checkpoint)
    }

    /// Walk parents starting at `id` (inclusive) towards the root.
    ///
    /// Stops on a missing parent or a revisited node so a corrupted tree
    /// can never loop forever.
    pub fn ancestors<'a>(&'a self, id: &CheckpointId) -> impl Iterator<Item = &'a Checkpoint> + 'a {
        let mut next = self.nodes.get(id);
        let mut seen = HashSet::new();
        std::iter::from_fn(move || {
            let node = next?;
            if !seen.insert(node.id.clone()) {
                return None;
            }
            next = node.parent_id.as_ref().and_then(|p| self.nodes.get(p));
            Some(node)
        })
    }

    /// Root-to-node path.
    pub fn lineage(&self, id: &CheckpointId) -> StorageResult<Vec<Checkpoint>> {
        self.get(id)?;
        let mut path: Vec<Checkpoint> = self.ancestors(id).cloned().collect();
        path.reverse();
        Ok(path)
    }

    pub fn is_ancestor_or_self(&self, ancestor: &CheckpointId, of: &CheckpointId) -> bool {
        self.ancestors(of).any(|c| &c.id == ancestor)
    }

    /// Create a branch whose head is `from`. Nothing else changes.
    pub fn branch_from(&mut self, from: &CheckpointId, config: BranchConfig) -> StorageResult<Branch> {
        self.get(from)?;

        let name = match &config.name {
            Some(name) => {
                if self.branch(name).is_ok() {
                    return Err(StorageError::BranchExists {
                        sprint_id: self.sprint_id.clone(),
                        branch: name.clone(),
                    });
                }
                name.clone()
            }
            None => {
                let mut n = self.branches.len();
                loop {
                    let candidate = format!("branch-{n}");
                    if self.branch(&candidate).is_err() {
                        break candidate;
                    }
                    n += 1;
                }
            }
        };

        let branch = Branch {
            name: name.clone(),
            sprint_id: self.sprint_id.clone(),
            origin: from.clone(),
            head: from.clone(),
            config: BranchConfig {
                name: Some(name),
                ..config
            },
            created_at: Utc::now(),
        };
        self.branches.push(branch.clone());
        Ok(branch)
    }

    /// Archive the checkpoints `branch` wrote beyond `target` into a new slot.
    ///
    /// Nodes another branch still builds on are recorded in the slot but
    /// stay live, so every live head keeps a live lineage.
    fn archive_beyond(&mut self, branch: &str, target: &CheckpointId) -> StorageResult<HistorySlot> {
        let head = self.branch(branch)?.head.clone();
        if !self.is_ancestor_or_self(target, &head) {
            return Err(StorageError::NotOnLineage {
                checkpoint_id: target.to_string(),
                branch: branch.to_string(),
            });
        }

        let mut beyond: Vec<Checkpoint> = self
            .ancestors(&head)
            .take_while(|c| &c.id != target)
            .filter(|c| c.branch == branch)
            .cloned()
            .collect();
        beyond.reverse();

        let version = self.history.len() as u32 + 1;
        let other_heads: Vec<CheckpointId> = self
            .branches
            .iter()
            .filter(|b| b.name != branch)
            .map(|b| b.head.clone())
            .collect();
        for cp in &beyond {
            let shared = other_heads.iter().any(|h| self.is_ancestor_or_self(&cp.id, h));
            if shared {
                debug!(checkpoint = %cp.id, "kept live: ancestry of another branch");
            } else {
                self.archived.insert(cp.id.clone(), version);
            }
        }

        let slot = HistorySlot {
            version,
            branch: branch.to_string(),
            rewound_to: target.clone(),
            previous_head: head,
            checkpoints: beyond,
            archived_at: Utc::now(),
        };
        self.history.push(slot.clone());
        self.branch_mut(branch)?.head = target.clone();
        Ok(slot)
    }

    /// Move the active branch head to `target`, archiving what lay beyond.
    pub fn rewind(&mut self, target: &CheckpointId) -> StorageResult<HistorySlot> {
        self.get(target)?;
        let branch = self.active.clone();
        self.archive_beyond(&branch, target)
    }

    /// Re-activate an archived slot. Returns the slot archived to make room.
    pub fn restore(&mut self, version: u32) -> StorageResult<HistorySlot> {
        let slot = self
            .history
            .iter()
            .find(|s| s.version == version)
            .cloned()
            .ok_or_else(|| StorageError::HistoryNotFound {
                sprint_id: self.sprint_id.clone(),
                version,
            })?;

        let still_archived = !self.restored.contains(&version)
            && slot
                .checkpoints
                .iter()
                .all(|c| self.archived.get(&c.id).map_or(true, |v| *v == version));
        if !still_archived {
            return Err(StorageError::HistoryAlreadyRestored {
                sprint_id: self.sprint_id.clone(),
                version,
            });
        }

        let displaced = self.archive_beyond(&slot.branch, &slot.rewound_to)?;
        for cp in &slot.checkpoints {
            self.archived.remove(&cp.id);
        }
        self.branch_mut(&slot.branch)?.head = slot.previous_head.clone();
        self.active = slot.branch.clone();
        self.restored.insert(version);
        Ok(displaced)
    }
}
