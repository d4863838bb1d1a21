//! Gauntlet state: checkpoint tree, sequence counters and sprint records
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: tree integrity, linearizable writes per sprint, and recoverable
//! rewinds. The engine talks to this layer only through the traits in
//! `storage_traits`; `memory` provides the in-process implementations.
//!
//! ## Key Components
//!
//! - `CheckpointStore`: branchable, rewindable checkpoint history
//! - `SequenceCounter`: gapless per-room sequence numbers
//! - `RecordStore`: sprint goal and coarse status

mod error;
pub mod memory;
mod schema;
pub mod storage_traits;
mod tree;

pub use error::StorageError;
pub use memory::{MemoryCheckpointStore, MemoryRecordStore, MemorySequenceCounter};
pub use schema::{
    Branch, BranchConfig, Checkpoint, CheckpointId, CheckpointState, HistorySlot, SprintStatus,
    MAIN_BRANCH,
};
pub use storage_traits::{
    CheckpointStore, ContentDigest, RecordStore, SequenceCounter, StorageResult,
};
pub use tree::SprintTree;
