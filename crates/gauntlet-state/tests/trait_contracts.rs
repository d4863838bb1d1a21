//! Trait contract tests for CheckpointStore, SequenceCounter and RecordStore.
//!
//! These tests exercise the in-memory implementations through the trait
//! objects the engine uses. Any conforming implementation must pass them.

use std::collections::HashSet;
use std::sync::Arc;

use gauntlet_state::storage_traits::*;
use gauntlet_state::{
    BranchConfig, Checkpoint, CheckpointState, MemoryCheckpointStore, MemorySequenceCounter,
    SprintStatus, StorageError, MAIN_BRANCH,
};

fn state(phase: &str) -> CheckpointState {
    CheckpointState::new(SprintStatus::Active).with_phase(phase)
}

async fn seeded(store: &dyn CheckpointStore, sprint: &str, n: usize) -> Vec<Checkpoint> {
    let mut out = Vec::new();
    for i in 0..n {
        out.push(
            store
                .create_checkpoint(sprint, &format!("cp-{i}"), state(&format!("p{i}")))
                .await
                .unwrap(),
        );
    }
    out
}

// ===========================================================================
// CheckpointStore contract tests
// ===========================================================================

#[tokio::test]
async fn first_checkpoint_is_root_on_main() {
    let store = MemoryCheckpointStore::new();
    let cps = seeded(&store, "s1", 1).await;

    assert!(cps[0].is_root());
    assert_eq!(store.active_branch("s1").await.unwrap(), MAIN_BRANCH);
    assert_eq!(store.current("s1").await.unwrap().unwrap().id, cps[0].id);
}

#[tokio::test]
async fn rewinding_main_keeps_lineage_of_live_branches() {
    let store = MemoryCheckpointStore::new();
    let cps = seeded(&store, "s1", 3).await;
    store
        .branch_from(&cps[2].id, BranchConfig::named("alt"))
        .await
        .unwrap();
    let a1 = store
        .create_checkpoint_on("s1", "alt", "alt-1", state("alt"))
        .await
        .unwrap();

    store.rewind("s1", &cps[1].id).await.unwrap();

    let live: HashSet<_> = store
        .list_checkpoints("s1")
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    for node in store.lineage(&a1.id).await.unwrap() {
        assert!(live.contains(&node.id), "{} hidden under a live branch", node.label);
    }
    assert_eq!(store.current("s1").await.unwrap().unwrap().id, cps[1].id);
}

#[tokio::test]
async fn current_is_none_for_unknown_sprint() {
    let store = MemoryCheckpointStore::new();
    assert!(store.current("nobody").await.unwrap().is_none());
}

#[tokio::test]
async fn lineage_runs_root_to_node() {
    let store = MemoryCheckpointStore::new();
    let cps = seeded(&store, "s1", 4).await;

    let lineage = store.lineage(&cps[3].id).await.unwrap();
    let ids: Vec<_> = lineage.iter().map(|c| c.id.clone()).collect();
    let expected: Vec<_> = cps.iter().map(|c| c.id.clone()).collect();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn sequences_strictly_increase() {
    let store = MemoryCheckpointStore::new();
    let cps = seeded(&store, "s1", 5).await;
    for pair in cps.windows(2) {
        assert!(pair[1].sequence > pair[0].sequence);
    }
}

#[tokio::test]
async fn branching_twice_from_same_checkpoint_diverges() {
    let store = MemoryCheckpointStore::new();
    let cps = seeded(&store, "s1", 3).await;
    let before = store.list_checkpoints("s1").await.unwrap();

    let a = store
        .branch_from(&cps[1].id, BranchConfig::named("a"))
        .await
        .unwrap();
    let b = store
        .branch_from(&cps[1].id, BranchConfig::named("b"))
        .await
        .unwrap();
    assert_ne!(a.name, b.name);
    assert_eq!(a.origin, cps[1].id);
    assert_eq!(b.origin, cps[1].id);

    // Branching alone writes nothing
    assert_eq!(store.list_checkpoints("s1").await.unwrap(), before);

    let on_a = store
        .create_checkpoint_on("s1", "a", "a-1", state("a"))
        .await
        .unwrap();
    let on_b = store
        .create_checkpoint_on("s1", "b", "b-1", state("b"))
        .await
        .unwrap();
    assert_eq!(on_a.parent_id.as_ref(), Some(&cps[1].id));
    assert_eq!(on_b.parent_id.as_ref(), Some(&cps[1].id));

    // The source lineage is untouched
    let main_head = store.get_branch("s1", MAIN_BRANCH).await.unwrap().head;
    assert_eq!(main_head, cps[2].id);
    assert_eq!(store.get_checkpoint(&cps[1].id).await.unwrap(), cps[1]);
}

#[tokio::test]
async fn rewind_then_create_keeps_history_recoverable() {
    let store = MemoryCheckpointStore::new();
    let cps = seeded(&store, "s1", 4).await;

    let slot = store.rewind("s1", &cps[1].id).await.unwrap();
    assert_eq!(slot.version, 1);
    assert_eq!(slot.checkpoints.len(), 2);
    assert_eq!(store.current("s1").await.unwrap().unwrap().id, cps[1].id);

    let fresh = store
        .create_checkpoint("s1", "redo", state("redo"))
        .await
        .unwrap();
    assert_eq!(fresh.parent_id.as_ref(), Some(&cps[1].id));

    // Archived checkpoints are still addressable
    assert_eq!(store.get_checkpoint(&cps[3].id).await.unwrap().label, "cp-3");

    let displaced = store.restore("s1", 1).await.unwrap();
    assert_eq!(displaced.checkpoints[0].id, fresh.id);
    assert_eq!(store.current("s1").await.unwrap().unwrap().id, cps[3].id);
    assert_eq!(store.history("s1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn rewind_to_foreign_sprint_checkpoint_fails() {
    let store = MemoryCheckpointStore::new();
    seeded(&store, "s1", 2).await;
    let other = seeded(&store, "s2", 1).await;

    let err = store.rewind("s1", &other[0].id).await.unwrap_err();
    assert!(matches!(err, StorageError::CheckpointNotFound { .. }));
}

#[tokio::test]
async fn rewind_off_lineage_fails() {
    let store = MemoryCheckpointStore::new();
    let cps = seeded(&store, "s1", 2).await;
    store
        .branch_from(&cps[0].id, BranchConfig::named("alt"))
        .await
        .unwrap();
    let alt = store
        .create_checkpoint_on("s1", "alt", "alt-1", state("alt"))
        .await
        .unwrap();

    let err = store.rewind("s1", &alt.id).await.unwrap_err();
    assert!(matches!(err, StorageError::NotOnLineage { .. }));
}

#[tokio::test]
async fn checkout_switches_active_branch() {
    let store = MemoryCheckpointStore::new();
    let cps = seeded(&store, "s1", 2).await;
    store
        .branch_from(&cps[0].id, BranchConfig::named("alt"))
        .await
        .unwrap();

    let branch = store.checkout("s1", "alt").await.unwrap();
    assert_eq!(branch.head, cps[0].id);
    let next = store
        .create_checkpoint("s1", "on-alt", state("x"))
        .await
        .unwrap();
    assert_eq!(next.branch, "alt");
    assert_eq!(next.parent_id.as_ref(), Some(&cps[0].id));
}

#[tokio::test]
async fn insert_rejects_parent_from_other_sprint() {
    let store = MemoryCheckpointStore::new();
    seeded(&store, "s1", 1).await;
    let other = seeded(&store, "s2", 1).await;

    let node = Checkpoint::new("s1", MAIN_BRANCH, "x", Some(other[0].id.clone()), state("x"));
    let err = store.insert_checkpoint(node).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidParent { .. }));
}

#[tokio::test]
async fn insert_rejects_duplicate_id() {
    let store = MemoryCheckpointStore::new();
    let cps = seeded(&store, "s1", 1).await;

    let mut dup = Checkpoint::new("s1", "alt", "dup", Some(cps[0].id.clone()), state("x"));
    dup.id = cps[0].id.clone();
    let err = store.insert_checkpoint(dup).await.unwrap_err();
    assert!(matches!(err, StorageError::DuplicateCheckpoint { .. }));
}

#[tokio::test]
async fn insert_non_root_into_unknown_sprint_creates_nothing() {
    let store = MemoryCheckpointStore::new();
    let node = Checkpoint::new("ghost", MAIN_BRANCH, "x", Some("p".into()), state("x"));
    assert!(store.insert_checkpoint(node).await.is_err());
    assert!(matches!(
        store.list_checkpoints("ghost").await.unwrap_err(),
        StorageError::SprintNotFound { .. }
    ));
}

#[tokio::test]
async fn lookup_errors_leave_state_untouched() {
    let store = MemoryCheckpointStore::new();
    let cps = seeded(&store, "s1", 3).await;
    let before = store.list_checkpoints("s1").await.unwrap();

    assert!(store.get_checkpoint(&"missing".into()).await.unwrap_err().is_lookup());
    assert!(store
        .branch_from(&"missing".into(), BranchConfig::default())
        .await
        .unwrap_err()
        .is_lookup());
    assert!(store.rewind("s1", &"missing".into()).await.unwrap_err().is_lookup());
    assert!(store.restore("s1", 9).await.unwrap_err().is_lookup());
    assert!(store.checkout("s1", "nope").await.unwrap_err().is_lookup());

    assert_eq!(store.list_checkpoints("s1").await.unwrap(), before);
    assert_eq!(store.current("s1").await.unwrap().unwrap().id, cps[2].id);
    assert!(store.history("s1").await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_writes_to_one_sprint_are_linearized() {
    let store = Arc::new(MemoryCheckpointStore::new());
    seeded(store.as_ref(), "s1", 1).await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .create_checkpoint("s1", &format!("w{i}"), state("w"))
                .await
                .unwrap()
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let live = store.list_checkpoints("s1").await.unwrap();
    assert_eq!(live.len(), 17);
    // A single chain: every node's parent is the previous node.
    for pair in live.windows(2) {
        assert_eq!(pair[1].parent_id.as_ref(), Some(&pair[0].id));
    }
}

// ===========================================================================
// SequenceCounter contract tests
// ===========================================================================

#[tokio::test]
async fn sequence_counter_is_gapless_under_contention() {
    let counter = Arc::new(MemorySequenceCounter::new());
    let mut handles = Vec::new();
    for _ in 0..8 {
        let counter = counter.clone();
        handles.push(tokio::spawn(async move {
            let mut got = Vec::new();
            for _ in 0..25 {
                got.push(counter.next("room").await.unwrap());
            }
            got
        }));
    }

    let mut all = HashSet::new();
    for h in handles {
        for v in h.await.unwrap() {
            assert!(all.insert(v), "sequence {v} handed out twice");
        }
    }
    let expected: HashSet<u64> = (1..=200).collect();
    assert_eq!(all, expected);
    assert_eq!(counter.current("room").await.unwrap(), 200);
}
