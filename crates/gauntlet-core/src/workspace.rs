//! Workspace provider seam.
//!
//! The engine only needs an opaque isolated working area per sprint that it
//! can snapshot at checkpoints and dispose at the end. `DirWorkspaceProvider`
//! gives each sprint a directory under a root.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Handle to a provisioned workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceHandle {
    pub sprint_id: String,
    /// Opaque reference handed to backends and evaluators
    pub reference: String,
}

#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    async fn provision(&self, sprint_id: &str) -> anyhow::Result<WorkspaceHandle>;

    /// Snapshot the workspace and return a reference to the snapshot.
    async fn snapshot(&self, handle: &WorkspaceHandle, label: &str) -> anyhow::Result<String>;

    async fn dispose(&self, handle: &WorkspaceHandle) -> anyhow::Result<()>;
}

/// A provisioned workspace bound to the provider that owns it.
#[derive(Clone)]
pub struct WorkspaceLease {
    provider: Arc<dyn WorkspaceProvider>,
    handle: WorkspaceHandle,
}

impl WorkspaceLease {
    pub async fn acquire(provider: Arc<dyn WorkspaceProvider>, sprint_id: &str) -> anyhow::Result<Self> {
        let handle = provider.provision(sprint_id).await?;
        Ok(Self { provider, handle })
    }

    pub fn handle(&self) -> &WorkspaceHandle {
        &self.handle
    }

    pub fn reference(&self) -> &str {
        &self.handle.reference
    }

    pub async fn snapshot(&self, label: &str) -> anyhow::Result<String> {
        self.provider.snapshot(&self.handle, label).await
    }

    pub async fn release(self) -> anyhow::Result<()> {
        self.provider.dispose(&self.handle).await
    }
}

impl std::fmt::Debug for WorkspaceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceLease").field("handle", &self.handle).finish()
    }
}

/// One directory per sprint under `root`.
///
/// Snapshots are references of the form `<path>@<label>`; a snapshot marker
/// file records each label inside the directory.
#[derive(Debug, Clone)]
pub struct DirWorkspaceProvider {
    root: PathBuf,
}

const SNAPSHOT_LOG: &str = ".gauntlet-snapshots";

impl DirWorkspaceProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_for(&self, sprint_id: &str) -> anyhow::Result<PathBuf> {
        anyhow::ensure!(
            !sprint_id.is_empty()
                && sprint_id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
                && sprint_id != "."
                && sprint_id != "..",
            "sprint id {sprint_id:?} is not usable as a directory name"
        );
        Ok(self.root.join(sprint_id))
    }
}

#[async_trait]
impl WorkspaceProvider for DirWorkspaceProvider {
    async fn provision(&self, sprint_id: &str) -> anyhow::Result<WorkspaceHandle> {
        let dir = self.dir_for(sprint_id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create workspace {}", dir.display()))?;
        debug!(sprint_id = %sprint_id, path = %dir.display(), "workspace provisioned");
        Ok(WorkspaceHandle {
            sprint_id: sprint_id.to_string(),
            reference: dir.display().to_string(),
        })
    }

    async fn snapshot(&self, handle: &WorkspaceHandle, label: &str) -> anyhow::Result<String> {
        let dir = self.dir_for(&handle.sprint_id)?;
        anyhow::ensure!(dir.is_dir(), "workspace {} does not exist", dir.display());

        let log = dir.join(SNAPSHOT_LOG);
        let mut entries = tokio::fs::read_to_string(&log).await.unwrap_or_default();
        entries.push_str(label);
        entries.push('\n');
        tokio::fs::write(&log, entries)
            .await
            .with_context(|| format!("failed to record snapshot in {}", log.display()))?;
        Ok(format!("{}@{label}", dir.display()))
    }

    async fn dispose(&self, handle: &WorkspaceHandle) -> anyhow::Result<()> {
        let dir = self.dir_for(&handle.sprint_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", dir.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn provision_snapshot_dispose() {
        let root = tempfile::tempdir().unwrap();
        let provider = DirWorkspaceProvider::new(root.path());

        let handle = provider.provision("sprint-1").await.unwrap();
        assert!(root.path().join("sprint-1").is_dir());

        let snap = provider.snapshot(&handle, "plan:passed").await.unwrap();
        assert!(snap.ends_with("@plan:passed"));
        let log = std::fs::read_to_string(root.path().join("sprint-1").join(SNAPSHOT_LOG)).unwrap();
        assert_eq!(log, "plan:passed\n");

        provider.dispose(&handle).await.unwrap();
        assert!(!root.path().join("sprint-1").exists());
        // Disposing twice is fine
        provider.dispose(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn lease_snapshots_and_releases() {
        let root = tempfile::tempdir().unwrap();
        let provider = Arc::new(DirWorkspaceProvider::new(root.path()));
        let lease = WorkspaceLease::acquire(provider, "s2").await.unwrap();
        assert!(lease.reference().ends_with("s2"));
        assert_eq!(lease.snapshot("a").await.unwrap(), format!("{}@a", lease.reference()));
        lease.release().await.unwrap();
        assert!(!root.path().join("s2").exists());
    }

    #[tokio::test]
    async fn rejects_path_like_sprint_ids() {
        let root = tempfile::tempdir().unwrap();
        let provider = DirWorkspaceProvider::new(root.path());
        assert!(provider.provision("../escape").await.is_err());
        assert!(provider.provision("").await.is_err());
    }

    #[tokio::test]
    async fn snapshot_of_missing_workspace_fails() {
        let root = tempfile::tempdir().unwrap();
        let provider = DirWorkspaceProvider::new(root.path());
        let handle = WorkspaceHandle {
            sprint_id: "ghost".into(),
            reference: String::new(),
        };
        assert!(provider.snapshot(&handle, "x").await.is_err());
    }
}
