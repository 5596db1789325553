//! Seams to collaborators that live outside the orchestrator: the workspace
//! persistence layer and the authorization predicate.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::models::Workspace;

/// Read access to workspace descriptors.
#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    async fn get_workspace(&self, id: &str) -> Option<Workspace>;
}

/// In-memory store used by the standalone server and by tests.
#[derive(Debug, Default)]
pub struct MemoryWorkspaceStore {
    workspaces: RwLock<HashMap<String, Workspace>>,
}

impl MemoryWorkspaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workspaces(workspaces: impl IntoIterator<Item = Workspace>) -> Self {
        let map = workspaces
            .into_iter()
            .map(|ws| (ws.id.clone(), ws))
            .collect();
        Self {
            workspaces: RwLock::new(map),
        }
    }

    /// Insert or replace a workspace. Returns the previous descriptor.
    pub async fn upsert(&self, workspace: Workspace) -> Option<Workspace> {
        self.workspaces
            .write()
            .await
            .insert(workspace.id.clone(), workspace)
    }

    pub async fn remove(&self, id: &str) -> Option<Workspace> {
        self.workspaces.write().await.remove(id)
    }
}

#[async_trait]
impl WorkspaceStore for MemoryWorkspaceStore {
    async fn get_workspace(&self, id: &str) -> Option<Workspace> {
        self.workspaces.read().await.get(id).cloned()
    }
}

/// "Is this caller allowed to touch this workspace?"
pub trait AccessPolicy: Send + Sync {
    fn allows(&self, user_id: Option<&str>, workspace_id: &str) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn allows(&self, _user_id: Option<&str>, _workspace_id: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HostingType;

    #[tokio::test]
    async fn test_memory_store_upsert_replaces() {
        let store = MemoryWorkspaceStore::with_workspaces([Workspace::new("w1", HostingType::Cloud)]);
        let previous = store.upsert(Workspace::new("w1", HostingType::Local)).await;
        assert_eq!(previous.unwrap().hosting_type, HostingType::Cloud);
        let current = store.get_workspace("w1").await.unwrap();
        assert_eq!(current.hosting_type, HostingType::Local);
    }

    #[tokio::test]
    async fn test_memory_store_missing_workspace() {
        let store = MemoryWorkspaceStore::new();
        assert!(store.get_workspace("nope").await.is_none());
        assert!(store.remove("nope").await.is_none());
    }

    #[test]
    fn test_allow_all() {
        assert!(AllowAll.allows(None, "w1"));
        assert!(AllowAll.allows(Some("u1"), "w1"));
    }
}
