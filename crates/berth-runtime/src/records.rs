//! Container bookkeeping: one current record per workspace plus the records
//! it superseded.

use std::collections::HashMap;

use async_trait::async_trait;
use berth_common::{ContainerRecord, RecordStatus};
use chrono::Utc;
use tokio::sync::RwLock;

#[async_trait]
pub trait ContainerRecordStore: Send + Sync {
    async fn current(&self, workspace_id: &str) -> Option<ContainerRecord>;

    /// Start tracking `engine_container_id` as PROVISIONING. A different
    /// current record moves to history; the same container id is kept.
    async fn begin(&self, workspace_id: &str, engine_container_id: &str) -> ContainerRecord;

    /// Update the current record's status. `None` if nothing is tracked.
    async fn set_status(&self, workspace_id: &str, status: RecordStatus)
    -> Option<ContainerRecord>;

    /// Superseded records, oldest first.
    async fn history(&self, workspace_id: &str) -> Vec<ContainerRecord>;

    /// Forget everything about a workspace. Returns how many records went.
    async fn purge(&self, workspace_id: &str) -> usize;
}

#[derive(Debug, Default)]
struct Entry {
    current: Option<ContainerRecord>,
    history: Vec<ContainerRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContainerRecordStore for MemoryRecordStore {
    async fn current(&self, workspace_id: &str) -> Option<ContainerRecord> {
        self.entries
            .read()
            .await
            .get(workspace_id)
            .and_then(|e| e.current.clone())
    }

    async fn begin(&self, workspace_id: &str, engine_container_id: &str) -> ContainerRecord {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(workspace_id.to_string()).or_default();

        if let Some(current) = entry.current.as_ref() {
            if current.engine_container_id == engine_container_id {
                return current.clone();
            }
        }

        let record = ContainerRecord::provisioning(workspace_id, engine_container_id);
        if let Some(previous) = entry.current.replace(record.clone()) {
            entry.history.push(previous);
        }
        record
    }

    async fn set_status(
        &self,
        workspace_id: &str,
        status: RecordStatus,
    ) -> Option<ContainerRecord> {
        let mut entries = self.entries.write().await;
        let current = entries.get_mut(workspace_id)?.current.as_mut()?;
        current.status = status;
        current.updated_at = Utc::now();
        Some(current.clone())
    }

    async fn history(&self, workspace_id: &str) -> Vec<ContainerRecord> {
        self.entries
            .read()
            .await
            .get(workspace_id)
            .map(|e| e.history.clone())
            .unwrap_or_default()
    }

    async fn purge(&self, workspace_id: &str) -> usize {
        self.entries
            .write()
            .await
            .remove(workspace_id)
            .map(|e| e.history.len() + usize::from(e.current.is_some()))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_begin_supersedes_previous_container() {
        let store = MemoryRecordStore::new();
        store.begin("w1", "c1").await;
        store.set_status("w1", RecordStatus::Running).await;
        let second = store.begin("w1", "c2").await;

        assert_eq!(second.status, RecordStatus::Provisioning);
        assert_eq!(
            store.current("w1").await.unwrap().engine_container_id,
            "c2"
        );
        let history = store.history("w1").await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].engine_container_id, "c1");
        assert_eq!(history[0].status, RecordStatus::Running);
    }

    #[tokio::test]
    async fn test_begin_same_container_keeps_record() {
        let store = MemoryRecordStore::new();
        store.begin("w1", "c1").await;
        store.set_status("w1", RecordStatus::Running).await;
        let again = store.begin("w1", "c1").await;
        assert_eq!(again.status, RecordStatus::Running);
        assert!(store.history("w1").await.is_empty());
    }

    #[tokio::test]
    async fn test_set_status_without_record() {
        let store = MemoryRecordStore::new();
        assert!(store.set_status("w1", RecordStatus::Stopped).await.is_none());
    }

    #[tokio::test]
    async fn test_purge_counts_all_records() {
        let store = MemoryRecordStore::new();
        store.begin("w1", "c1").await;
        store.begin("w1", "c2").await;
        assert_eq!(store.purge("w1").await, 2);
        assert!(store.current("w1").await.is_none());
        assert_eq!(store.purge("w1").await, 0);
    }
}
