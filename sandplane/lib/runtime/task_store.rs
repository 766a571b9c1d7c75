use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::{SandplaneError, SandplaneResult};

use super::VmHandle;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Maps scheduler-assigned task ids to VM handles.
///
/// The task id is the allocation identifier handed out by the scheduler and
/// is distinct from the sandbox id; external callers that only know the
/// allocation resolve their handle here.
#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: RwLock<HashMap<String, VmHandle>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TaskStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handle under its task id.
    pub async fn insert(&self, handle: VmHandle) -> SandplaneResult<()> {
        let mut tasks = self.tasks.write().await;

        let task_id = handle.task_id().to_string();
        if tasks.contains_key(&task_id) {
            return Err(SandplaneError::TaskAlreadyExists(task_id));
        }

        tasks.insert(task_id, handle);
        Ok(())
    }

    /// Looks up a handle by task id.
    pub async fn get(&self, task_id: &str) -> SandplaneResult<VmHandle> {
        let tasks = self.tasks.read().await;
        tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| SandplaneError::TaskNotFound(task_id.to_string()))
    }

    /// Removes a handle. Removing an unknown id is a no-op.
    pub async fn remove(&self, task_id: &str) -> Option<VmHandle> {
        self.tasks.write().await.remove(task_id)
    }

    /// Returns all registered task ids.
    pub async fn task_ids(&self) -> Vec<String> {
        self.tasks.read().await.keys().cloned().collect()
    }

    /// Returns the number of registered tasks.
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;

    async fn test_handle(task_id: &str) -> VmHandle {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();
        VmHandle::new(task_id, "sb-1", pid, child, "/tmp/api.sock", "ns-0")
    }

    #[tokio::test]
    async fn test_insert_and_get() -> SandplaneResult<()> {
        let store = TaskStore::new();
        let handle = test_handle("task-1").await;
        store.insert(handle.clone()).await?;

        let found = store.get("task-1").await?;
        assert_eq!(found.task_id(), "task-1");

        handle.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() -> SandplaneResult<()> {
        let store = TaskStore::new();
        let first = test_handle("task-1").await;
        let second = test_handle("task-1").await;

        store.insert(first.clone()).await?;
        let result = store.insert(second.clone()).await;
        assert!(matches!(
            result,
            Err(SandplaneError::TaskAlreadyExists(id)) if id == "task-1"
        ));

        first.shutdown().await?;
        second.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_get_unknown_task() {
        let store = TaskStore::new();
        assert!(matches!(
            store.get("ghost").await,
            Err(SandplaneError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() -> SandplaneResult<()> {
        let store = TaskStore::new();
        let handle = test_handle("task-1").await;
        store.insert(handle.clone()).await?;

        assert!(store.remove("task-1").await.is_some());
        assert!(store.remove("task-1").await.is_none());

        handle.shutdown().await?;
        Ok(())
    }
}
