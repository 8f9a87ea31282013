//! RunningTaskDb — persistence for in-flight tasks, enabling crash recovery.

use orc_shared::ids::{SubscriberId, TaskDescriptorId, TaskId};
use orc_shared::model::TaskState;
use orc_shared::TaskerResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// A persisted in-flight task instance.
///
/// `update_task_handle` (the step's cancellable update task) is
/// intentionally not persisted — it is process-local and reconstructed by
/// TaskHandler on recovery, same as any other in-memory-only handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningTask {
    pub id: TaskId,
    pub descriptor_id: TaskDescriptorId,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub current_step_index: usize,
    pub task_state: TaskState,
    /// (task_id, step_name) acks already received for the current step,
    /// so recovery can replay them without re-emitting the Action.
    pub received_acks: BTreeSet<SubscriberId>,
    /// Subscribers still owing an ack for the current step.
    pub pending_action_for: BTreeSet<SubscriberId>,
    /// Whether the Action for `current_step_index` has already been emitted.
    /// Recovery uses this to resume waiting on `pending_action_for` without
    /// re-snapshotting subscribers or re-emitting.
    #[serde(default)]
    pub action_emitted: bool,
}

impl RunningTask {
    pub fn new(descriptor_id: TaskDescriptorId) -> Self {
        Self {
            id: TaskId::fresh(),
            descriptor_id,
            started_at: chrono::Utc::now(),
            current_step_index: 0,
            task_state: TaskState::Running,
            received_acks: BTreeSet::new(),
            pending_action_for: BTreeSet::new(),
            action_emitted: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.task_state, TaskState::Running)
    }
}

/// Persists RunningTasks after every state transition and allows recovery
/// of all non-terminal tasks on startup.
#[async_trait::async_trait]
pub trait RunningTaskDb: Send + Sync {
    async fn upsert(&self, task: &RunningTask) -> TaskerResult<()>;
    async fn remove(&self, id: &TaskId) -> TaskerResult<()>;
    async fn load_non_terminal(&self) -> TaskerResult<Vec<RunningTask>>;
}

/// In-memory RunningTaskDb, optionally mirrored to a JSON file so state
/// survives a process restart.
pub struct FileRunningTaskDb {
    tasks: RwLock<Vec<RunningTask>>,
    path: Option<PathBuf>,
}

impl FileRunningTaskDb {
    pub fn in_memory() -> Self {
        Self {
            tasks: RwLock::new(Vec::new()),
            path: None,
        }
    }

    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let tasks = std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        Self {
            tasks: RwLock::new(tasks),
            path: Some(path),
        }
    }

    async fn persist(&self, tasks: &[RunningTask]) {
        if let Some(path) = &self.path {
            if let Ok(bytes) = serde_json::to_vec_pretty(tasks) {
                let _ = tokio::fs::write(path, bytes).await;
            }
        }
    }
}

#[async_trait::async_trait]
impl RunningTaskDb for FileRunningTaskDb {
    async fn upsert(&self, task: &RunningTask) -> TaskerResult<()> {
        let mut tasks = self.tasks.write().await;
        if let Some(existing) = tasks.iter_mut().find(|t| t.id == task.id) {
            *existing = task.clone();
        } else {
            tasks.push(task.clone());
        }
        debug!(task_id = %task.id, "running task persisted");
        self.persist(&tasks).await;
        Ok(())
    }

    async fn remove(&self, id: &TaskId) -> TaskerResult<()> {
        let mut tasks = self.tasks.write().await;
        tasks.retain(|t| t.id != *id);
        self.persist(&tasks).await;
        Ok(())
    }

    async fn load_non_terminal(&self) -> TaskerResult<Vec<RunningTask>> {
        let tasks = self.tasks.read().await;
        Ok(tasks.iter().filter(|t| !t.is_terminal()).cloned().collect())
    }
}

pub type SharedRunningTaskDb = Arc<dyn RunningTaskDb>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_then_load_returns_only_non_terminal_tasks() {
        let db = FileRunningTaskDb::in_memory();
        let mut t1 = RunningTask::new(TaskDescriptorId::new("wf1"));
        let t2 = RunningTask::new(TaskDescriptorId::new("wf2"));
        db.upsert(&t1).await.unwrap();
        db.upsert(&t2).await.unwrap();

        t1.task_state = TaskState::TaskSucceeded;
        db.upsert(&t1).await.unwrap();

        let loaded = db.load_non_terminal().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, t2.id);
    }

    #[tokio::test]
    async fn recovery_from_the_same_state_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("running_tasks.json");
        let t = RunningTask::new(TaskDescriptorId::new("wf1"));

        {
            let db = FileRunningTaskDb::at_path(&path);
            db.upsert(&t).await.unwrap();
        }

        let first = FileRunningTaskDb::at_path(&path).load_non_terminal().await.unwrap();
        let second = FileRunningTaskDb::at_path(&path).load_non_terminal().await.unwrap();
        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].id, second[0].id);
    }

    #[tokio::test]
    async fn remove_deletes_the_task() {
        let db = FileRunningTaskDb::in_memory();
        let t = RunningTask::new(TaskDescriptorId::new("wf1"));
        db.upsert(&t).await.unwrap();
        db.remove(&t.id).await.unwrap();
        assert!(db.load_non_terminal().await.unwrap().is_empty());
    }
}
