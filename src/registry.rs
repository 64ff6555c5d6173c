// src/registry.rs

//! Live state of every in-flight transfer: task records, byte progress and
//! cancellation handles. All mutation goes through one lock, so the upload
//! and download paths can share a registry from any number of tasks.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TransferError};
use crate::models::{TaskId, TaskStatus, TransferTask};

/// Bytes moved so far for one task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub loaded: u64,
    pub total: u64,
}

/// A task as seen by the progress aggregator.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    /// `None` once the task was aborted or cleared.
    pub progress: Option<Progress>,
}

/// Shared handle to the registry. Clones point at the same state.
#[derive(Debug, Clone, Default)]
pub struct TransferRegistry {
    state: Arc<Mutex<RegistryState>>,
}

#[derive(Debug, Default)]
struct RegistryState {
    tasks: HashMap<TaskId, TransferTask>,
    progress: HashMap<TaskId, Progress>,
    cancel_handles: HashMap<TaskId, CancellationToken>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task and seeds its progress at zero.
    pub async fn insert_task(&self, task: TransferTask) -> TaskId {
        let id = task.id;
        let mut state = self.state.lock().await;
        state.progress.insert(
            id,
            Progress {
                loaded: 0,
                total: task.total_bytes,
            },
        );
        state.tasks.insert(id, task);
        id
    }

    pub async fn task(&self, id: TaskId) -> Option<TransferTask> {
        self.state.lock().await.tasks.get(&id).cloned()
    }

    pub async fn tasks(&self) -> Vec<TransferTask> {
        let state = self.state.lock().await;
        let mut tasks: Vec<_> = state.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Moves a task to `next`. Illegal moves are rejected and leave the task
    /// as it was. Aborting drops the task's progress entry.
    pub async fn transition(
        &self,
        id: TaskId,
        next: TaskStatus,
        message: Option<String>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| TransferError::Validation(format!("unknown task {id}")))?;
        task.transition(next, message)?;
        tracing::debug!(task = %id, name = %task.name, status = %next, "task transition");

        if next == TaskStatus::Aborted {
            state.progress.remove(&id);
        }
        Ok(())
    }

    /// Records bytes moved. Ignored unless the task is pending or active.
    pub async fn set_progress(&self, id: TaskId, loaded: u64, total: u64) -> bool {
        let mut state = self.state.lock().await;
        let live = state
            .tasks
            .get(&id)
            .is_some_and(|t| !t.status.is_terminal());
        if live {
            state.progress.insert(id, Progress { loaded, total });
        }
        live
    }

    pub async fn progress(&self, id: TaskId) -> Option<Progress> {
        self.state.lock().await.progress.get(&id).copied()
    }

    pub async fn get_all(&self) -> HashMap<TaskId, Progress> {
        self.state.lock().await.progress.clone()
    }

    pub async fn register_cancel_handle(&self, id: TaskId, handle: CancellationToken) {
        self.state.lock().await.cancel_handles.insert(id, handle);
    }

    /// Drops a task's cancellation handle without firing it.
    pub async fn release_cancel_handle(&self, id: TaskId) {
        self.state.lock().await.cancel_handles.remove(&id);
    }

    /// Fires and removes the task's cancellation handle.
    ///
    /// The task is marked aborted and its bytes leave the progress map in the
    /// same step, so aggregate sums exclude it from the next sample on.
    /// Returns `false` when the task had no handle (unknown or finished).
    pub async fn cancel(&self, id: TaskId) -> bool {
        let mut state = self.state.lock().await;
        let Some(handle) = state.cancel_handles.remove(&id) else {
            return false;
        };
        handle.cancel();

        if let Some(task) = state.tasks.get_mut(&id) {
            if !task.status.is_terminal() {
                // Pending and active can both move to aborted.
                let _ = task.transition(TaskStatus::Aborted, None);
            }
            tracing::info!(task = %id, name = %task.name, "transfer cancelled");
        }
        state.progress.remove(&id);
        true
    }

    /// Forgets everything about a task.
    pub async fn clear(&self, id: TaskId) {
        let mut state = self.state.lock().await;
        state.tasks.remove(&id);
        state.progress.remove(&id);
        state.cancel_handles.remove(&id);
    }

    /// Forgets every task in a terminal state. Returns how many were dropped.
    pub async fn clear_finished(&self) -> usize {
        let mut state = self.state.lock().await;
        let finished: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|t| t.status.is_terminal())
            .map(|t| t.id)
            .collect();
        for id in &finished {
            state.tasks.remove(id);
            state.progress.remove(id);
            state.cancel_handles.remove(id);
        }
        finished.len()
    }

    pub async fn has_active(&self) -> bool {
        self.state.lock().await.tasks.values().any(TransferTask::is_active)
    }

    /// Consistent view of all tasks and their progress, oldest first.
    pub async fn snapshot(&self) -> Vec<TaskSnapshot> {
        let state = self.state.lock().await;
        let mut snapshot: Vec<_> = state
            .tasks
            .values()
            .map(|task| TaskSnapshot {
                id: task.id,
                name: task.name.clone(),
                status: task.status,
                progress: state.progress.get(&task.id).copied(),
            })
            .collect();
        snapshot.sort_by_key(|s| state.tasks.get(&s.id).map(|t| t.created_at));
        snapshot
    }

    /// Handle a transport uses to report bytes for one task.
    pub fn progress_handle(&self, id: TaskId) -> ProgressHandle {
        ProgressHandle {
            registry: self.clone(),
            task_id: id,
        }
    }
}

/// Reporting end given to storage backends while they move a unit's bytes.
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    registry: TransferRegistry,
    task_id: TaskId,
}

impl ProgressHandle {
    /// A handle attached to no live task; reports go nowhere.
    pub fn detached() -> Self {
        Self {
            registry: TransferRegistry::new(),
            task_id: TaskId::new(),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub async fn report(&self, loaded: u64, total: u64) {
        self.registry.set_progress(self.task_id, loaded, total).await;
    }
}
