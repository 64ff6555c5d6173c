// src/uploader.rs

//! Upload side: slices files, registers one task per unit and drives every
//! unit to a terminal state independently of its siblings.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TransferError};
use crate::limiter::TransferLimiter;
use crate::models::{Chunk, Direction, GroupId, RemoteId, SourceFile, TaskId, TaskStatus, TransferTask};
use crate::registry::TransferRegistry;
use crate::slicer::Slicer;
use crate::store::{ChunkStore, StoreRequest};

/// Outcome of one upload unit.
#[derive(Debug, Clone)]
pub struct UnitReport {
    pub task_id: TaskId,
    pub index: u32,
    pub name: String,
    pub status: TaskStatus,
    /// Set only when the unit completed.
    pub remote_id: Option<RemoteId>,
    pub error: Option<String>,
}

/// Outcome of every unit cut from one source file.
#[derive(Debug, Clone)]
pub struct FileUploadReport {
    pub file_name: String,
    pub group_id: Option<GroupId>,
    /// `error` if any unit errored, else `aborted` if any was aborted,
    /// else `completed`.
    pub status: TaskStatus,
    /// Units in index order.
    pub units: Vec<UnitReport>,
    /// Whether the stored members of an unfinished group were deleted.
    pub cleaned_up: bool,
}

impl FileUploadReport {
    /// Remote ids of the units that made it, in index order.
    pub fn remote_ids(&self) -> Vec<RemoteId> {
        self.units.iter().filter_map(|u| u.remote_id.clone()).collect()
    }

    pub fn completed(&self) -> usize {
        self.units
            .iter()
            .filter(|u| u.status == TaskStatus::Completed)
            .count()
    }

    pub fn failed(&self) -> Vec<&UnitReport> {
        self.units
            .iter()
            .filter(|u| u.status == TaskStatus::Error)
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub files: Vec<FileUploadReport>,
}

impl BatchReport {
    pub fn file(&self, name: &str) -> Option<&FileUploadReport> {
        self.files.iter().find(|f| f.file_name == name)
    }

    pub fn is_success(&self) -> bool {
        self.files.iter().all(|f| f.status == TaskStatus::Completed)
    }
}

struct PreparedUnit {
    task_id: TaskId,
    token: CancellationToken,
    chunk: Chunk,
}

struct PreparedFile {
    name: String,
    mime_type: String,
    group_id: Option<GroupId>,
    units: Vec<PreparedUnit>,
}

/// Files sliced and registered as pending tasks, not yet started.
pub struct UploadBatch {
    parent_folder: Option<i64>,
    files: Vec<PreparedFile>,
}

impl UploadBatch {
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.files
            .iter()
            .flat_map(|f| f.units.iter().map(|u| u.task_id))
            .collect()
    }

    /// Task ids of one file's units in index order.
    pub fn task_ids_for(&self, file_name: &str) -> Vec<TaskId> {
        self.files
            .iter()
            .filter(|f| f.name == file_name)
            .flat_map(|f| f.units.iter().map(|u| u.task_id))
            .collect()
    }

    pub fn group_id_for(&self, file_name: &str) -> Option<GroupId> {
        self.files
            .iter()
            .find(|f| f.name == file_name)
            .and_then(|f| f.group_id)
    }

    pub fn unit_count(&self) -> usize {
        self.files.iter().map(|f| f.units.len()).sum()
    }
}

/// Runs upload batches against a storage backend.
pub struct UploadCoordinator<S: ChunkStore + ?Sized + 'static> {
    store: Arc<S>,
    registry: TransferRegistry,
    limiter: TransferLimiter,
    slicer: Slicer,
    cleanup_incomplete_groups: bool,
}

impl<S: ChunkStore + ?Sized + 'static> UploadCoordinator<S> {
    pub fn new(store: Arc<S>, registry: TransferRegistry) -> Self {
        Self {
            store,
            registry,
            limiter: TransferLimiter::unbounded(),
            slicer: Slicer::default(),
            cleanup_incomplete_groups: false,
        }
    }

    pub fn with_limiter(mut self, limiter: TransferLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_slicer(mut self, slicer: Slicer) -> Self {
        self.slicer = slicer;
        self
    }

    /// Delete the stored members of any group that did not fully complete.
    pub fn with_cleanup(mut self, enabled: bool) -> Self {
        self.cleanup_incomplete_groups = enabled;
        self
    }

    pub fn registry(&self) -> &TransferRegistry {
        &self.registry
    }

    /// Slices every file and registers each unit as a pending task with its
    /// own cancellation handle. Nothing is sent yet.
    pub async fn prepare(&self, files: Vec<SourceFile>, parent_folder: Option<i64>) -> Result<UploadBatch> {
        let mut sliced = Vec::with_capacity(files.len());
        for file in files {
            if file.name.trim().is_empty() {
                return Err(TransferError::Validation("file name must not be empty".into()));
            }
            let chunks = self.slicer.slice(&file)?;
            sliced.push((file, chunks));
        }

        let mut prepared = Vec::with_capacity(sliced.len());
        for (file, chunks) in sliced {
            let group_id = chunks.first().and_then(|c| c.group_id);
            let mut units = Vec::with_capacity(chunks.len());
            for chunk in chunks {
                let task = TransferTask::new(chunk.name.clone(), Direction::Upload, chunk.size());
                let task_id = self.registry.insert_task(task).await;
                let token = CancellationToken::new();
                self.registry.register_cancel_handle(task_id, token.clone()).await;
                units.push(PreparedUnit {
                    task_id,
                    token,
                    chunk,
                });
            }
            tracing::debug!(file = %file.name, units = units.len(), "upload prepared");
            prepared.push(PreparedFile {
                name: file.name,
                mime_type: file.mime_type,
                group_id,
                units,
            });
        }

        Ok(UploadBatch {
            parent_folder,
            files: prepared,
        })
    }

    /// Starts every unit of the batch at once and waits for all of them.
    /// A failing unit never stops its siblings.
    pub async fn execute(&self, batch: UploadBatch) -> BatchReport {
        let mut running: Vec<(String, Option<GroupId>, Vec<(TaskId, u32, String, JoinHandle<UnitReport>)>)> =
            Vec::with_capacity(batch.files.len());

        for file in batch.files {
            let mut handles = Vec::with_capacity(file.units.len());
            for unit in file.units {
                let task_id = unit.task_id;
                let index = unit.chunk.index;
                let name = unit.chunk.name.clone();
                let job = UnitJob {
                    store: Arc::clone(&self.store),
                    registry: self.registry.clone(),
                    limiter: self.limiter.clone(),
                    original_name: file.name.clone(),
                    mime_type: file.mime_type.clone(),
                    parent_folder: batch.parent_folder,
                };
                handles.push((task_id, index, name, tokio::spawn(job.run(unit))));
            }
            running.push((file.name, file.group_id, handles));
        }

        let mut report = BatchReport::default();
        for (file_name, group_id, handles) in running {
            let mut units = Vec::with_capacity(handles.len());
            for (task_id, index, name, handle) in handles {
                let unit = match handle.await {
                    Ok(unit) => unit,
                    Err(e) => {
                        tracing::warn!(task = %task_id, error = %e, "upload unit panicked");
                        let message = format!("upload task failed: {e}");
                        if let Err(e) = self
                            .registry
                            .transition(task_id, TaskStatus::Error, Some(message.clone()))
                            .await
                        {
                            tracing::debug!(task = %task_id, error = %e, "panicked unit already terminal");
                        }
                        self.registry.release_cancel_handle(task_id).await;
                        UnitReport {
                            task_id,
                            index,
                            name,
                            status: TaskStatus::Error,
                            remote_id: None,
                            error: Some(message),
                        }
                    }
                };
                units.push(unit);
            }
            units.sort_by_key(|u| u.index);

            let status = overall_status(&units);
            let mut cleaned_up = false;
            if let Some(group_id) = group_id {
                if status != TaskStatus::Completed && self.cleanup_incomplete_groups {
                    match self.store.delete_chunks(&group_id).await {
                        Ok(()) => {
                            tracing::info!(file = %file_name, %group_id, "removed chunks of unfinished upload");
                            cleaned_up = true;
                        }
                        Err(e) => {
                            tracing::warn!(file = %file_name, %group_id, error = %e, "cleanup of unfinished upload failed");
                        }
                    }
                }
            }

            match status {
                TaskStatus::Completed => tracing::info!(file = %file_name, units = units.len(), "upload completed"),
                _ => tracing::warn!(file = %file_name, %status, "upload finished incomplete"),
            }

            report.files.push(FileUploadReport {
                file_name,
                group_id,
                status,
                units,
                cleaned_up,
            });
        }
        report
    }

    /// Prepares and executes in one go.
    pub async fn upload(&self, files: Vec<SourceFile>, parent_folder: Option<i64>) -> Result<BatchReport> {
        let batch = self.prepare(files, parent_folder).await?;
        Ok(self.execute(batch).await)
    }

    /// Cancels one unit. Siblings keep going.
    pub async fn cancel(&self, task_id: TaskId) -> bool {
        self.registry.cancel(task_id).await
    }

    /// Deletes every stored member of a group.
    pub async fn discard_group(&self, group_id: GroupId) -> Result<()> {
        self.store.delete_chunks(&group_id).await?;
        tracing::info!(%group_id, "chunk group discarded");
        Ok(())
    }
}

fn overall_status(units: &[UnitReport]) -> TaskStatus {
    if units.iter().any(|u| u.status == TaskStatus::Error) {
        TaskStatus::Error
    } else if units.iter().any(|u| u.status == TaskStatus::Aborted) {
        TaskStatus::Aborted
    } else {
        TaskStatus::Completed
    }
}

/// Everything one spawned unit needs.
struct UnitJob<S: ChunkStore + ?Sized> {
    store: Arc<S>,
    registry: TransferRegistry,
    limiter: TransferLimiter,
    original_name: String,
    mime_type: String,
    parent_folder: Option<i64>,
}

impl<S: ChunkStore + ?Sized> UnitJob<S> {
    async fn run(self, unit: PreparedUnit) -> UnitReport {
        let PreparedUnit {
            task_id,
            token,
            chunk,
        } = unit;
        let index = chunk.index;
        let name = chunk.name.clone();
        let size = chunk.size();

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(TransferError::Aborted(name.clone())),
            result = self.send(task_id, chunk) => result,
        };

        let mut remote_id = None;
        match outcome {
            Ok(id) => {
                self.registry.set_progress(task_id, size, size).await;
                match self.registry.transition(task_id, TaskStatus::Completed, None).await {
                    Ok(()) => {
                        tracing::debug!(task = %task_id, name = %name, remote_id = %id, "unit uploaded");
                        remote_id = Some(id);
                    }
                    Err(e) => tracing::debug!(task = %task_id, error = %e, "unit finished after cancellation"),
                }
            }
            Err(e) if e.is_aborted() || token.is_cancelled() => {
                // Cancelled through the registry, the task is already aborted.
                if let Err(e) = self.registry.transition(task_id, TaskStatus::Aborted, None).await {
                    tracing::debug!(task = %task_id, error = %e, "abort already recorded");
                }
                tracing::warn!(task = %task_id, name = %name, "unit upload cancelled");
            }
            Err(e) => {
                tracing::warn!(task = %task_id, name = %name, error = %e, "unit upload failed");
                if let Err(e) = self
                    .registry
                    .transition(task_id, TaskStatus::Error, Some(e.to_string()))
                    .await
                {
                    tracing::debug!(task = %task_id, error = %e, "failure after terminal state");
                }
            }
        }
        self.registry.release_cancel_handle(task_id).await;

        let task = self.registry.task(task_id).await;
        UnitReport {
            task_id,
            index,
            name,
            status: task.as_ref().map_or(TaskStatus::Aborted, |t| t.status),
            remote_id,
            error: task.and_then(|t| t.error_message),
        }
    }

    async fn send(&self, task_id: TaskId, chunk: Chunk) -> Result<RemoteId> {
        let _permit = self.limiter.acquire().await?;
        self.registry.transition(task_id, TaskStatus::Active, None).await?;

        let request = StoreRequest {
            group_id: chunk.group_id,
            index: chunk.index,
            total: chunk.total,
            name: chunk.name,
            content: chunk.content,
            original_name: self.original_name.clone(),
            mime_type: self.mime_type.clone(),
            parent_folder: self.parent_folder,
        };
        let remote_id = self
            .store
            .store_chunk(request, self.registry.progress_handle(task_id))
            .await?;
        Ok(remote_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn small_and_large_files_upload() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = UploadCoordinator::new(Arc::clone(&store), TransferRegistry::new())
            .with_slicer(Slicer::new(4).unwrap());

        let report = coordinator
            .upload(
                vec![
                    SourceFile::new("big.bin", vec![7u8; 10]),
                    SourceFile::new("small.txt", "hey"),
                ],
                None,
            )
            .await
            .unwrap();

        assert!(report.is_success());
        let big = report.file("big.bin").unwrap();
        assert_eq!(big.units.len(), 3);
        assert_eq!(big.remote_ids().len(), 3);
        assert!(big.group_id.is_some());

        let small = report.file("small.txt").unwrap();
        assert_eq!(small.units.len(), 1);
        assert!(small.group_id.is_none());

        assert_eq!(
            store.names().await,
            vec!["big.part1of3.bin", "big.part2of3.bin", "big.part3of3.bin", "small.txt"]
        );
    }

    #[tokio::test]
    async fn prepared_units_start_pending() {
        let registry = TransferRegistry::new();
        let coordinator = UploadCoordinator::new(Arc::new(MemoryStore::new()), registry.clone())
            .with_slicer(Slicer::new(2).unwrap());
        let batch = coordinator
            .prepare(vec![SourceFile::new("a.bin", vec![0u8; 5])], None)
            .await
            .unwrap();

        assert_eq!(batch.unit_count(), 3);
        for id in batch.task_ids_for("a.bin") {
            assert_eq!(registry.task(id).await.unwrap().status, TaskStatus::Pending);
        }
    }

    #[tokio::test]
    async fn cancelling_a_pending_unit_aborts_only_it() {
        let registry = TransferRegistry::new();
        let coordinator = UploadCoordinator::new(Arc::new(MemoryStore::new()), registry.clone())
            .with_slicer(Slicer::new(2).unwrap());
        let batch = coordinator
            .prepare(vec![SourceFile::new("a.bin", vec![0u8; 5])], None)
            .await
            .unwrap();
        let ids = batch.task_ids();
        assert!(coordinator.cancel(ids[1]).await);

        let report = coordinator.execute(batch).await;
        let file = report.file("a.bin").unwrap();
        assert_eq!(file.status, TaskStatus::Aborted);
        assert_eq!(file.units[1].status, TaskStatus::Aborted);
        assert_eq!(file.completed(), 2);
    }

    #[tokio::test]
    async fn empty_name_is_rejected() {
        let coordinator = UploadCoordinator::new(Arc::new(MemoryStore::new()), TransferRegistry::new());
        let err = coordinator
            .prepare(vec![SourceFile::new("  ", "x")], None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransferError::Validation(_)));
    }

    #[test]
    fn overall_status_prefers_error_over_abort() {
        let unit = |status| UnitReport {
            task_id: TaskId::new(),
            index: 1,
            name: "u".into(),
            status,
            remote_id: None,
            error: None,
        };
        assert_eq!(
            overall_status(&[unit(TaskStatus::Aborted), unit(TaskStatus::Error)]),
            TaskStatus::Error
        );
        assert_eq!(
            overall_status(&[unit(TaskStatus::Completed), unit(TaskStatus::Aborted)]),
            TaskStatus::Aborted
        );
        assert_eq!(overall_status(&[unit(TaskStatus::Completed)]), TaskStatus::Completed);
    }
}
