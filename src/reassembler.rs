// src/reassembler.rs

//! Download side: fetches every member of a complete chunk group
//! concurrently and merges them back in index order.

use std::path::Path;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TransferError};
use crate::group::{is_complete, sort_chunks};
use crate::integrity::sha256_hex;
use crate::limiter::TransferLimiter;
use crate::models::{guess_mime_type, ChunkDescriptor, Direction, GroupId, TaskId, TaskStatus, TransferTask};
use crate::registry::TransferRegistry;
use crate::slicer::parse_chunk_name;
use crate::store::ChunkStore;

/// Share of overall progress spent fetching; the rest is the merge.
const FETCH_SHARE: f64 = 80.0;

/// What to rebuild and how to label it.
#[derive(Debug, Clone)]
pub struct ReassemblyRequest {
    pub file_name: String,
    pub mime_type: String,
    pub chunks: Vec<ChunkDescriptor>,
    /// Hex SHA-256 the merged output must match, when given.
    pub expected_sha256: Option<String>,
}

impl ReassemblyRequest {
    pub fn new(file_name: impl Into<String>, chunks: Vec<ChunkDescriptor>) -> Self {
        let file_name = file_name.into();
        let mime_type = guess_mime_type(&file_name);
        Self {
            file_name,
            mime_type,
            chunks,
            expected_sha256: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    pub fn with_expected_sha256(mut self, digest: impl Into<String>) -> Self {
        self.expected_sha256 = Some(digest.into());
        self
    }
}

/// Progress notifications emitted while a reassembly runs.
#[derive(Debug, Clone, PartialEq)]
pub enum ReassemblyEvent {
    /// A chunk changed state. `position` is its place in index order.
    Chunk {
        position: usize,
        index: u32,
        name: String,
        status: TaskStatus,
        error: Option<String>,
    },
    /// Overall percentage: fetching covers 0-80, merging 80-100.
    Overall(f64),
}

/// The rebuilt file.
#[derive(Debug, Clone)]
pub struct ReassembledFile {
    pub name: String,
    pub mime_type: String,
    pub content: Bytes,
}

impl ReassembledFile {
    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }

    pub async fn write_to(&self, path: &Path) -> Result<()> {
        tokio::fs::write(path, &self.content).await?;
        Ok(())
    }
}

#[derive(Clone, Default)]
struct EventSink(Option<mpsc::UnboundedSender<ReassemblyEvent>>);

impl EventSink {
    fn emit(&self, event: ReassemblyEvent) {
        if let Some(tx) = &self.0 {
            // A dropped receiver only means nobody is listening.
            let _ = tx.send(event);
        }
    }
}

/// Rebuilds files from their stored chunks.
pub struct Reassembler<S: ChunkStore + ?Sized + 'static> {
    store: Arc<S>,
    registry: TransferRegistry,
    limiter: TransferLimiter,
}

impl<S: ChunkStore + ?Sized + 'static> Reassembler<S> {
    pub fn new(store: Arc<S>, registry: TransferRegistry) -> Self {
        Self {
            store,
            registry,
            limiter: TransferLimiter::unbounded(),
        }
    }

    pub fn with_limiter(mut self, limiter: TransferLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Lists a group from the store and rebuilds it, naming the output
    /// after the original file encoded in the chunk names.
    pub async fn reassemble_group(
        &self,
        group_id: GroupId,
        events: Option<mpsc::UnboundedSender<ReassemblyEvent>>,
    ) -> Result<ReassembledFile> {
        let request = self.group_request(group_id).await?;
        self.reassemble(request, events).await
    }

    /// Request for every stored member of a group, named after the original
    /// file encoded in the chunk names.
    pub async fn group_request(&self, group_id: GroupId) -> Result<ReassemblyRequest> {
        let chunks = self.store.list_chunks(&group_id).await?;
        let Some(first) = sort_chunks(&chunks).into_iter().next() else {
            return Err(TransferError::IncompleteGroup {
                present: 0,
                expected: 0,
            });
        };
        let file_name = parse_chunk_name(&first.name)
            .map(|parsed| parsed.original_name())
            .unwrap_or(first.name);
        Ok(ReassemblyRequest::new(file_name, chunks))
    }

    /// Fetches and merges every chunk of `request`.
    ///
    /// Incomplete groups fail before anything is fetched. Any chunk failure
    /// cancels the remaining fetches and fails the whole reassembly; no
    /// partial output is returned.
    pub async fn reassemble(
        &self,
        request: ReassemblyRequest,
        events: Option<mpsc::UnboundedSender<ReassemblyEvent>>,
    ) -> Result<ReassembledFile> {
        if !is_complete(&request.chunks) {
            return Err(TransferError::IncompleteGroup {
                present: request.chunks.len(),
                expected: request.chunks.first().map_or(0, |c| c.total),
            });
        }
        let events = EventSink(events);
        let sorted = sort_chunks(&request.chunks);
        let total = sorted.len();
        events.emit(ReassemblyEvent::Overall(0.0));

        let group_token = CancellationToken::new();
        let mut fetches = JoinSet::new();
        let mut task_ids = Vec::with_capacity(total);
        for (position, chunk) in sorted.iter().enumerate() {
            let task = TransferTask::new(chunk.name.clone(), Direction::Download, chunk.size.unwrap_or(0));
            let task_id = self.registry.insert_task(task).await;
            let token = group_token.child_token();
            self.registry.register_cancel_handle(task_id, token.clone()).await;
            task_ids.push(task_id);

            let job = FetchJob {
                store: Arc::clone(&self.store),
                registry: self.registry.clone(),
                limiter: self.limiter.clone(),
                events: events.clone(),
                task_id,
                position,
                chunk: chunk.clone(),
            };
            fetches.spawn(async move { (position, job.run(token).await) });
        }

        let mut parts: Vec<Option<Bytes>> = vec![None; total];
        let mut fetched = 0usize;
        let mut failure: Option<TransferError> = None;
        while let Some(joined) = fetches.join_next().await {
            let outcome = joined
                .map_err(TransferError::from)
                .and_then(|(position, result)| result.map(|bytes| (position, bytes)));
            match outcome {
                Ok((position, bytes)) => {
                    parts[position] = Some(bytes);
                    fetched += 1;
                    if failure.is_none() {
                        events.emit(ReassemblyEvent::Overall(
                            FETCH_SHARE * fetched as f64 / total as f64,
                        ));
                    }
                }
                Err(e) => {
                    if failure.is_none() {
                        tracing::warn!(file = %request.file_name, error = %e, "chunk fetch failed, cancelling reassembly");
                        group_token.cancel();
                        failure = Some(e);
                    }
                }
            }
        }
        if let Some(e) = failure {
            self.settle_unfinished(&task_ids, &e).await;
            return Err(e);
        }

        let expected_len: usize = parts.iter().flatten().map(Bytes::len).sum();
        let mut merged = BytesMut::with_capacity(expected_len);
        for (position, (chunk, part)) in sorted.iter().zip(parts).enumerate() {
            events.emit(ReassemblyEvent::Overall(
                FETCH_SHARE + (100.0 - FETCH_SHARE) * position as f64 / total as f64,
            ));
            let part = part.ok_or_else(|| {
                TransferError::Merge(format!("chunk {} of {} was never fetched", chunk.index, chunk.total))
            })?;
            if let Some(size) = chunk.size {
                if size != part.len() as u64 {
                    return Err(TransferError::Merge(format!(
                        "chunk {} is {} bytes, expected {size}",
                        chunk.index,
                        part.len()
                    )));
                }
            }
            merged.extend_from_slice(&part);
        }
        let content = merged.freeze();

        if let Some(expected) = &request.expected_sha256 {
            let actual = sha256_hex(&content);
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                return Err(TransferError::Merge(format!(
                    "checksum mismatch: expected {expected}, got {actual}"
                )));
            }
        }

        events.emit(ReassemblyEvent::Overall(100.0));
        tracing::info!(file = %request.file_name, chunks = total, size = content.len(), "file reassembled");
        Ok(ReassembledFile {
            name: request.file_name,
            mime_type: request.mime_type,
            content,
        })
    }

    /// Marks tasks whose fetch died without recording an outcome as failed.
    async fn settle_unfinished(&self, task_ids: &[TaskId], cause: &TransferError) {
        for &task_id in task_ids {
            let live = self
                .registry
                .task(task_id)
                .await
                .is_some_and(|t| !t.status.is_terminal());
            if live {
                if let Err(e) = self
                    .registry
                    .transition(task_id, TaskStatus::Error, Some(cause.to_string()))
                    .await
                {
                    tracing::debug!(task = %task_id, error = %e, "chunk settled concurrently");
                }
                self.registry.release_cancel_handle(task_id).await;
            }
        }
    }
}

/// One chunk fetch, run as its own task.
struct FetchJob<S: ChunkStore + ?Sized> {
    store: Arc<S>,
    registry: TransferRegistry,
    limiter: TransferLimiter,
    events: EventSink,
    task_id: TaskId,
    position: usize,
    chunk: ChunkDescriptor,
}

impl<S: ChunkStore + ?Sized> FetchJob<S> {
    async fn run(self, token: CancellationToken) -> Result<Bytes> {
        let task_id = self.task_id;
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(TransferError::Aborted(self.chunk.name.clone())),
            result = self.fetch() => result,
        };

        let status = match &outcome {
            Ok(bytes) => {
                let len = bytes.len() as u64;
                self.registry.set_progress(task_id, len, len).await;
                self.finish(TaskStatus::Completed, None).await
            }
            Err(e) if e.is_aborted() || token.is_cancelled() => {
                self.finish(TaskStatus::Aborted, None).await
            }
            Err(e) => self.finish(TaskStatus::Error, Some(e.to_string())).await,
        };
        self.registry.release_cancel_handle(task_id).await;

        self.events.emit(ReassemblyEvent::Chunk {
            position: self.position,
            index: self.chunk.index,
            name: self.chunk.name.clone(),
            status,
            error: outcome.as_ref().err().map(ToString::to_string),
        });
        outcome
    }

    /// Records the terminal state and returns the one the task ended in.
    async fn finish(&self, next: TaskStatus, message: Option<String>) -> TaskStatus {
        if let Err(e) = self.registry.transition(self.task_id, next, message).await {
            tracing::debug!(task = %self.task_id, error = %e, "chunk already terminal");
        }
        self.registry
            .task(self.task_id)
            .await
            .map_or(next, |t| t.status)
    }

    async fn fetch(&self) -> Result<Bytes> {
        let _permit = self.limiter.acquire().await?;
        self.registry
            .transition(self.task_id, TaskStatus::Active, None)
            .await?;
        self.events.emit(ReassemblyEvent::Chunk {
            position: self.position,
            index: self.chunk.index,
            name: self.chunk.name.clone(),
            status: TaskStatus::Active,
            error: None,
        });

        let mut stream = self.store.fetch_chunk_bytes(&self.chunk.remote_id).await?;
        let mut buffer = BytesMut::with_capacity(self.chunk.size.unwrap_or(0) as usize);
        while let Some(piece) = stream.next().await {
            buffer.extend_from_slice(&piece?);
            let loaded = buffer.len() as u64;
            let total = self.chunk.size.unwrap_or(0).max(loaded);
            self.registry.set_progress(self.task_id, loaded, total).await;
        }
        tracing::debug!(task = %self.task_id, name = %self.chunk.name, size = buffer.len(), "chunk fetched");
        Ok(buffer.freeze())
    }
}
