// src/store/memory.rs

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use tokio::sync::Mutex;

use super::{ByteStream, ChunkStore, StoreError, StoreRequest, STREAM_PIECE};
use crate::models::{ChunkDescriptor, GroupId, RemoteId};
use crate::registry::ProgressHandle;

#[derive(Debug, Clone)]
struct StoredObject {
    group_id: Option<GroupId>,
    index: u32,
    total: u32,
    name: String,
    content: Bytes,
}

/// Backend that keeps everything in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    objects: Arc<Mutex<HashMap<RemoteId, StoredObject>>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.lock().await.is_empty()
    }

    /// Names of everything stored, sorted.
    pub async fn names(&self) -> Vec<String> {
        let objects = self.objects.lock().await;
        let mut names: Vec<_> = objects.values().map(|o| o.name.clone()).collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ChunkStore for MemoryStore {
    async fn store_chunk(
        &self,
        request: StoreRequest,
        progress: ProgressHandle,
    ) -> Result<RemoteId, StoreError> {
        let total = request.content.len() as u64;
        let mut sent = 0u64;
        for piece in request.content.chunks(STREAM_PIECE) {
            sent += piece.len() as u64;
            progress.report(sent, total).await;
            tokio::task::yield_now().await;
        }

        let remote_id = RemoteId::new(format!(
            "mem-{}",
            self.next_id.fetch_add(1, Ordering::SeqCst) + 1
        ));
        self.objects.lock().await.insert(
            remote_id.clone(),
            StoredObject {
                group_id: request.group_id,
                index: request.index,
                total: request.total,
                name: request.name,
                content: request.content,
            },
        );
        Ok(remote_id)
    }

    async fn fetch_chunk_bytes(&self, remote_id: &RemoteId) -> Result<ByteStream, StoreError> {
        let content = self
            .objects
            .lock()
            .await
            .get(remote_id)
            .map(|o| o.content.clone())
            .ok_or_else(|| StoreError::NotFound(remote_id.clone()))?;

        let pieces: Vec<Result<Bytes, StoreError>> = (0..content.len())
            .step_by(STREAM_PIECE)
            .map(|start| Ok(content.slice(start..(start + STREAM_PIECE).min(content.len()))))
            .collect();
        Ok(Box::pin(stream::iter(pieces)))
    }

    async fn list_chunks(&self, group_id: &GroupId) -> Result<Vec<ChunkDescriptor>, StoreError> {
        let objects = self.objects.lock().await;
        let mut chunks: Vec<ChunkDescriptor> = objects
            .iter()
            .filter(|(_, o)| o.group_id.as_ref() == Some(group_id))
            .map(|(remote_id, o)| ChunkDescriptor {
                remote_id: remote_id.clone(),
                name: o.name.clone(),
                index: o.index,
                total: o.total,
                size: Some(o.content.len() as u64),
            })
            .collect();
        chunks.sort_by_key(|c| c.index);
        Ok(chunks)
    }

    async fn delete_chunks(&self, group_id: &GroupId) -> Result<(), StoreError> {
        self.objects
            .lock()
            .await
            .retain(|_, o| o.group_id.as_ref() != Some(group_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;

    fn request(group_id: Option<GroupId>, index: u32, content: &'static [u8]) -> StoreRequest {
        StoreRequest {
            group_id,
            index,
            total: 2,
            name: format!("a.part{index}of2.bin"),
            content: Bytes::from_static(content),
            original_name: "a.bin".into(),
            mime_type: "application/octet-stream".into(),
            parent_folder: None,
        }
    }

    #[tokio::test]
    async fn stored_bytes_come_back() {
        let store = MemoryStore::new();
        let id = store
            .store_chunk(request(None, 1, b"hello"), ProgressHandle::detached())
            .await
            .unwrap();

        let pieces: Vec<Bytes> = store.fetch_chunk_bytes(&id).await.unwrap().try_collect().await.unwrap();
        assert_eq!(pieces.concat(), b"hello");
    }

    #[tokio::test]
    async fn list_and_delete_by_group() {
        let store = MemoryStore::new();
        let group = GroupId::new();
        store.store_chunk(request(Some(group), 2, b"b"), ProgressHandle::detached()).await.unwrap();
        store.store_chunk(request(Some(group), 1, b"a"), ProgressHandle::detached()).await.unwrap();
        store.store_chunk(request(None, 1, b"c"), ProgressHandle::detached()).await.unwrap();

        let listed = store.list_chunks(&group).await.unwrap();
        assert_eq!(listed.iter().map(|c| c.index).collect::<Vec<_>>(), vec![1, 2]);

        store.delete_chunks(&group).await.unwrap();
        assert!(store.list_chunks(&group).await.unwrap().is_empty());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let store = MemoryStore::new();
        let err = store.fetch_chunk_bytes(&RemoteId::new("nope")).await.err().unwrap();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
