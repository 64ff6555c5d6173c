// src/store/local.rs

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::TryStreamExt;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use super::{ByteStream, ChunkStore, StoreError, StoreRequest, STREAM_PIECE};
use crate::catalog::{CatalogEntry, ChunkCatalog};
use crate::models::{ChunkDescriptor, GroupId, RemoteId};
use crate::registry::ProgressHandle;

/// Suffix of objects still being written.
const PARTIAL_SUFFIX: &str = ".part";

/// Backend keeping chunk bytes as files under a root directory, one file per
/// remote id, with metadata in a [`ChunkCatalog`].
pub struct LocalStore {
    root: PathBuf,
    catalog: ChunkCatalog,
}

impl LocalStore {
    /// Opens the store, creating the root directory and catalog if needed.
    /// Partial objects left by interrupted writes are removed.
    pub async fn open(root: impl Into<PathBuf>, catalog_path: &Path) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        if let Some(parent) = catalog_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let catalog = ChunkCatalog::open(catalog_path).await?;
        let store = Self { root, catalog };
        store.sweep_partial_objects().await?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn catalog(&self) -> &ChunkCatalog {
        &self.catalog
    }

    fn object_path(&self, remote_id: &RemoteId) -> PathBuf {
        self.root.join(remote_id.as_str())
    }

    fn partial_path(&self, remote_id: &RemoteId) -> PathBuf {
        self.root.join(format!("{}{PARTIAL_SUFFIX}", remote_id.as_str()))
    }

    async fn sweep_partial_objects(&self) -> Result<usize, StoreError> {
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().ends_with(PARTIAL_SUFFIX) {
                fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, root = %self.root.display(), "removed partial objects");
        }
        Ok(removed)
    }

    async fn write_object(
        &self,
        path: &Path,
        request: &StoreRequest,
        progress: &ProgressHandle,
    ) -> Result<(), StoreError> {
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)
            .await?;

        let total = request.content.len() as u64;
        let mut written = 0u64;
        for piece in request.content.chunks(STREAM_PIECE) {
            file.write_all(piece).await?;
            written += piece.len() as u64;
            progress.report(written, total).await;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
}

/// Undoes a store that did not finish, including one whose future was
/// dropped mid-way. Disarmed once the catalog row is committed.
struct PendingObject {
    partial_path: PathBuf,
    final_path: PathBuf,
    /// Set once the catalog row may have been queued.
    recorded: Option<(ChunkCatalog, RemoteId)>,
    armed: bool,
}

impl PendingObject {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingObject {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let _ = std::fs::remove_file(&self.partial_path);
        let _ = std::fs::remove_file(&self.final_path);

        // Catalog calls run in order on one connection, so this delete lands
        // after any record already queued.
        if let Some((catalog, remote_id)) = self.recorded.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if let Err(e) = catalog.remove(&remote_id).await {
                        tracing::warn!(remote_id = %remote_id, error = %e, "failed to drop catalog row of unfinished store");
                    }
                });
            }
        }
    }
}

#[async_trait]
impl ChunkStore for LocalStore {
    async fn store_chunk(
        &self,
        request: StoreRequest,
        progress: ProgressHandle,
    ) -> Result<RemoteId, StoreError> {
        let remote_id = RemoteId::new(Uuid::new_v4().to_string());
        let mut pending = PendingObject {
            partial_path: self.partial_path(&remote_id),
            final_path: self.object_path(&remote_id),
            recorded: None,
            armed: true,
        };

        self.write_object(&pending.partial_path, &request, &progress)
            .await?;
        // Synchronous so a dropped future never leaves the rename half done.
        std::fs::rename(&pending.partial_path, &pending.final_path)?;

        let entry = CatalogEntry {
            remote_id: remote_id.clone(),
            group_id: request.group_id,
            index: request.index,
            total: request.total,
            name: request.name,
            original_name: request.original_name,
            mime_type: request.mime_type,
            size: request.content.len() as u64,
            parent_folder: request.parent_folder,
            stored_at: Utc::now(),
        };
        pending.recorded = Some((self.catalog.clone(), remote_id.clone()));
        self.catalog.record(&entry).await?;
        pending.disarm();

        tracing::debug!(remote_id = %remote_id, name = %entry.name, "chunk stored on disk");
        Ok(remote_id)
    }

    async fn fetch_chunk_bytes(&self, remote_id: &RemoteId) -> Result<ByteStream, StoreError> {
        if self.catalog.get(remote_id).await?.is_none() {
            return Err(StoreError::NotFound(remote_id.clone()));
        }
        let file = fs::File::open(self.object_path(remote_id)).await?;
        let stream = ReaderStream::with_capacity(file, STREAM_PIECE).map_err(StoreError::from);
        Ok(Box::pin(stream))
    }

    async fn list_chunks(&self, group_id: &GroupId) -> Result<Vec<ChunkDescriptor>, StoreError> {
        let entries = self.catalog.list_group(group_id).await?;
        Ok(entries.iter().map(CatalogEntry::descriptor).collect())
    }

    async fn delete_chunks(&self, group_id: &GroupId) -> Result<(), StoreError> {
        for entry in self.catalog.list_group(group_id).await? {
            match fs::remove_file(self.object_path(&entry.remote_id)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        let removed = self.catalog.delete_group(group_id).await?;
        tracing::debug!(%group_id, removed, "deleted chunk group");
        Ok(())
    }
}
