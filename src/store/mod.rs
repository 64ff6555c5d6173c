// src/store/mod.rs

//! The storage backend contract the engine talks to, plus two backends:
//! an in-memory one and a local directory indexed by a SQLite catalog.

mod local;
mod memory;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use thiserror::Error;

use crate::catalog::CatalogError;
use crate::models::{ChunkDescriptor, GroupId, RemoteId};
use crate::registry::ProgressHandle;

pub use local::LocalStore;
pub use memory::MemoryStore;

/// Size of the pieces backends stream in.
pub(crate) const STREAM_PIECE: usize = 64 * 1024;

/// Bytes of one stored unit, delivered piece by piece.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StoreError>> + Send>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("remote object {0} not found")]
    NotFound(RemoteId),
    #[error("backend rejected the request: {0}")]
    Rejected(String),
}

/// Everything the backend needs to persist one unit and its metadata.
#[derive(Debug, Clone)]
pub struct StoreRequest {
    /// `None` for a file uploaded whole.
    pub group_id: Option<GroupId>,
    pub index: u32,
    pub total: u32,
    pub name: String,
    pub content: Bytes,
    pub original_name: String,
    pub mime_type: String,
    pub parent_folder: Option<i64>,
}

/// Storage backend holding chunk bytes under opaque remote ids.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Persists one unit, reporting bytes sent through `progress`, and
    /// returns the id the backend assigned to it.
    async fn store_chunk(
        &self,
        request: StoreRequest,
        progress: ProgressHandle,
    ) -> Result<RemoteId, StoreError>;

    async fn fetch_chunk_bytes(&self, remote_id: &RemoteId) -> Result<ByteStream, StoreError>;

    /// Stored members of a group, in index order.
    async fn list_chunks(&self, group_id: &GroupId) -> Result<Vec<ChunkDescriptor>, StoreError>;

    /// Removes every stored member of a group. Deleting an unknown or empty
    /// group succeeds.
    async fn delete_chunks(&self, group_id: &GroupId) -> Result<(), StoreError>;
}
