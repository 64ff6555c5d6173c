#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use telecloud::models::{ChunkDescriptor, GroupId, RemoteId, TaskId, TaskStatus};
use telecloud::registry::{ProgressHandle, TransferRegistry};
use telecloud::store::{ByteStream, ChunkStore, MemoryStore, StoreError, StoreRequest};
use tokio::sync::Notify;

pub const MIB: usize = 1024 * 1024;

/// Memory store whose calls can be held back or made to fail by name.
#[derive(Default)]
pub struct ScriptedStore {
    pub inner: MemoryStore,
    failing_uploads: Mutex<HashSet<String>>,
    failing_fetches: Mutex<HashSet<RemoteId>>,
    panicking_uploads: Mutex<HashSet<String>>,
    panicking_fetches: Mutex<HashSet<RemoteId>>,
    upload_gates: Mutex<HashMap<String, Arc<Notify>>>,
    fetch_gates: Mutex<HashMap<RemoteId, Arc<Notify>>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    fetches: AtomicUsize,
    upload_delay: Mutex<Option<Duration>>,
}

impl ScriptedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_upload(&self, name: &str) {
        self.failing_uploads.lock().unwrap().insert(name.to_string());
    }

    pub fn fail_fetch(&self, remote_id: &RemoteId) {
        self.failing_fetches.lock().unwrap().insert(remote_id.clone());
    }

    /// Makes the upload of `name` panic after reporting half its bytes.
    pub fn panic_upload(&self, name: &str) {
        self.panicking_uploads.lock().unwrap().insert(name.to_string());
    }

    pub fn panic_fetch(&self, remote_id: &RemoteId) {
        self.panicking_fetches.lock().unwrap().insert(remote_id.clone());
    }

    /// Holds the upload of `name` after half its bytes until released.
    pub fn gate_upload(&self, name: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.upload_gates
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::clone(&gate));
        gate
    }

    /// Holds the fetch of `remote_id` until released.
    pub fn gate_fetch(&self, remote_id: &RemoteId) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.fetch_gates
            .lock()
            .unwrap()
            .insert(remote_id.clone(), Arc::clone(&gate));
        gate
    }

    pub fn delay_uploads(&self, delay: Duration) {
        *self.upload_delay.lock().unwrap() = Some(delay);
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChunkStore for ScriptedStore {
    async fn store_chunk(
        &self,
        request: StoreRequest,
        progress: ProgressHandle,
    ) -> Result<RemoteId, StoreError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let total = request.content.len() as u64;
        progress.report(total / 2, total).await;

        let delay = *self.upload_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let gate = self.upload_gates.lock().unwrap().get(&request.name).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let explode = self.panicking_uploads.lock().unwrap().contains(&request.name);
        if explode {
            panic!("{} blew up mid-upload", request.name);
        }
        if self.failing_uploads.lock().unwrap().contains(&request.name) {
            return Err(StoreError::Rejected(format!("{} refused", request.name)));
        }
        self.inner.store_chunk(request, progress).await
    }

    async fn fetch_chunk_bytes(&self, remote_id: &RemoteId) -> Result<ByteStream, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let gate = self.fetch_gates.lock().unwrap().get(remote_id).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let explode = self.panicking_fetches.lock().unwrap().contains(remote_id);
        if explode {
            panic!("{remote_id} blew up mid-fetch");
        }
        if self.failing_fetches.lock().unwrap().contains(remote_id) {
            return Err(StoreError::Rejected(format!("{remote_id} unavailable")));
        }
        self.inner.fetch_chunk_bytes(remote_id).await
    }

    async fn list_chunks(&self, group_id: &GroupId) -> Result<Vec<ChunkDescriptor>, StoreError> {
        self.inner.list_chunks(group_id).await
    }

    async fn delete_chunks(&self, group_id: &GroupId) -> Result<(), StoreError> {
        self.inner.delete_chunks(group_id).await
    }
}

/// Deterministic, non-repeating-per-chunk test content.
pub fn pattern(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// Waits until the task reaches `status`, failing after a few seconds.
pub async fn wait_for_status(registry: &TransferRegistry, id: TaskId, status: TaskStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if registry.task(id).await.is_some_and(|t| t.status == status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("task {id} never became {status}"));
}

/// Waits until the task has reported some bytes.
pub async fn wait_for_progress(registry: &TransferRegistry, id: TaskId) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if registry.progress(id).await.is_some_and(|p| p.loaded > 0) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("task {id} never reported progress"));
}
