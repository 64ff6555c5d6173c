pub mod catalog;
pub mod config;
pub mod error;
pub mod group;
pub mod integrity;
pub mod limiter;
pub mod models;
pub mod progress;
pub mod reassembler;
pub mod registry;
pub mod slicer;
pub mod store;
pub mod uploader;

pub use error::{Result, TransferError};

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::error::{Result, TransferError};
    pub use crate::limiter::TransferLimiter;
    pub use crate::models::{ChunkDescriptor, Direction, GroupId, RemoteId, SourceFile, TaskId, TaskStatus};
    pub use crate::progress::{ProgressMonitor, ProgressReport};
    pub use crate::reassembler::{ReassembledFile, Reassembler, ReassemblyEvent, ReassemblyRequest};
    pub use crate::registry::TransferRegistry;
    pub use crate::slicer::Slicer;
    pub use crate::store::{ChunkStore, LocalStore, MemoryStore};
    pub use crate::uploader::{BatchReport, UploadCoordinator};
}
