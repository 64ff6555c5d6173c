// src/error.rs

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, TransferError>;

/// Errors surfaced by the transfer engine.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Malformed file, group or task input.
    #[error("validation error: {0}")]
    Validation(String),
    /// One unit failed on the way to or from the backend.
    #[error("transport error: {0}")]
    Transport(#[from] StoreError),
    #[error("transfer of '{0}' was aborted")]
    Aborted(String),
    #[error("chunk group is incomplete: {present} of {expected} chunks present")]
    IncompleteGroup { present: usize, expected: u32 },
    #[error("merge failed: {0}")]
    Merge(String),
    /// A spawned unit task panicked or was torn down before reporting.
    #[error("transfer task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(String),
}

impl TransferError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }
}
