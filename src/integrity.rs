// src/integrity.rs

//! SHA-256 digests. Nothing in the engine verifies content on its own;
//! callers opt in by supplying an expected digest.

use std::path::Path;

use futures_util::TryStreamExt;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio_util::io::ReaderStream;

/// Hex SHA-256 of an in-memory buffer.
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Hex SHA-256 of a file, streamed in store-sized pieces.
pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let file = File::open(path).await?;
    let hasher = ReaderStream::with_capacity(file, 64 * 1024)
        .try_fold(Sha256::new(), |mut hasher, piece| async move {
            hasher.update(&piece);
            Ok(hasher)
        })
        .await?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compares a buffer against an expected hex digest, ignoring case.
pub fn matches_sha256(data: &[u8], expected: &str) -> bool {
    sha256_hex(data).eq_ignore_ascii_case(expected.trim())
}
