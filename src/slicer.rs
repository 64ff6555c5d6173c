// src/slicer.rs

//! Splitting of oversized files into fixed-size chunks and the naming
//! convention that lets a chunk be recognised again from its stored name:
//!
//! ```text
//! <base-name>.part<index>of<total>.<original-extension>
//! ```
//!
//! `index` is 1-based and never zero-padded. Names without an extension
//! carry the marker at the end (`README.part1of2`).

use crate::error::{Result, TransferError};
use crate::models::{Chunk, GroupId, SourceFile};

/// Largest unit sent to the backend in one piece: 20 MiB.
pub const CHUNK_SIZE: u64 = 20 * 1024 * 1024;

const PART_MARKER: &str = ".part";

/// Whether `file` is too large to upload directly at the default chunk size.
pub fn needs_slicing(file: &SourceFile) -> bool {
    file.size() > CHUNK_SIZE
}

/// Splits files at a fixed chunk size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slicer {
    chunk_size: u64,
}

impl Default for Slicer {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
        }
    }
}

impl Slicer {
    pub fn new(chunk_size: u64) -> Result<Self> {
        if chunk_size == 0 {
            return Err(TransferError::Validation(
                "chunk size must be greater than zero".into(),
            ));
        }
        Ok(Self { chunk_size })
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn needs_slicing(&self, file: &SourceFile) -> bool {
        file.size() > self.chunk_size
    }

    /// Number of units `size` bytes turn into. Files that fit go up whole.
    pub fn chunk_count(&self, size: u64) -> u64 {
        if size <= self.chunk_size {
            1
        } else {
            size.div_ceil(self.chunk_size)
        }
    }

    /// Splits `file` into upload units.
    ///
    /// Files at or under the chunk size come back as one direct unit with no
    /// group id. Larger files get a fresh group id and `ceil(size/chunk)`
    /// chunks whose ranges partition `[0, size)`.
    pub fn slice(&self, file: &SourceFile) -> Result<Vec<Chunk>> {
        let size = file.size();
        if !self.needs_slicing(file) {
            return Ok(vec![Chunk {
                group_id: None,
                index: 1,
                total: 1,
                range: 0..size,
                name: file.name.clone(),
                content: file.content.clone(),
            }]);
        }

        let total = u32::try_from(self.chunk_count(size)).map_err(|_| {
            TransferError::Validation(format!(
                "'{}' would need more than {} chunks",
                file.name,
                u32::MAX
            ))
        })?;
        let group_id = GroupId::new();

        let chunks = (1..=total)
            .map(|index| {
                let start = u64::from(index - 1) * self.chunk_size;
                let end = (start + self.chunk_size).min(size);
                Chunk {
                    group_id: Some(group_id),
                    index,
                    total,
                    range: start..end,
                    name: chunk_name(&file.name, index, total),
                    // Ranges come from the buffer length, so they fit in usize.
                    content: file.content.slice(start as usize..end as usize),
                }
            })
            .collect();

        tracing::debug!(file = %file.name, %group_id, total, size, "sliced file");
        Ok(chunks)
    }

    /// Short notice shown before an upload, `None` when no split happens.
    pub fn describe(&self, file: &SourceFile) -> Option<String> {
        self.needs_slicing(file).then(|| {
            format!(
                "File will be split into {} parts",
                self.chunk_count(file.size())
            )
        })
    }
}

/// Splits `name` into base name and extension at the last dot.
///
/// A leading dot (`.bashrc`) or a trailing dot does not start an extension.
pub fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(pos) if pos > 0 && pos + 1 < name.len() => (&name[..pos], Some(&name[pos + 1..])),
        _ => (name, None),
    }
}

/// Stored name of chunk `index` of `total` cut from `original`.
pub fn chunk_name(original: &str, index: u32, total: u32) -> String {
    match split_extension(original) {
        (base, Some(ext)) => format!("{base}{PART_MARKER}{index}of{total}.{ext}"),
        (base, None) => format!("{base}{PART_MARKER}{index}of{total}"),
    }
}

/// A chunk name taken apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkName {
    pub base_name: String,
    pub extension: Option<String>,
    pub index: u32,
    pub total: u32,
}

impl ChunkName {
    /// Name of the file the chunk was cut from.
    pub fn original_name(&self) -> String {
        match &self.extension {
            Some(ext) => format!("{}.{ext}", self.base_name),
            None => self.base_name.clone(),
        }
    }
}

/// Inverse of [`chunk_name`]. Returns `None` for anything that is not a
/// chunk name, including zero or out-of-range counters.
pub fn parse_chunk_name(name: &str) -> Option<ChunkName> {
    if let (stem, Some(ext)) = split_extension(name) {
        if let Some((base, index, total)) = parse_part_marker(stem) {
            return Some(ChunkName {
                base_name: base.to_string(),
                extension: Some(ext.to_string()),
                index,
                total,
            });
        }
    }

    parse_part_marker(name).map(|(base, index, total)| ChunkName {
        base_name: base.to_string(),
        extension: None,
        index,
        total,
    })
}

pub fn is_chunk_name(name: &str) -> bool {
    parse_chunk_name(name).is_some()
}

fn parse_part_marker(stem: &str) -> Option<(&str, u32, u32)> {
    let marker = stem.rfind(PART_MARKER)?;
    let base = &stem[..marker];
    if base.is_empty() {
        return None;
    }
    let (index, total) = stem[marker + PART_MARKER.len()..].split_once("of")?;
    let index = parse_counter(index)?;
    let total = parse_counter(total)?;
    if index == 0 || index > total {
        return None;
    }
    Some((base, index, total))
}

fn parse_counter(digits: &str) -> Option<u32> {
    let canonical = !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && !(digits.len() > 1 && digits.starts_with('0'));
    if canonical {
        digits.parse().ok()
    } else {
        None
    }
}
