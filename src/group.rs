// src/group.rs

//! Chunk groups: completeness, ordering and grouping of stored listings.

use std::collections::{BTreeMap, BTreeSet};

use crate::models::{ChunkDescriptor, RemoteId};
use crate::slicer::parse_chunk_name;

/// True iff every member agrees on `total`, there are exactly `total`
/// members, and their indices are `1..=total` with no duplicates or gaps.
pub fn is_complete(chunks: &[ChunkDescriptor]) -> bool {
    let Some(first) = chunks.first() else {
        return false;
    };
    let total = first.total;
    if chunks.len() != total as usize || chunks.iter().any(|c| c.total != total) {
        return false;
    }
    let indices: BTreeSet<u32> = chunks.iter().map(|c| c.index).collect();
    indices.len() == chunks.len() && indices.into_iter().eq(1..=total)
}

/// Chunks in ascending index order. Stable, so equal indices keep their
/// listing order.
pub fn sort_chunks(chunks: &[ChunkDescriptor]) -> Vec<ChunkDescriptor> {
    let mut sorted = chunks.to_vec();
    sorted.sort_by_key(|c| c.index);
    sorted
}

/// A file as the backend lists it, before any chunk parsing.
#[derive(Debug, Clone)]
pub struct ListedFile {
    pub remote_id: RemoteId,
    pub name: String,
    pub size: Option<u64>,
}

/// Chunks believed to come from the same original file.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkGroup {
    pub original_name: String,
    pub chunks: Vec<ChunkDescriptor>,
}

impl ChunkGroup {
    pub fn is_complete(&self) -> bool {
        is_complete(&self.chunks)
    }

    /// Expected chunk count, as claimed by the lowest-indexed member.
    pub fn total(&self) -> u32 {
        sort_chunks(&self.chunks).first().map_or(0, |c| c.total)
    }

    pub fn present(&self) -> usize {
        self.chunks.len()
    }

    /// Original name when complete, otherwise `name (present/total)`.
    pub fn display_name(&self) -> String {
        if self.is_complete() {
            self.original_name.clone()
        } else {
            format!("{} ({}/{})", self.original_name, self.present(), self.total())
        }
    }

    pub fn size(&self) -> Option<u64> {
        self.chunks.iter().map(|c| c.size).sum()
    }
}

/// Groups a flat listing by the original name encoded in chunk names.
/// Files whose names are not chunk names are left out.
pub fn group_listing<I>(listing: I) -> BTreeMap<String, ChunkGroup>
where
    I: IntoIterator<Item = ListedFile>,
{
    let mut groups: BTreeMap<String, ChunkGroup> = BTreeMap::new();
    for file in listing {
        let Some(parsed) = parse_chunk_name(&file.name) else {
            continue;
        };
        let original_name = parsed.original_name();
        groups
            .entry(original_name.clone())
            .or_insert_with(|| ChunkGroup {
                original_name,
                chunks: Vec::new(),
            })
            .chunks
            .push(ChunkDescriptor {
                remote_id: file.remote_id,
                name: file.name,
                index: parsed.index,
                total: parsed.total,
                size: file.size,
            });
    }
    groups
}

/// Original names of groups that are missing chunks.
pub fn incomplete_groups(groups: &BTreeMap<String, ChunkGroup>) -> Vec<String> {
    groups
        .values()
        .filter(|g| !g.is_complete())
        .map(|g| g.original_name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(index: u32, total: u32) -> ChunkDescriptor {
        ChunkDescriptor {
            remote_id: RemoteId::new(format!("r{index}")),
            name: format!("f.part{index}of{total}.bin"),
            index,
            total,
            size: Some(10),
        }
    }

    fn listed(name: &str) -> ListedFile {
        ListedFile {
            remote_id: RemoteId::new(name),
            name: name.into(),
            size: Some(1),
        }
    }

    #[test]
    fn complete_group_needs_every_index_once() {
        assert!(is_complete(&[desc(2, 3), desc(1, 3), desc(3, 3)]));
        assert!(is_complete(&[desc(1, 1)]));

        assert!(!is_complete(&[]));
        assert!(!is_complete(&[desc(1, 3), desc(2, 3)]));
        assert!(!is_complete(&[desc(1, 3), desc(2, 3), desc(2, 3)]));
        assert!(!is_complete(&[desc(1, 3), desc(2, 3), desc(4, 3)]));
        assert!(!is_complete(&[desc(1, 2), desc(2, 3), desc(3, 3)]));
        assert!(!is_complete(&[desc(0, 2), desc(1, 2)]));
    }

    #[test]
    fn sort_orders_by_index() {
        let sorted = sort_chunks(&[desc(3, 3), desc(1, 3), desc(2, 3)]);
        let order: Vec<u32> = sorted.iter().map(|c| c.index).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn listing_groups_by_original_name() {
        let groups = group_listing(vec![
            listed("movie.part2of2.mkv"),
            listed("notes.txt"),
            listed("movie.part1of2.mkv"),
            listed("backup.part1of3.tar"),
        ]);

        assert_eq!(groups.len(), 2);
        let movie = &groups["movie.mkv"];
        assert!(movie.is_complete());
        assert_eq!(movie.display_name(), "movie.mkv");
        assert_eq!(movie.size(), Some(2));

        let backup = &groups["backup.tar"];
        assert_eq!(backup.display_name(), "backup.tar (1/3)");
        assert_eq!(incomplete_groups(&groups), vec!["backup.tar".to_string()]);
    }
}
