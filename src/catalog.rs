// src/catalog.rs

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_rusqlite::Connection;

use crate::models::{ChunkDescriptor, GroupId, RemoteId};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Metadata kept for every stored unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub remote_id: RemoteId,
    /// `None` for files uploaded whole.
    pub group_id: Option<GroupId>,
    pub index: u32,
    pub total: u32,
    pub name: String,
    pub original_name: String,
    pub mime_type: String,
    pub size: u64,
    pub parent_folder: Option<i64>,
    pub stored_at: DateTime<Utc>,
}

impl CatalogEntry {
    pub fn descriptor(&self) -> ChunkDescriptor {
        ChunkDescriptor {
            remote_id: self.remote_id.clone(),
            name: self.name.clone(),
            index: self.index,
            total: self.total,
            size: Some(self.size),
        }
    }
}

/// SQLite index of stored chunks. Clones share one connection.
#[derive(Clone)]
pub struct ChunkCatalog {
    conn: Connection,
}

impl ChunkCatalog {
    /// Opens (creating if needed) the catalog database at `path`.
    pub async fn open(path: &Path) -> Result<Self, CatalogError> {
        let conn = Connection::open(path).await?;
        let catalog = Self { conn };
        catalog.setup_database().await?;
        Ok(catalog)
    }

    pub async fn open_in_memory() -> Result<Self, CatalogError> {
        let conn = Connection::open_in_memory().await?;
        let catalog = Self { conn };
        catalog.setup_database().await?;
        Ok(catalog)
    }

    async fn setup_database(&self) -> Result<(), CatalogError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS chunks (
                        remote_id       TEXT PRIMARY KEY,
                        group_id        TEXT,
                        chunk_index     INTEGER NOT NULL,
                        entry_data      TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS chunks_by_group ON chunks (group_id, chunk_index);",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Inserts or replaces the entry for `entry.remote_id`.
    pub async fn record(&self, entry: &CatalogEntry) -> Result<(), CatalogError> {
        let entry_data = serde_json::to_string(entry)?;
        let remote_id = entry.remote_id.to_string();
        let group_id = entry.group_id.map(|g| g.to_string());
        let index = entry.index;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO chunks (remote_id, group_id, chunk_index, entry_data)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![remote_id, group_id, index, entry_data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get(&self, remote_id: &RemoteId) -> Result<Option<CatalogEntry>, CatalogError> {
        let remote_id = remote_id.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT entry_data FROM chunks WHERE remote_id = ?1",
                        params![remote_id],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;
        row.map(|data| serde_json::from_str(&data))
            .transpose()
            .map_err(CatalogError::from)
    }

    /// Entries of one group in index order.
    pub async fn list_group(&self, group_id: &GroupId) -> Result<Vec<CatalogEntry>, CatalogError> {
        let group_id = group_id.to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT entry_data FROM chunks WHERE group_id = ?1 ORDER BY chunk_index",
                )?;
                let rows = stmt
                    .query_map(params![group_id], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<String>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await?;
        decode_rows(rows)
    }

    /// Every entry, whole files included.
    pub async fn list_all(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT entry_data FROM chunks ORDER BY group_id, chunk_index",
                )?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<String>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await?;
        decode_rows(rows)
    }

    /// Sliced entries keyed by group.
    pub async fn list_groups(&self) -> Result<BTreeMap<GroupId, Vec<CatalogEntry>>, CatalogError> {
        let mut groups: BTreeMap<GroupId, Vec<CatalogEntry>> = BTreeMap::new();
        for entry in self.list_all().await? {
            if let Some(group_id) = entry.group_id {
                groups.entry(group_id).or_default().push(entry);
            }
        }
        Ok(groups)
    }

    /// Removes one entry. Returns whether it existed.
    pub async fn remove(&self, remote_id: &RemoteId) -> Result<bool, CatalogError> {
        let remote_id = remote_id.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                let removed = conn.execute("DELETE FROM chunks WHERE remote_id = ?1", params![remote_id])?;
                Ok(removed)
            })
            .await?;
        Ok(removed > 0)
    }

    /// Removes every entry of a group and returns how many went.
    pub async fn delete_group(&self, group_id: &GroupId) -> Result<usize, CatalogError> {
        let group_id = group_id.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                let removed = conn.execute("DELETE FROM chunks WHERE group_id = ?1", params![group_id])?;
                Ok(removed)
            })
            .await?;
        Ok(removed)
    }
}

fn decode_rows(rows: Vec<String>) -> Result<Vec<CatalogEntry>, CatalogError> {
    rows.iter()
        .map(|data| serde_json::from_str(data).map_err(CatalogError::from))
        .collect()
}
