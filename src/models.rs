// src/models.rs

use std::fmt;
use std::ops::Range;
use std::path::Path;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TransferError};

/// Fallback mime type when nothing better can be guessed from the name.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Identifier of one upload or download unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier shared by every chunk sliced from the same source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(Uuid);

impl GroupId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for GroupId {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| TransferError::Validation(format!("invalid group id '{s}': {e}")))
    }
}

/// Opaque identifier the storage backend hands out for a stored unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(String);

impl RemoteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RemoteId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for RemoteId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A file handed to the engine for upload. The content is never mutated once
/// slicing has started; chunks borrow ranges of it.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: String,
    pub mime_type: String,
    pub content: Bytes,
}

impl SourceFile {
    /// Builds a source file, guessing the mime type from the name.
    pub fn new(name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        let name = name.into();
        let mime_type = guess_mime_type(&name);
        Self {
            name,
            mime_type,
            content: content.into(),
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    /// Reads a file from disk into memory.
    pub async fn load(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                TransferError::Validation(format!("'{}' has no file name", path.display()))
            })?;
        let content = tokio::fs::read(path).await?;
        Ok(Self::new(name, content))
    }

    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }
}

/// Guesses a mime type from a file name.
pub fn guess_mime_type(name: &str) -> String {
    mime_guess::from_path(name)
        .first_raw()
        .unwrap_or(OCTET_STREAM)
        .to_string()
}

/// One unit produced by the slicer.
///
/// A file small enough to go up in one piece is a single chunk with no
/// group id, index 1 of 1 and its original name.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub group_id: Option<GroupId>,
    /// 1-based position inside the group.
    pub index: u32,
    pub total: u32,
    /// Byte range `[start, end)` of the source file.
    pub range: Range<u64>,
    pub name: String,
    pub content: Bytes,
}

impl Chunk {
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_direct(&self) -> bool {
        self.group_id.is_none()
    }
}

/// A stored chunk as the storage backend describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub remote_id: RemoteId,
    pub name: String,
    pub index: u32,
    pub total: u32,
    /// Byte length, when the backend knows it.
    pub size: Option<u64>,
}

/// Which way a task moves bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

/// Lifecycle of a transfer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Active,
    Completed,
    Error,
    Aborted,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Aborted)
    }

    /// Pending may start, fail or be cancelled; active may only finish.
    /// Nothing leaves a terminal state.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Active | Self::Error | Self::Aborted),
            Self::Active => next.is_terminal(),
            Self::Completed | Self::Error | Self::Aborted => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Aborted => "aborted",
        };
        f.write_str(label)
    }
}

/// Bookkeeping record for one upload or download unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferTask {
    pub id: TaskId,
    pub name: String,
    pub direction: Direction,
    pub total_bytes: u64,
    pub status: TaskStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl TransferTask {
    pub fn new(name: impl Into<String>, direction: Direction, total_bytes: u64) -> Self {
        Self {
            id: TaskId::new(),
            name: name.into(),
            direction,
            total_bytes,
            status: TaskStatus::Pending,
            error_message: None,
            created_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Moves the task to `next`, stamping `ended_at` on terminal states.
    pub fn transition(&mut self, next: TaskStatus, message: Option<String>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(TransferError::Validation(format!(
                "task {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        if next == TaskStatus::Error {
            self.error_message = message;
        }
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.status == TaskStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_path_runs_to_completion() {
        let mut task = TransferTask::new("a.bin", Direction::Upload, 10);
        task.transition(TaskStatus::Active, None).unwrap();
        task.transition(TaskStatus::Completed, None).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.ended_at.is_some());
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [TaskStatus::Completed, TaskStatus::Error, TaskStatus::Aborted] {
            for next in [
                TaskStatus::Pending,
                TaskStatus::Active,
                TaskStatus::Completed,
                TaskStatus::Error,
                TaskStatus::Aborted,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn active_never_returns_to_pending() {
        let mut task = TransferTask::new("a.bin", Direction::Download, 10);
        task.transition(TaskStatus::Active, None).unwrap();
        let err = task.transition(TaskStatus::Pending, None).unwrap_err();
        assert!(matches!(err, TransferError::Validation(_)));
        assert_eq!(task.status, TaskStatus::Active);
    }

    #[test]
    fn error_keeps_message() {
        let mut task = TransferTask::new("a.bin", Direction::Upload, 10);
        task.transition(TaskStatus::Active, None).unwrap();
        task.transition(TaskStatus::Error, Some("boom".into())).unwrap();
        assert_eq!(task.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn mime_type_is_guessed_from_name() {
        assert_eq!(SourceFile::new("notes.txt", "hi").mime_type, "text/plain");
        assert_eq!(SourceFile::new("blob", "hi").mime_type, OCTET_STREAM);
    }

    #[test]
    fn group_id_parses_its_display_form() {
        let id = GroupId::new();
        assert_eq!(id.to_string().parse::<GroupId>().unwrap(), id);
        assert!("not-a-uuid".parse::<GroupId>().is_err());
    }
}
