// src/config.rs

//! Engine settings, read from a TOML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransferError};
use crate::limiter::TransferLimiter;
use crate::progress::DEFAULT_TICK;
use crate::slicer::{Slicer, CHUNK_SIZE};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Largest unit uploaded in one piece, in bytes.
    pub chunk_size: u64,
    /// Transfers allowed in flight at once. 0 means unbounded.
    pub max_in_flight: usize,
    /// Progress sampling interval.
    pub tick_interval_ms: u64,
    /// Delete stored chunks of groups whose upload did not fully complete.
    pub cleanup_incomplete_groups: bool,
    /// Directory holding stored chunk files.
    pub store_root: PathBuf,
    /// SQLite catalog of stored chunks.
    pub catalog_path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from(".telecloud");
        Self {
            chunk_size: CHUNK_SIZE,
            max_in_flight: 0,
            tick_interval_ms: DEFAULT_TICK.as_millis() as u64,
            cleanup_incomplete_groups: false,
            store_root: data_dir.join("objects"),
            catalog_path: data_dir.join("catalog.db"),
        }
    }
}

impl EngineConfig {
    /// Reads and validates the configuration at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TransferError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            TransferError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`EngineConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TransferError::Config(format!("failed to create config directory: {e}"))
            })?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| TransferError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, content)
            .map_err(|e| TransferError::Config(format!("failed to write {}: {e}", path.display())))
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(TransferError::Config("chunk_size must be greater than zero".into()));
        }
        if self.tick_interval_ms == 0 {
            return Err(TransferError::Config(
                "tick_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn slicer(&self) -> Result<Slicer> {
        Slicer::new(self.chunk_size)
    }

    pub fn limiter(&self) -> TransferLimiter {
        TransferLimiter::new(self.max_in_flight)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_constants() {
        let config = EngineConfig::default();
        assert_eq!(config.chunk_size, 20 * 1024 * 1024);
        assert_eq!(config.tick_interval(), Duration::from_millis(500));
        assert_eq!(config.limiter().max_in_flight(), None);
        assert!(!config.cleanup_incomplete_groups);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telecloud.toml");
        std::fs::write(&path, "max_in_flight = 4\ncleanup_incomplete_groups = true\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.max_in_flight, 4);
        assert!(config.cleanup_incomplete_groups);
        assert_eq!(config.chunk_size, CHUNK_SIZE);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/telecloud.toml");
        let config = EngineConfig {
            chunk_size: 1024,
            ..EngineConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telecloud.toml");
        std::fs::write(&path, "chunk_size = 0\n").unwrap();
        assert!(matches!(EngineConfig::load(&path), Err(TransferError::Config(_))));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }
}
