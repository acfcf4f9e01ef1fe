//! Configuration for roadmap-storage

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::StorageError;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("roadmap-storage")
}

/// Largest step cap accepted; keeps `order + displacement` inside i32
pub const MAX_STEPS_CEILING: u32 = (i32::MAX / 4) as u32;

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the SQLite database and config file
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Database file name inside `storage_dir`
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// Maximum pooled connections
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// SQLite busy timeout in milliseconds
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u32,

    /// Upper bound on steps per career. Also drives the displacement
    /// constant used when renumbering.
    #[serde(default = "default_max_steps")]
    pub max_steps_per_career: u32,

    /// Maximum items in a single resource list (courses, playlists, books)
    #[serde(default = "default_max_resources")]
    pub max_resources_per_list: usize,

    /// Retries for progress writes that lose an optimistic version check
    #[serde(default = "default_refresh_retries")]
    pub progress_refresh_retries: u32,
}

fn default_database_file() -> String {
    "roadmap.db".to_string()
}

fn default_pool_size() -> u32 {
    8
}

fn default_busy_timeout_ms() -> u32 {
    5000
}

fn default_max_steps() -> u32 {
    1000
}

fn default_max_resources() -> usize {
    5
}

fn default_refresh_retries() -> u32 {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            database_file: default_database_file(),
            pool_size: default_pool_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
            max_steps_per_career: default_max_steps(),
            max_resources_per_list: default_max_resources(),
            progress_refresh_retries: default_refresh_retries(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| StorageError::Config(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), StorageError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| StorageError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the engine cannot honour
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.max_steps_per_career == 0 || self.max_steps_per_career > MAX_STEPS_CEILING {
            return Err(StorageError::Config(format!(
                "max_steps_per_career must be in 1..={}",
                MAX_STEPS_CEILING
            )));
        }
        if self.max_resources_per_list == 0 {
            return Err(StorageError::Config(
                "max_resources_per_list must be at least 1".into(),
            ));
        }
        if self.pool_size == 0 {
            return Err(StorageError::Config("pool_size must be at least 1".into()));
        }
        Ok(())
    }

    /// Get database file path
    pub fn database_path(&self) -> PathBuf {
        self.storage_dir.join(&self.database_file)
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }
}
