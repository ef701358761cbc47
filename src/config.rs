//! Configuration for the chunk cache and for newly created volumes.
//!
//! Loaded from YAML. Every field has a default, so an empty document is a
//! valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::storage::erasure_coding::{
    ERASURE_CODING_LARGE_BLOCK_SIZE, ERASURE_CODING_SMALL_BLOCK_SIZE,
};
use crate::storage::super_block::{ReplicaPlacement, SuperBlock};
use crate::storage::ttl::Ttl;
use crate::storage::types::{CURRENT_VERSION, Version};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub volume: VolumeConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(ConfigError::IoError)?;
        content.parse()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate().map_err(ConfigError::Invalid)?;
        self.volume.validate().map_err(ConfigError::Invalid)
    }
}

impl std::str::FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config =
            serde_yaml::from_str(s).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Chunk cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of chunks held in memory
    #[serde(default = "default_memory_max_entries")]
    pub memory_max_entries: u64,

    /// A memory entry expires after this long without being read (in seconds)
    #[serde(default = "default_memory_time_to_idle", with = "duration_serde")]
    pub memory_time_to_idle: Duration,

    /// Chunks larger than this are never kept in memory
    #[serde(default = "default_max_file_part_size")]
    pub max_file_part_size: u64,

    /// Whether the on-disk tiers are used at all
    #[serde(default = "default_enable_disk")]
    pub enable_disk: bool,

    /// Root of the on-disk tiers. If None, uses `dirs::cache_dir()`
    #[serde(default)]
    pub disk_dir: Option<PathBuf>,

    /// Total on-disk budget across all tiers, in MiB
    #[serde(default = "default_disk_size_mb")]
    pub disk_size_mb: u64,

    /// Largest chunk stored in disk tier 0. Tier 1 takes up to 4x this,
    /// tier 2 up to 8x.
    #[serde(default = "default_unit_size")]
    pub unit_size: u64,
}

fn default_memory_max_entries() -> u64 {
    256
}

fn default_memory_time_to_idle() -> Duration {
    Duration::from_secs(3600)
}

fn default_max_file_part_size() -> u64 {
    8 * 1024 * 1024
}

fn default_enable_disk() -> bool {
    true
}

fn default_disk_size_mb() -> u64 {
    1024
}

fn default_unit_size() -> u64 {
    2 * 1024 * 1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_max_entries: default_memory_max_entries(),
            memory_time_to_idle: default_memory_time_to_idle(),
            max_file_part_size: default_max_file_part_size(),
            enable_disk: default_enable_disk(),
            disk_dir: None,
            disk_size_mb: default_disk_size_mb(),
            unit_size: default_unit_size(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.memory_max_entries == 0 {
            return Err("memory_max_entries must be > 0".into());
        }
        if self.memory_time_to_idle.is_zero() {
            return Err("memory_time_to_idle must be > 0".into());
        }
        if self.enable_disk {
            if self.disk_size_mb == 0 {
                return Err("disk_size_mb must be > 0 when the disk cache is enabled".into());
            }
            if self.unit_size == 0 {
                return Err("unit_size must be > 0".into());
            }
        }
        Ok(())
    }

    /// Directory the disk tiers live in.
    pub fn resolved_disk_dir(&self) -> PathBuf {
        self.disk_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("needlestore")
                .join("chunks")
        })
    }
}

/// Defaults applied to volumes created by this process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Needle format version, 1 to 3
    #[serde(default = "default_needle_version")]
    pub needle_version: u8,

    /// Replica placement, e.g. "001"
    #[serde(default = "default_replication")]
    pub replication: String,

    /// Time to live, e.g. "3d". Empty means forever.
    #[serde(default)]
    pub ttl: String,

    #[serde(default = "default_large_block_size")]
    pub large_block_size: i64,

    #[serde(default = "default_small_block_size")]
    pub small_block_size: i64,
}

fn default_needle_version() -> u8 {
    CURRENT_VERSION.as_u8()
}

fn default_replication() -> String {
    "000".to_string()
}

fn default_large_block_size() -> i64 {
    ERASURE_CODING_LARGE_BLOCK_SIZE
}

fn default_small_block_size() -> i64 {
    ERASURE_CODING_SMALL_BLOCK_SIZE
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            needle_version: default_needle_version(),
            replication: default_replication(),
            ttl: String::new(),
            large_block_size: default_large_block_size(),
            small_block_size: default_small_block_size(),
        }
    }
}

impl VolumeConfig {
    pub fn validate(&self) -> Result<(), String> {
        Version::try_from(self.needle_version).map_err(|e| e.to_string())?;
        self.replication
            .parse::<ReplicaPlacement>()
            .map_err(|e| e.to_string())?;
        Ttl::parse(&self.ttl).map_err(|e| e.to_string())?;
        if self.small_block_size <= 0 || self.large_block_size < self.small_block_size {
            return Err(format!(
                "block sizes must satisfy 0 < small ({}) <= large ({})",
                self.small_block_size, self.large_block_size
            ));
        }
        Ok(())
    }

    /// Superblock for a new volume built from these settings.
    pub fn super_block(&self) -> crate::error::Result<SuperBlock> {
        Ok(SuperBlock::new(
            Version::try_from(self.needle_version)?,
            self.replication.parse()?,
            Ttl::parse(&self.ttl)?,
        ))
    }
}

/// Custom serde module for Duration (supports seconds as float/int)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(value).map_err(serde::de::Error::custom)
    }
}
