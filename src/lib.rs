//! Core of a needle-based blob store.
//!
//! - [`storage`]: needle and superblock codecs, index files, volumes and
//!   erasure-coded shard addressing.
//! - [`filer`]: turning a file's overlapping chunks into what is visible now,
//!   and reading it.
//! - [`chunk_cache`]: the tiered cache the read path goes through.

pub mod chunk_cache;
pub mod config;
pub mod error;
pub mod filer;
pub mod stats;
pub mod storage;

pub use chunk_cache::{ChunkCache, ChunkFetcher, InMemoryChunkFetcher, TieredChunkCache};
pub use config::{CacheConfig, Config, ConfigError, VolumeConfig};
pub use error::{NeedleField, Result, StorageError};
pub use filer::{ChunkGroup, ChunkReadAt, ChunkView, FileChunk, IntervalList, VisibleInterval};
pub use storage::{FileId, Needle, SuperBlock, Volume};
