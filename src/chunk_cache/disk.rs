use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use moka::notification::{ListenerFuture, RemovalCause};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, trace, warn};

use crate::chunk_cache::{ChunkCache, copy_chunk_at};
use crate::error::Result;

/// One on-disk tier: a directory with one file per chunk and an in-memory
/// index weighted by chunk size.
///
/// When the index evicts a chunk to stay within `capacity_bytes`, its file is
/// deleted. Overwriting a chunk keeps the (rewritten) file. Chunks larger than
/// `max_file_part_size` are not accepted through [`ChunkCache::set_chunk`].
#[derive(Debug, Clone)]
pub struct DiskCacheLayer {
    base_dir: PathBuf,
    index: moka::future::Cache<String, u64>,
    capacity_bytes: u64,
    max_file_part_size: u64,
}

impl DiskCacheLayer {
    /// Opens the tier at `base_dir`. Files left over from an earlier process
    /// cannot be mapped back to their keys and are removed.
    pub async fn new<P: AsRef<Path>>(base_dir: P, capacity_bytes: u64) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        debug!("Initializing disk cache layer at: {:?}", base_dir);

        if base_dir.exists() {
            let mut entries = fs::read_dir(&base_dir).await?;
            let mut stale = 0usize;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_file() {
                    fs::remove_file(entry.path()).await?;
                    stale += 1;
                }
            }
            if stale > 0 {
                info!("Removed {} stale chunk files from {:?}", stale, base_dir);
            }
        } else {
            info!("Creating cache directory: {:?}", base_dir);
            fs::create_dir_all(&base_dir).await?;
        }

        let evict_dir = base_dir.clone();
        let index = moka::future::Cache::builder()
            .weigher(|_: &String, size: &u64| (*size).min(u32::MAX as u64) as u32)
            .max_capacity(capacity_bytes)
            .async_eviction_listener(
                move |key: Arc<String>, _size: u64, cause: RemovalCause| -> ListenerFuture {
                    let path = evict_dir.join(Self::key_to_filename(&key));
                    Box::pin(async move {
                        if cause == RemovalCause::Replaced {
                            return;
                        }
                        if let Err(e) = fs::remove_file(&path).await
                            && e.kind() != std::io::ErrorKind::NotFound
                        {
                            warn!("Failed to remove evicted chunk file {:?}: {}", path, e);
                        }
                    })
                },
            )
            .build();

        Ok(Self {
            base_dir,
            index,
            capacity_bytes,
            max_file_part_size: capacity_bytes,
        })
    }

    /// Caps the size of a single chunk this tier accepts.
    pub fn with_max_file_part_size(mut self, max_file_part_size: u64) -> Self {
        self.max_file_part_size = max_file_part_size.min(self.capacity_bytes);
        self
    }

    pub fn key_to_filename(key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base_dir.join(Self::key_to_filename(key))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub async fn store(&self, key: &str, data: &[u8]) -> Result<()> {
        let filepath = self.path_for(key);
        trace!(
            "Storing {} bytes for key '{}' to file: {:?}",
            data.len(),
            key,
            filepath
        );
        fs::write(&filepath, data).await?;
        self.index.insert(key.to_owned(), data.len() as u64).await;
        Ok(())
    }

    /// Whole chunk, if this tier has it.
    pub async fn load(&self, key: &str) -> Option<Bytes> {
        self.index.get(key).await?;
        let filepath = self.path_for(key);
        match fs::read(&filepath).await {
            Ok(data) => {
                trace!("Loaded {} bytes for key '{}'", data.len(), key);
                Some(Bytes::from(data))
            }
            Err(e) => {
                warn!("Chunk file for key '{}' unreadable, dropping it: {}", key, e);
                self.index.invalidate(key).await;
                None
            }
        }
    }

    pub async fn remove(&self, key: &str) {
        self.index.invalidate(key).await;
    }

    /// Bytes currently accounted to this tier.
    pub async fn used_bytes(&self) -> u64 {
        self.index.run_pending_tasks().await;
        self.index.weighted_size()
    }
}

#[async_trait]
impl ChunkCache for DiskCacheLayer {
    async fn read_chunk_at(
        &self,
        buf: &mut [u8],
        file_id: &str,
        offset: u64,
    ) -> Result<Option<usize>> {
        let Some(data) = self.load(file_id).await else {
            return Ok(None);
        };
        copy_chunk_at(&data, buf, offset).map(Some)
    }

    async fn set_chunk(&self, file_id: &str, data: &[u8]) {
        if data.len() as u64 > self.max_file_part_size {
            trace!(
                "Chunk {} of {} bytes exceeds disk tier limit {}",
                file_id,
                data.len(),
                self.max_file_part_size
            );
            return;
        }
        if let Err(e) = self.store(file_id, data).await {
            warn!("Failed to store chunk {} on disk: {}", file_id, e);
        }
    }

    async fn is_in_cache(&self, file_id: &str) -> bool {
        self.index.contains_key(file_id)
    }

    fn max_file_part_size(&self) -> u64 {
        self.max_file_part_size
    }
}
