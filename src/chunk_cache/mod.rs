//! Chunk cache used by the read path: a memory tier in front of three on-disk
//! tiers, plus fetch coalescing for chunks that are in none of them.
//!
//! Small chunks go to disk tier 0, larger ones to tiers 1 and 2. Disk hits
//! are promoted back into memory when they are small enough.

mod disk;
mod memory;
pub mod singleflight;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub use disk::DiskCacheLayer;
pub use memory::MemoryChunkCache;
pub use singleflight::SingleFlight;

use crate::config::CacheConfig;
use crate::error::{Result, StorageError};
use crate::stats;

/// Anything that can hold chunk contents for the read path.
#[async_trait]
pub trait ChunkCache: Send + Sync {
    /// Copies from `offset` of the cached chunk into `buf`. `Ok(None)` means
    /// the chunk is not cached; an offset at or past its end is `OutOfBounds`.
    async fn read_chunk_at(
        &self,
        buf: &mut [u8],
        file_id: &str,
        offset: u64,
    ) -> Result<Option<usize>>;

    /// Stores a copy of `data`.
    async fn set_chunk(&self, file_id: &str, data: &[u8]);

    async fn is_in_cache(&self, file_id: &str) -> bool;

    /// Largest chunk this cache keeps.
    fn max_file_part_size(&self) -> u64;
}

/// Downloads chunk contents by file id. Implemented outside the cache, e.g.
/// against volume servers.
#[async_trait]
pub trait ChunkFetcher: Send + Sync {
    async fn fetch_chunk(&self, file_id: &str) -> anyhow::Result<Vec<u8>>;
}

pub(crate) fn copy_chunk_at(data: &[u8], buf: &mut [u8], offset: u64) -> Result<usize> {
    let len = data.len() as u64;
    if offset >= len {
        return Err(StorageError::OutOfBounds { offset, len });
    }
    let start = offset as usize;
    let n = buf.len().min(data.len() - start);
    buf[..n].copy_from_slice(&data[start..start + n]);
    Ok(n)
}

/// Fixed set of chunks kept in memory. Counts every fetch, and can be slowed
/// down to widen race windows in tests.
#[derive(Default)]
pub struct InMemoryChunkFetcher {
    chunks: RwLock<HashMap<String, Vec<u8>>>,
    latency: Duration,
    fetches: AtomicUsize,
}

impl InMemoryChunkFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn insert(&self, file_id: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.chunks.write().insert(file_id.into(), data.into());
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChunkFetcher for InMemoryChunkFetcher {
    async fn fetch_chunk(&self, file_id: &str) -> anyhow::Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.chunks
            .read()
            .get(file_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("chunk {file_id} not found"))
    }
}

#[derive(Clone)]
pub struct TieredChunkCache {
    mem_cache: MemoryChunkCache,
    disk_caches: Vec<DiskCacheLayer>,

    /// Largest chunk stored in disk tier 0
    disk_size_limit0: u64,
    /// Largest chunk stored in disk tier 1; anything bigger goes to tier 2
    disk_size_limit1: u64,

    /// Chunks currently being fetched, keyed by file id
    in_flight: Arc<SingleFlight<String, Bytes>>,
}

impl TieredChunkCache {
    pub async fn new(config: &CacheConfig) -> Result<Self> {
        info!(
            "Creating TieredChunkCache: memory_entries={}, disk={}, disk_mb={}, unit={}",
            config.memory_max_entries, config.enable_disk, config.disk_size_mb, config.unit_size
        );
        let mem_cache = MemoryChunkCache::new(
            config.memory_max_entries,
            config.memory_time_to_idle,
            config.max_file_part_size,
        );

        let disk_size_limit0 = config.unit_size;
        let disk_size_limit1 = 4 * disk_size_limit0;

        let mut disk_caches = Vec::new();
        if config.enable_disk {
            let dir = config.resolved_disk_dir();
            debug!("Using cache directory: {:?}", dir);
            let total = config.disk_size_mb * 1024 * 1024;
            let tiers = [
                ("c0", total / 8, disk_size_limit0),
                ("c1", total * 3 / 8, disk_size_limit1),
                ("c2", total / 2, u64::MAX),
            ];
            for (name, budget, part_limit) in tiers {
                let layer = DiskCacheLayer::new(dir.join(name), budget).await?;
                disk_caches.push(layer.with_max_file_part_size(part_limit));
            }
        }

        Ok(Self {
            mem_cache,
            disk_caches,
            disk_size_limit0,
            disk_size_limit1,
            in_flight: Arc::new(SingleFlight::new()),
        })
    }

    /// Memory-only cache, for callers without a cache directory.
    pub fn in_memory(max_entries: u64, time_to_idle: Duration, max_file_part_size: u64) -> Self {
        Self {
            mem_cache: MemoryChunkCache::new(max_entries, time_to_idle, max_file_part_size),
            disk_caches: Vec::new(),
            disk_size_limit0: 0,
            disk_size_limit1: 0,
            in_flight: Arc::new(SingleFlight::new()),
        }
    }

    pub fn memory(&self) -> &MemoryChunkCache {
        &self.mem_cache
    }

    fn disk_tier_for(&self, len: u64) -> Option<&DiskCacheLayer> {
        let tier = if len <= self.disk_size_limit0 {
            0
        } else if len <= self.disk_size_limit1 {
            1
        } else {
            2
        };
        self.disk_caches.get(tier)
    }

    /// Whole chunk from the first tier that has it.
    pub async fn get_chunk(&self, file_id: &str) -> Option<Bytes> {
        if let Some(data) = self.mem_cache.get_chunk(file_id).await {
            trace!("Memory cache HIT for key: {}", file_id);
            stats::record_cache_hit();
            return Some(data);
        }
        for layer in &self.disk_caches {
            if let Some(data) = layer.load(file_id).await {
                debug!("Disk cache HIT for key: {}, size: {} bytes", file_id, data.len());
                stats::record_cache_hit();
                if data.len() as u64 <= self.mem_cache.max_file_part_size() {
                    self.mem_cache.insert(file_id, data.clone()).await;
                }
                return Some(data);
            }
        }
        trace!("Cache MISS for key: {}", file_id);
        stats::record_cache_miss();
        None
    }

    async fn store(&self, file_id: &str, data: Bytes) {
        let len = data.len() as u64;
        if len <= self.mem_cache.max_file_part_size() {
            self.mem_cache.insert(file_id, data.clone()).await;
        }
        if let Some(layer) = self.disk_tier_for(len)
            && let Err(e) = layer.store(file_id, &data).await
        {
            warn!("Failed to store chunk {} on disk: {}", file_id, e);
        }
    }

    /// Drops a chunk from the memory tier only. Used when a sequential reader
    /// has moved past it.
    pub async fn uncache_memory(&self, file_id: &str) {
        self.mem_cache.remove(file_id).await;
    }

    /// Returns the chunk from cache, or fetches it with `fetcher` and caches
    /// it. Concurrent misses for one file id share a single fetch.
    ///
    /// Cancelling `cancel` abandons this caller's wait; if it was the one
    /// fetching, a waiting caller takes over.
    pub async fn get_or_fetch(
        &self,
        file_id: &str,
        fetcher: &dyn ChunkFetcher,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        if let Some(data) = self.get_chunk(file_id).await {
            return Ok(data);
        }

        let fetch = self.in_flight.execute(file_id.to_owned(), || async move {
            // another fetch may have finished between our miss and now
            if let Some(data) = self.get_chunk(file_id).await {
                return Ok(data);
            }
            stats::record_fetch();
            debug!("Fetching chunk {}", file_id);
            let data = fetcher
                .fetch_chunk(file_id)
                .await
                .map_err(|e| StorageError::Fetch(Arc::new(e)))?;
            let data = Bytes::from(data);
            self.store(file_id, data.clone()).await;
            Ok(data)
        });

        tokio::select! {
            result = fetch => result,
            _ = cancel.cancelled() => {
                debug!("Fetch of chunk {} cancelled", file_id);
                Err(StorageError::Cancelled)
            }
        }
    }

    /// Number of chunk fetches currently running.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.in_flight_count()
    }
}

#[async_trait]
impl ChunkCache for TieredChunkCache {
    async fn read_chunk_at(
        &self,
        buf: &mut [u8],
        file_id: &str,
        offset: u64,
    ) -> Result<Option<usize>> {
        match self.get_chunk(file_id).await {
            Some(data) => copy_chunk_at(&data, buf, offset).map(Some),
            None => Ok(None),
        }
    }

    async fn set_chunk(&self, file_id: &str, data: &[u8]) {
        self.store(file_id, Bytes::copy_from_slice(data)).await;
    }

    async fn is_in_cache(&self, file_id: &str) -> bool {
        if self.mem_cache.is_in_cache(file_id).await {
            return true;
        }
        for layer in &self.disk_caches {
            if layer.is_in_cache(file_id).await {
                return true;
            }
        }
        false
    }

    fn max_file_part_size(&self) -> u64 {
        self.mem_cache.max_file_part_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn disk_config(dir: &std::path::Path) -> CacheConfig {
        CacheConfig {
            memory_max_entries: 16,
            memory_time_to_idle: Duration::from_secs(60),
            max_file_part_size: 64,
            enable_disk: true,
            disk_dir: Some(dir.to_path_buf()),
            disk_size_mb: 1,
            unit_size: 16,
        }
    }

    #[tokio::test]
    async fn test_set_then_read_returns_copy() {
        let cache = TieredChunkCache::in_memory(16, Duration::from_secs(60), 1024);
        let mut data = vec![7u8; 100];
        cache.set_chunk("1,01", &data).await;
        data.fill(0);

        let mut buf = vec![0u8; 100];
        let n = cache.read_chunk_at(&mut buf, "1,01", 0).await.unwrap().unwrap();
        assert_eq!(n, 100);
        assert!(buf.iter().all(|b| *b == 7));

        let err = cache.read_chunk_at(&mut buf, "1,01", 100).await.unwrap_err();
        assert!(matches!(err, StorageError::OutOfBounds { offset: 100, len: 100 }));
        assert_eq!(cache.read_chunk_at(&mut buf, "1,99", 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_chunks_routed_to_tiers_by_size() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TieredChunkCache::new(&disk_config(dir.path())).await.unwrap();

        cache.set_chunk("small", &[1u8; 10]).await;
        cache.set_chunk("medium", &[2u8; 40]).await;
        cache.set_chunk("large", &[3u8; 200]).await;

        assert!(cache.disk_caches[0].is_in_cache("small").await);
        assert!(cache.disk_caches[1].is_in_cache("medium").await);
        assert!(cache.disk_caches[2].is_in_cache("large").await);
        let limits: Vec<u64> = cache.disk_caches.iter().map(|c| c.max_file_part_size()).collect();
        assert_eq!(limits, [16, 64, 512 * 1024]);

        // too big for memory, still served from disk
        assert!(!cache.memory().is_in_cache("large").await);
        assert!(cache.is_in_cache("large").await);
        let mut buf = [0u8; 8];
        assert_eq!(cache.read_chunk_at(&mut buf, "large", 192).await.unwrap(), Some(8));
        assert_eq!(buf, [3u8; 8]);
    }

    #[tokio::test]
    async fn test_disk_hit_promoted_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TieredChunkCache::new(&disk_config(dir.path())).await.unwrap();
        cache.set_chunk("k", b"0123456789").await;
        cache.uncache_memory("k").await;
        assert!(!cache.memory().is_in_cache("k").await);

        assert_eq!(cache.get_chunk("k").await.unwrap().as_ref(), b"0123456789");
        assert!(cache.memory().is_in_cache("k").await);
    }

    #[tokio::test]
    async fn test_concurrent_misses_fetch_once() {
        let cache = TieredChunkCache::in_memory(16, Duration::from_secs(60), 1 << 20);
        let fetcher = Arc::new(InMemoryChunkFetcher::with_latency(Duration::from_millis(50)));
        fetcher.insert("5,0a01", vec![9u8; 4096]);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let fetcher = fetcher.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("5,0a01", fetcher.as_ref(), &CancellationToken::new())
                    .await
            }));
        }
        for r in futures::future::join_all(handles).await {
            assert_eq!(r.unwrap().unwrap().len(), 4096);
        }
        assert_eq!(fetcher.fetch_count(), 1);
        assert_eq!(cache.in_flight_count(), 0);

        // now cached
        cache
            .get_or_fetch("5,0a01", fetcher.as_ref(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(fetcher.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_fetch_error_reaches_every_waiter() {
        let cache = TieredChunkCache::in_memory(16, Duration::from_secs(60), 1 << 20);
        let fetcher = Arc::new(InMemoryChunkFetcher::with_latency(Duration::from_millis(30)));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let fetcher = fetcher.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("missing", fetcher.as_ref(), &CancellationToken::new())
                    .await
            }));
        }
        for r in futures::future::join_all(handles).await {
            assert!(matches!(r.unwrap(), Err(StorageError::Fetch(_))));
        }
        assert_eq!(fetcher.fetch_count(), 1);
        assert_eq!(cache.in_flight_count(), 0);
        assert!(!cache.is_in_cache("missing").await);
    }

    /// Blocks until released, so a fetch can be cancelled mid-flight.
    struct GatedFetcher {
        open: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChunkFetcher for GatedFetcher {
        async fn fetch_chunk(&self, file_id: &str) -> anyhow::Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            while !self.open.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(file_id.as_bytes().to_vec())
        }
    }

    #[tokio::test]
    async fn test_cancelled_fetch_is_cleaned_up() {
        let cache = TieredChunkCache::in_memory(16, Duration::from_secs(60), 1 << 20);
        let fetcher = Arc::new(GatedFetcher {
            open: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        });

        let cancel = CancellationToken::new();
        let leader = {
            let cache = cache.clone();
            let fetcher = fetcher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { cache.get_or_fetch("k", fetcher.as_ref(), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.in_flight_count(), 1);

        cancel.cancel();
        assert!(matches!(leader.await.unwrap(), Err(StorageError::Cancelled)));
        assert_eq!(cache.in_flight_count(), 0);

        // a later caller is not stuck behind the abandoned fetch
        fetcher.open.store(true, Ordering::SeqCst);
        let data = cache
            .get_or_fetch("k", fetcher.as_ref(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(data.as_ref(), b"k");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }
}
