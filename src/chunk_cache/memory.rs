use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use crate::chunk_cache::{ChunkCache, copy_chunk_at};
use crate::error::Result;

/// Most recently used chunks, held whole in memory.
///
/// An entry lives until it has gone `time_to_idle` without being read, so
/// every access pushes its expiry forward.
#[derive(Clone)]
pub struct MemoryChunkCache {
    cache: moka::future::Cache<String, Bytes>,
    max_file_part_size: u64,
}

impl MemoryChunkCache {
    pub fn new(max_entries: u64, time_to_idle: Duration, max_file_part_size: u64) -> Self {
        let cache = moka::future::Cache::builder()
            .max_capacity(max_entries)
            .time_to_idle(time_to_idle)
            .build();
        Self {
            cache,
            max_file_part_size,
        }
    }

    pub async fn get_chunk(&self, file_id: &str) -> Option<Bytes> {
        self.cache.get(file_id).await
    }

    /// Stores an already-owned buffer without copying it again.
    pub(crate) async fn insert(&self, file_id: &str, data: Bytes) {
        self.cache.insert(file_id.to_owned(), data).await;
    }

    pub async fn remove(&self, file_id: &str) {
        trace!("Memory cache REMOVE for key: {}", file_id);
        self.cache.invalidate(file_id).await;
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Applies pending evictions. Mostly useful in tests.
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}

#[async_trait]
impl ChunkCache for MemoryChunkCache {
    async fn read_chunk_at(
        &self,
        buf: &mut [u8],
        file_id: &str,
        offset: u64,
    ) -> Result<Option<usize>> {
        let Some(data) = self.cache.get(file_id).await else {
            return Ok(None);
        };
        copy_chunk_at(&data, buf, offset).map(Some)
    }

    async fn set_chunk(&self, file_id: &str, data: &[u8]) {
        trace!("Memory cache SET for key: {}, size: {} bytes", file_id, data.len());
        self.insert(file_id, Bytes::copy_from_slice(data)).await;
    }

    async fn is_in_cache(&self, file_id: &str) -> bool {
        self.cache.contains_key(file_id)
    }

    fn max_file_part_size(&self) -> u64 {
        self.max_file_part_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;

    #[tokio::test]
    async fn test_set_and_read() {
        let cache = MemoryChunkCache::new(8, Duration::from_secs(60), 1024);
        let mut data = b"hello world".to_vec();
        cache.set_chunk("1,01", &data).await;

        // the cache keeps its own copy
        data[0] = b'j';

        let mut buf = [0u8; 5];
        assert_eq!(cache.read_chunk_at(&mut buf, "1,01", 6).await.unwrap(), Some(5));
        assert_eq!(&buf, b"world");

        let mut whole = vec![0u8; 32];
        let n = cache.read_chunk_at(&mut whole, "1,01", 0).await.unwrap().unwrap();
        assert_eq!(&whole[..n], b"hello world");

        assert!(cache.is_in_cache("1,01").await);
        assert_eq!(cache.read_chunk_at(&mut buf, "1,02", 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_past_end_is_out_of_bounds() {
        let cache = MemoryChunkCache::new(8, Duration::from_secs(60), 1024);
        cache.set_chunk("1,01", b"abc").await;
        let mut buf = [0u8; 4];
        for offset in [3u64, 10] {
            let err = cache.read_chunk_at(&mut buf, "1,01", offset).await.unwrap_err();
            assert!(matches!(err, StorageError::OutOfBounds { len: 3, .. }));
        }
    }

    #[tokio::test]
    async fn test_idle_entries_expire() {
        let cache = MemoryChunkCache::new(8, Duration::from_millis(50), 1024);
        cache.set_chunk("a", b"1").await;
        cache.set_chunk("b", b"2").await;
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            // reading keeps "a" alive
            assert!(cache.get_chunk("a").await.is_some());
        }
        assert!(cache.get_chunk("b").await.is_none());
        assert!(cache.get_chunk("a").await.is_some());
    }

    #[tokio::test]
    async fn test_remove() {
        let cache = MemoryChunkCache::new(8, Duration::from_secs(60), 1024);
        cache.set_chunk("a", b"1").await;
        cache.remove("a").await;
        assert!(!cache.is_in_cache("a").await);
    }
}
