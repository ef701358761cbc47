use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::chunk_cache::{ChunkFetcher, TieredChunkCache};
use crate::error::Result;
use crate::filer::filechunks::ChunkView;
use crate::filer::interval_list::IntervalList;

/// How many consecutive reads it takes to switch between sequential and
/// random mode.
const MODE_CHANGE_LIMIT: i64 = 3;

/// Guesses whether a file is being read sequentially.
#[derive(Debug, Default)]
pub struct ReaderPattern {
    is_sequential_counter: AtomicI64,
    last_read_stop_offset: AtomicI64,
}

impl ReaderPattern {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn monitor_read_at(&self, offset: i64, size: usize) {
        let last = self
            .last_read_stop_offset
            .swap(offset + size as i64, Ordering::SeqCst);
        let step = if last == offset { 1 } else { -1 };
        let _ = self
            .is_sequential_counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                let next = c + step;
                (-MODE_CHANGE_LIMIT..=MODE_CHANGE_LIMIT)
                    .contains(&next)
                    .then_some(next)
            });
    }

    pub fn is_random_mode(&self) -> bool {
        self.is_sequential_counter.load(Ordering::SeqCst) < 0
    }
}

/// Reads a logical file assembled from chunk views, fetching chunks through
/// the cache and zero-filling ranges no chunk covers.
pub struct ChunkReadAt {
    chunk_views: Arc<IntervalList<ChunkView>>,
    file_size: AtomicI64,
    cache: TieredChunkCache,
    fetcher: Arc<dyn ChunkFetcher>,
    reader_pattern: ReaderPattern,
    last_chunk_fid: Mutex<Option<String>>,
}

impl ChunkReadAt {
    pub fn new(
        chunk_views: Arc<IntervalList<ChunkView>>,
        file_size: i64,
        cache: TieredChunkCache,
        fetcher: Arc<dyn ChunkFetcher>,
    ) -> Self {
        Self {
            chunk_views,
            file_size: AtomicI64::new(file_size),
            cache,
            fetcher,
            reader_pattern: ReaderPattern::new(),
            last_chunk_fid: Mutex::new(None),
        }
    }

    pub fn file_size(&self) -> i64 {
        self.file_size.load(Ordering::SeqCst)
    }

    pub fn set_file_size(&self, file_size: i64) {
        self.file_size.store(file_size, Ordering::SeqCst);
    }

    pub fn reader_pattern(&self) -> &ReaderPattern {
        &self.reader_pattern
    }

    /// Fills `buf` from `offset`. Returns fewer bytes than `buf.len()` only
    /// when the read runs past the end of the file.
    pub async fn read_at(
        &self,
        buf: &mut [u8],
        offset: i64,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        Ok(self.read_at_with_time(buf, offset, cancel).await?.0)
    }

    /// Like [`Self::read_at`], also returning the newest modification time of
    /// the chunks read.
    pub async fn read_at_with_time(
        &self,
        buf: &mut [u8],
        offset: i64,
        cancel: &CancellationToken,
    ) -> Result<(usize, i64)> {
        self.reader_pattern.monitor_read_at(offset, buf.len());

        let file_size = self.file_size();
        let mut n = 0usize;
        let mut ts_ns = 0i64;
        let mut start_offset = offset;
        let mut remaining = buf.len() as i64;

        let views = self.chunk_views.intervals();
        for (i, iv) in views.iter().enumerate() {
            if remaining <= 0 {
                break;
            }
            let chunk = &iv.value;
            if start_offset < chunk.view_offset {
                let gap = (chunk.view_offset - start_offset).min(remaining);
                let at = (start_offset - offset) as usize;
                buf[at..at + gap as usize].fill(0);
                n += gap as usize;
                start_offset += gap;
                remaining -= gap;
                if remaining <= 0 {
                    break;
                }
            }

            let chunk_start = chunk.view_offset.max(start_offset);
            let chunk_stop = chunk.view_stop().min(start_offset + remaining);
            if chunk_start >= chunk_stop {
                continue;
            }

            let buffer_offset = chunk_start - chunk.view_offset + chunk.offset_in_chunk;
            let at = (start_offset - offset) as usize;
            let len = (chunk_stop - chunk_start) as usize;
            let next = views.get(i + 1).map(|v| &v.value);
            let dest = &mut buf[at..at + len];
            self.read_chunk_slice_at(dest, chunk, next, buffer_offset as u64, cancel)
                .await?;

            n += len;
            ts_ns = ts_ns.max(chunk.modified_ts_ns);
            start_offset += len as i64;
            remaining -= len as i64;
        }

        if remaining > 0 {
            let delta = remaining.min(file_size - start_offset).max(0);
            let at = (start_offset - offset) as usize;
            buf[at..at + delta as usize].fill(0);
            n += delta as usize;
        }

        trace!("read {} bytes at {} of {}", n, offset, file_size);
        Ok((n, ts_ns))
    }

    async fn read_chunk_slice_at(
        &self,
        buf: &mut [u8],
        chunk: &ChunkView,
        next: Option<&ChunkView>,
        offset: u64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let data = self
            .cache
            .get_or_fetch(&chunk.file_id, self.fetcher.as_ref(), cancel)
            .await?;

        if !self.reader_pattern.is_random_mode() {
            let previous = {
                let mut last = self.last_chunk_fid.lock();
                if last.as_deref() == Some(chunk.file_id.as_str()) {
                    None
                } else {
                    last.replace(chunk.file_id.clone())
                }
            };
            if let Some(previous) = previous {
                trace!("sequential read moved past {}, uncaching it", previous);
                self.cache.uncache_memory(&previous).await;
            }
            if offset == chunk.offset_in_chunk as u64
                && let Some(next) = next
            {
                self.prefetch(next.file_id.clone(), cancel.child_token());
            }
        } else {
            *self.last_chunk_fid.lock() = Some(chunk.file_id.clone());
        }

        let src = data.get(offset as usize..).unwrap_or_default();
        let available = src.len().min(buf.len());
        buf[..available].copy_from_slice(&src[..available]);
        if available < buf.len() {
            warn!(
                "chunk {} is {} bytes, wanted {} at {}",
                chunk.file_id,
                data.len(),
                buf.len(),
                offset
            );
            buf[available..].fill(0);
        }
        Ok(())
    }

    fn prefetch(&self, file_id: String, cancel: CancellationToken) {
        let cache = self.cache.clone();
        let fetcher = self.fetcher.clone();
        tokio::spawn(async move {
            if let Err(e) = cache.get_or_fetch(&file_id, fetcher.as_ref(), &cancel).await {
                debug!("prefetch of {} failed: {}", file_id, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_cache::{ChunkCache, InMemoryChunkFetcher};
    use crate::error::StorageError;
    use crate::filer::filechunks::{FileChunk, view_from_chunks};
    use std::time::Duration;

    fn reader(
        chunks: &[FileChunk],
        contents: &[(&str, Vec<u8>)],
        file_size: i64,
    ) -> (ChunkReadAt, Arc<InMemoryChunkFetcher>) {
        let fetcher = Arc::new(InMemoryChunkFetcher::new());
        for (fid, data) in contents {
            fetcher.insert(*fid, data.clone());
        }
        let views = Arc::new(view_from_chunks(chunks, 0, i64::MAX));
        let cache = TieredChunkCache::in_memory(64, Duration::from_secs(60), 1 << 20);
        (ChunkReadAt::new(views, file_size, cache, fetcher.clone()), fetcher)
    }

    #[test]
    fn test_reader_pattern_switches_modes() {
        let p = ReaderPattern::new();
        assert!(!p.is_random_mode());
        p.monitor_read_at(100, 10);
        assert!(p.is_random_mode());
        for i in 0..5 {
            p.monitor_read_at(110 + i * 10, 10);
        }
        assert!(!p.is_random_mode());
        assert_eq!(p.is_sequential_counter.load(Ordering::SeqCst), MODE_CHANGE_LIMIT);
        for i in 0..10 {
            p.monitor_read_at(i * 1000, 1);
        }
        assert_eq!(p.is_sequential_counter.load(Ordering::SeqCst), -MODE_CHANGE_LIMIT);
    }

    #[tokio::test]
    async fn test_read_across_chunks_and_holes() {
        let chunks = [
            FileChunk::new("1,a", 0, 4, 1),
            FileChunk::new("1,b", 8, 4, 1),
        ];
        let (r, _) = reader(
            &chunks,
            &[("1,a", b"AAAA".to_vec()), ("1,b", b"BBBB".to_vec())],
            16,
        );
        let cancel = CancellationToken::new();

        let mut buf = vec![0xffu8; 16];
        let n = r.read_at(&mut buf, 0, &cancel).await.unwrap();
        assert_eq!(n, 16);
        assert_eq!(&buf, b"AAAA\0\0\0\0BBBB\0\0\0\0");

        let mut buf = vec![0xffu8; 4];
        let n = r.read_at(&mut buf, 2, &cancel).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"AA\0\0");
    }

    #[tokio::test]
    async fn test_read_stops_at_file_size() {
        let chunks = [FileChunk::new("1,a", 0, 4, 1)];
        let (r, _) = reader(&chunks, &[("1,a", b"abcd".to_vec())], 6);
        let cancel = CancellationToken::new();

        let mut buf = vec![0xffu8; 10];
        let n = r.read_at(&mut buf, 0, &cancel).await.unwrap();
        assert_eq!(n, 6);
        assert_eq!(&buf[..6], b"abcd\0\0");

        assert_eq!(r.read_at(&mut buf, 20, &cancel).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_overwritten_ranges_read_newest() {
        let chunks = [
            FileChunk::new("1,old", 0, 8, 1),
            FileChunk::new("1,new", 2, 3, 2),
        ];
        let (r, _) = reader(
            &chunks,
            &[("1,old", b"oooooooo".to_vec()), ("1,new", b"NNN".to_vec())],
            8,
        );
        let mut buf = vec![0u8; 8];
        let (n, ts) = r
            .read_at_with_time(&mut buf, 0, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(n, 8);
        assert_eq!(ts, 2);
        assert_eq!(&buf, b"ooNNNooo");
    }

    #[tokio::test]
    async fn test_fetch_failure_propagates() {
        let chunks = [FileChunk::new("1,gone", 0, 4, 1)];
        let (r, _) = reader(&chunks, &[], 4);
        let mut buf = vec![0u8; 4];
        let err = r.read_at(&mut buf, 0, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, StorageError::Fetch(_)));
    }

    #[tokio::test]
    async fn test_sequential_read_prefetches_next_chunk() {
        let chunks: Vec<FileChunk> = (0..4)
            .map(|i| FileChunk::new(format!("1,{i}"), i * 4, 4, 1))
            .collect();
        let contents: Vec<(String, Vec<u8>)> = (0..4)
            .map(|i| (format!("1,{i}"), vec![b'a' + i as u8; 4]))
            .collect();
        let refs: Vec<(&str, Vec<u8>)> = contents
            .iter()
            .map(|(f, d)| (f.as_str(), d.clone()))
            .collect();
        let (r, fetcher) = reader(&chunks, &refs, 16);
        let cancel = CancellationToken::new();

        let mut buf = [0u8; 4];
        r.read_at(&mut buf, 0, &cancel).await.unwrap();
        assert_eq!(&buf, b"aaaa");

        // the next chunk shows up without being read
        for _ in 0..100 {
            if r.cache.memory().is_in_cache("1,1").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(r.cache.memory().is_in_cache("1,1").await);

        r.read_at(&mut buf, 4, &cancel).await.unwrap();
        assert_eq!(&buf, b"bbbb");
        // moving on dropped the first chunk from memory
        assert!(!r.cache.memory().is_in_cache("1,0").await);
        assert!(fetcher.fetch_count() >= 2);
    }

    #[tokio::test]
    async fn test_cancelled_read() {
        let fetcher = Arc::new(InMemoryChunkFetcher::with_latency(Duration::from_secs(3600)));
        fetcher.insert("1,a", b"abcd".to_vec());
        let views = Arc::new(view_from_chunks(&[FileChunk::new("1,a", 0, 4, 1)], 0, i64::MAX));
        let cache = TieredChunkCache::in_memory(64, Duration::from_secs(60), 1 << 20);
        let r = ChunkReadAt::new(views, 4, cache.clone(), fetcher);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut buf = [0u8; 4];
        let err = r.read_at(&mut buf, 0, &cancel).await.unwrap_err();
        assert!(matches!(err, StorageError::Cancelled));
        assert_eq!(cache.in_flight_count(), 0);
    }
}
