//! Large files are read in fixed 64 MiB sections, each resolving only the
//! chunks that touch it.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::chunk_cache::{ChunkFetcher, TieredChunkCache};
use crate::error::Result;
use crate::filer::filechunks::{
    FileChunk, VisibleInterval, add_visible_interval, resolve_visible_intervals,
    separate_garbage_chunks, views_from_visible_intervals,
};
use crate::filer::interval_list::IntervalList;
use crate::filer::reader_at::ChunkReadAt;

pub const SECTION_SIZE: i64 = 64 * 1024 * 1024;

pub type SectionIndex = i64;

#[derive(Default)]
struct SectionState {
    chunks: Vec<FileChunk>,
    visible_intervals: Option<IntervalList<VisibleInterval>>,
    reader: Option<Arc<ChunkReadAt>>,
}

/// One section of a file: its chunks, their visible intervals, and a reader
/// built lazily on first read.
pub struct FileChunkSection {
    section_index: SectionIndex,
    state: Mutex<SectionState>,
}

impl FileChunkSection {
    pub fn new(section_index: SectionIndex) -> Self {
        Self {
            section_index,
            state: Mutex::new(SectionState::default()),
        }
    }

    pub fn section_index(&self) -> SectionIndex {
        self.section_index
    }

    fn start_offset(&self) -> i64 {
        self.section_index * SECTION_SIZE
    }

    fn stop_offset(&self) -> i64 {
        self.start_offset() + SECTION_SIZE
    }

    pub fn chunk_count(&self) -> usize {
        self.state.lock().chunks.len()
    }

    pub fn add_chunk(&self, chunk: FileChunk) {
        let mut state = self.state.lock();
        if let Some(visibles) = state.visible_intervals.as_ref() {
            add_visible_interval(visibles, &chunk, self.start_offset(), self.stop_offset());
        }
        state.chunks.push(chunk);
        // views are rebuilt on the next read
        state.reader = None;
    }

    fn setup_for_read(
        &self,
        cache: &TieredChunkCache,
        fetcher: &Arc<dyn ChunkFetcher>,
        file_size: i64,
    ) -> Arc<ChunkReadAt> {
        let mut state = self.state.lock();
        if let Some(reader) = state.reader.as_ref() {
            reader.set_file_size(file_size);
            return reader.clone();
        }

        if state.visible_intervals.is_none() {
            let visibles =
                resolve_visible_intervals(&state.chunks, self.start_offset(), self.stop_offset());
            let chunks = std::mem::take(&mut state.chunks);
            let (live, garbage) = separate_garbage_chunks(&visibles, chunks);
            if !garbage.is_empty() {
                debug!(
                    "section {} drops {} fully overwritten chunks",
                    self.section_index,
                    garbage.len()
                );
            }
            state.chunks = live;
            state.visible_intervals = Some(visibles);
        }

        let views = state
            .visible_intervals
            .as_ref()
            .map(|v| views_from_visible_intervals(v, self.start_offset(), SECTION_SIZE))
            .unwrap_or_default();
        let reader = Arc::new(ChunkReadAt::new(
            Arc::new(views),
            file_size,
            cache.clone(),
            fetcher.clone(),
        ));
        state.reader = Some(reader.clone());
        reader
    }

    /// Reads `buf.len()` bytes at file offset `offset`, which must lie in this
    /// section.
    pub async fn read_data_at(
        &self,
        cache: &TieredChunkCache,
        fetcher: &Arc<dyn ChunkFetcher>,
        file_size: i64,
        buf: &mut [u8],
        offset: i64,
        cancel: &CancellationToken,
    ) -> Result<(usize, i64)> {
        let reader = self.setup_for_read(cache, fetcher, file_size);
        reader.read_at_with_time(buf, offset, cancel).await
    }

    /// Start of the first data at or after `offset` in this section.
    pub fn data_start_offset(&self, offset: i64, file_size: i64) -> Option<i64> {
        let mut state = self.state.lock();
        if state.visible_intervals.is_none() {
            state.visible_intervals = Some(resolve_visible_intervals(
                &state.chunks,
                self.start_offset(),
                self.stop_offset(),
            ));
        }
        let visibles = state.visible_intervals.as_ref()?;
        visibles
            .intervals()
            .into_iter()
            .filter(|iv| iv.stop_offset > offset)
            .map(|iv| iv.start_offset.max(offset))
            .find(|start| *start < file_size)
    }
}

/// All sections of one file.
pub struct ChunkGroup {
    cache: TieredChunkCache,
    fetcher: Arc<dyn ChunkFetcher>,
    sections: RwLock<BTreeMap<SectionIndex, Arc<FileChunkSection>>>,
}

impl ChunkGroup {
    pub fn new(
        cache: TieredChunkCache,
        fetcher: Arc<dyn ChunkFetcher>,
        chunks: impl IntoIterator<Item = FileChunk>,
    ) -> Self {
        let group = Self {
            cache,
            fetcher,
            sections: RwLock::new(BTreeMap::new()),
        };
        for chunk in chunks {
            group.add_chunk(chunk);
        }
        group
    }

    /// Registers `chunk` with every section it overlaps.
    pub fn add_chunk(&self, chunk: FileChunk) {
        if chunk.size == 0 {
            return;
        }
        let first = chunk.offset / SECTION_SIZE;
        let last = (chunk.stop() - 1) / SECTION_SIZE;
        let mut sections = self.sections.write();
        for index in first..=last {
            sections
                .entry(index)
                .or_insert_with(|| Arc::new(FileChunkSection::new(index)))
                .add_chunk(chunk.clone());
        }
    }

    pub fn section_count(&self) -> usize {
        self.sections.read().len()
    }

    fn section(&self, index: SectionIndex) -> Option<Arc<FileChunkSection>> {
        self.sections.read().get(&index).cloned()
    }

    /// Reads up to `buf.len()` bytes at `offset`, never past `file_size`.
    /// Returns the byte count and the newest modification time read.
    pub async fn read_data_at(
        &self,
        file_size: i64,
        buf: &mut [u8],
        offset: i64,
        cancel: &CancellationToken,
    ) -> Result<(usize, i64)> {
        if offset >= file_size {
            return Ok((0, 0));
        }
        let end = offset + buf.len() as i64;
        let mut n = 0usize;
        let mut ts_ns = 0i64;

        let mut index = offset / SECTION_SIZE;
        while index * SECTION_SIZE < end {
            let range_start = offset.max(index * SECTION_SIZE);
            let range_stop = end.min((index + 1) * SECTION_SIZE);
            index += 1;
            if range_start >= range_stop {
                continue;
            }
            let part = &mut buf[(range_start - offset) as usize..(range_stop - offset) as usize];

            let Some(section) = self.section(index - 1) else {
                let zeroed = (range_stop.min(file_size) - range_start).max(0) as usize;
                part[..zeroed].fill(0);
                n += zeroed;
                continue;
            };

            let (xn, x_ts) = section
                .read_data_at(&self.cache, &self.fetcher, file_size, part, range_start, cancel)
                .await?;
            n += xn;
            ts_ns = ts_ns.max(x_ts);
        }
        Ok((n, ts_ns))
    }

    /// Start of the first data at or after `offset`, skipping holes.
    pub fn data_start_offset(&self, offset: i64, file_size: i64) -> Option<i64> {
        let sections: Vec<Arc<FileChunkSection>> = self
            .sections
            .read()
            .range(offset / SECTION_SIZE..)
            .map(|(_, s)| s.clone())
            .collect();
        let mut offset = offset;
        for section in sections {
            offset = offset.max(section.start_offset());
            if let Some(start) = section.data_start_offset(offset, file_size) {
                return Some(start);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_cache::InMemoryChunkFetcher;
    use std::time::Duration;

    fn group(chunks: Vec<FileChunk>, contents: &[(&str, Vec<u8>)]) -> ChunkGroup {
        let fetcher = Arc::new(InMemoryChunkFetcher::new());
        for (fid, data) in contents {
            fetcher.insert(*fid, data.clone());
        }
        let cache = TieredChunkCache::in_memory(64, Duration::from_secs(60), 1 << 20);
        ChunkGroup::new(cache, fetcher, chunks)
    }

    #[test]
    fn test_chunk_spanning_sections() {
        let g = group(
            vec![
                FileChunk::new("1,a", SECTION_SIZE - 2, 4, 1),
                FileChunk::new("1,b", 3 * SECTION_SIZE, 1, 1),
            ],
            &[],
        );
        assert_eq!(g.section_count(), 3);
        assert_eq!(g.section(0).unwrap().chunk_count(), 1);
        assert_eq!(g.section(1).unwrap().chunk_count(), 1);
        assert!(g.section(2).is_none());
    }

    #[tokio::test]
    async fn test_read_across_section_boundary() {
        let g = group(
            vec![FileChunk::new("1,a", SECTION_SIZE - 2, 4, 1)],
            &[("1,a", b"wxyz".to_vec())],
        );
        let file_size = SECTION_SIZE + 2;
        let mut buf = [0xffu8; 6];
        let (n, ts) = g
            .read_data_at(file_size, &mut buf, SECTION_SIZE - 4, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(n, 6);
        assert_eq!(ts, 1);
        assert_eq!(&buf, b"\0\0wxyz");
    }

    #[tokio::test]
    async fn test_missing_section_reads_as_zeros() {
        let g = group(
            vec![FileChunk::new("1,a", 0, 4, 1)],
            &[("1,a", b"abcd".to_vec())],
        );
        let file_size = 2 * SECTION_SIZE + 10;
        let mut buf = [0xffu8; 8];
        let (n, _) = g
            .read_data_at(file_size, &mut buf, SECTION_SIZE + 100, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(n, 8);
        assert_eq!(buf, [0u8; 8]);

        let (n, _) = g
            .read_data_at(file_size, &mut buf, file_size - 3, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(n, 3);
        let past_end = g
            .read_data_at(file_size, &mut buf, file_size, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(past_end, (0, 0));
    }

    #[tokio::test]
    async fn test_added_chunk_visible_to_next_read() {
        let g = group(
            vec![FileChunk::new("1,a", 0, 4, 1)],
            &[("1,a", b"aaaa".to_vec()), ("1,b", b"bb".to_vec())],
        );
        let cancel = CancellationToken::new();
        let mut buf = [0u8; 4];
        g.read_data_at(4, &mut buf, 0, &cancel).await.unwrap();
        assert_eq!(&buf, b"aaaa");

        g.add_chunk(FileChunk::new("1,b", 1, 2, 2));
        g.read_data_at(4, &mut buf, 0, &cancel).await.unwrap();
        assert_eq!(&buf, b"abba");
    }

    #[test]
    fn test_data_start_offset_skips_holes() {
        let g = group(
            vec![
                FileChunk::new("1,a", 10, 10, 1),
                FileChunk::new("1,b", 2 * SECTION_SIZE + 5, 10, 1),
            ],
            &[],
        );
        let file_size = 3 * SECTION_SIZE;
        assert_eq!(g.data_start_offset(0, file_size), Some(10));
        assert_eq!(g.data_start_offset(15, file_size), Some(15));
        assert_eq!(g.data_start_offset(20, file_size), Some(2 * SECTION_SIZE + 5));
        assert_eq!(g.data_start_offset(2 * SECTION_SIZE + 15, file_size), None);
    }
}
