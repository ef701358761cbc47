//! From an append-only list of chunks to what a file looks like now.
//!
//! Chunks may overlap; where they do, the one with the newer modification
//! time wins byte by byte. [`resolve_visible_intervals`] folds the chunks into
//! an [`IntervalList`] of [`VisibleInterval`]s and
//! [`views_from_visible_intervals`] projects those onto a read window as
//! [`ChunkView`]s.

use serde::{Deserialize, Serialize};

use crate::filer::interval_list::{IntervalList, IntervalValue};

/// A chunk as recorded in a file entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub file_id: String,
    /// Where the chunk starts in the logical file.
    pub offset: i64,
    pub size: u64,
    pub modified_ts_ns: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cipher_key: Vec<u8>,
    #[serde(default)]
    pub is_compressed: bool,
}

impl FileChunk {
    pub fn new(file_id: impl Into<String>, offset: i64, size: u64, modified_ts_ns: i64) -> Self {
        Self {
            file_id: file_id.into(),
            offset,
            size,
            modified_ts_ns,
            ..Default::default()
        }
    }

    pub fn stop(&self) -> i64 {
        self.offset + self.size as i64
    }
}

/// Logical size of a file: the furthest any chunk reaches.
pub fn total_size(chunks: &[FileChunk]) -> u64 {
    chunks
        .iter()
        .map(|c| c.stop().max(0) as u64)
        .max()
        .unwrap_or(0)
}

/// The part of one chunk that is currently authoritative for `[start, stop)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibleInterval {
    pub start: i64,
    pub stop: i64,
    pub modified_ts_ns: i64,
    pub file_id: String,
    /// Where `start` falls inside the chunk.
    pub offset_in_chunk: i64,
    pub chunk_size: u64,
    pub cipher_key: Vec<u8>,
    pub is_gzipped: bool,
}

impl VisibleInterval {
    /// The whole of `chunk`.
    pub fn from_chunk(chunk: &FileChunk) -> Self {
        Self {
            start: chunk.offset,
            stop: chunk.stop(),
            modified_ts_ns: chunk.modified_ts_ns,
            file_id: chunk.file_id.clone(),
            offset_in_chunk: 0,
            chunk_size: chunk.size,
            cipher_key: chunk.cipher_key.clone(),
            is_gzipped: chunk.is_compressed,
        }
    }
}

impl IntervalValue for VisibleInterval {
    fn set_start_stop(&mut self, start: i64, stop: i64) {
        self.offset_in_chunk += start - self.start;
        self.start = start;
        self.stop = stop;
    }
}

/// A slice of one chunk to read, placed in the logical file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkView {
    pub file_id: String,
    pub offset_in_chunk: i64,
    pub view_size: u64,
    pub view_offset: i64,
    pub chunk_size: u64,
    pub cipher_key: Vec<u8>,
    pub is_gzipped: bool,
    pub modified_ts_ns: i64,
}

impl ChunkView {
    pub fn is_full_chunk(&self) -> bool {
        self.view_size == self.chunk_size
    }

    pub fn view_stop(&self) -> i64 {
        self.view_offset + self.view_size as i64
    }
}

impl IntervalValue for ChunkView {
    fn set_start_stop(&mut self, start: i64, stop: i64) {
        self.offset_in_chunk += start - self.view_offset;
        self.view_offset = start;
        self.view_size = (stop - start).max(0) as u64;
    }
}

/// Folds `chunks` into the visible intervals of `[start, stop)`. Chunks are
/// applied in order, so among equal timestamps the later chunk wins.
pub fn resolve_visible_intervals(
    chunks: &[FileChunk],
    start: i64,
    stop: i64,
) -> IntervalList<VisibleInterval> {
    let visibles = IntervalList::new();
    for chunk in chunks {
        add_visible_interval(&visibles, chunk, start, stop);
    }
    visibles
}

/// Inserts the part of `chunk` inside `[start, stop)` into `visibles`.
pub fn add_visible_interval(
    visibles: &IntervalList<VisibleInterval>,
    chunk: &FileChunk,
    start: i64,
    stop: i64,
) {
    let chunk_start = chunk.offset.max(start);
    let chunk_stop = chunk.stop().min(stop);
    if chunk_start >= chunk_stop {
        return;
    }
    visibles.insert_interval(
        chunk_start,
        chunk_stop,
        chunk.modified_ts_ns,
        VisibleInterval::from_chunk(chunk),
    );
}

/// Chunk views covering `[offset, offset + size)`. A `size` of `i64::MAX`
/// means to the end.
pub fn views_from_visible_intervals(
    visibles: &IntervalList<VisibleInterval>,
    offset: i64,
    size: i64,
) -> IntervalList<ChunkView> {
    let stop = offset.saturating_add(size);
    let views = IntervalList::new();
    for iv in visibles.intervals() {
        let v = iv.value;
        let chunk_start = offset.max(v.start);
        let chunk_stop = stop.min(v.stop);
        if chunk_start >= chunk_stop {
            continue;
        }
        let view = ChunkView {
            offset_in_chunk: v.offset_in_chunk + chunk_start - v.start,
            view_size: (chunk_stop - chunk_start) as u64,
            view_offset: chunk_start,
            chunk_size: v.chunk_size,
            is_gzipped: v.is_gzipped,
            modified_ts_ns: v.modified_ts_ns,
            file_id: v.file_id,
            cipher_key: v.cipher_key,
        };
        views.append_interval(chunk_start, chunk_stop, iv.ts_ns, view);
    }
    views
}

/// Chunk views for `[offset, offset + size)` straight from the chunk list.
pub fn view_from_chunks(chunks: &[FileChunk], offset: i64, size: i64) -> IntervalList<ChunkView> {
    let visibles = resolve_visible_intervals(chunks, 0, i64::MAX);
    views_from_visible_intervals(&visibles, offset, size)
}

/// Splits `chunks` into those still visible somewhere and those fully
/// overwritten.
pub fn separate_garbage_chunks(
    visibles: &IntervalList<VisibleInterval>,
    chunks: Vec<FileChunk>,
) -> (Vec<FileChunk>, Vec<FileChunk>) {
    let live: std::collections::HashSet<String> = visibles
        .intervals()
        .into_iter()
        .map(|iv| iv.value.file_id)
        .collect();
    chunks.into_iter().partition(|c| live.contains(&c.file_id))
}
