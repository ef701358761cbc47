//! Read side of the filer: resolving a file's chunk history into the bytes
//! that are visible now, and reading them through the chunk cache.

pub mod fetcher;
pub mod filechunks;
pub mod interval_list;
pub mod reader_at;
pub mod section;

pub use fetcher::VolumeChunkFetcher;
pub use filechunks::{
    ChunkView, FileChunk, VisibleInterval, resolve_visible_intervals, total_size,
    view_from_chunks, views_from_visible_intervals,
};
pub use interval_list::{Interval, IntervalList, IntervalValue};
pub use reader_at::{ChunkReadAt, ReaderPattern};
pub use section::{ChunkGroup, FileChunkSection, SECTION_SIZE};
