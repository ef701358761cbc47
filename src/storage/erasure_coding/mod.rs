//! Erasure-coded volumes: addressing data inside the shards and keeping the
//! sorted `.ecx` index in step with deletions.

mod index;
mod locate;

use std::fmt;

pub use index::{
    EcIndex, find_needle_in_sorted_index, mark_needle_deleted, rebuild_ecx_file,
    search_needle_from_sorted_index,
};
pub use locate::{ErasureInterval, locate_data};

pub const DATA_SHARDS_COUNT: usize = 10;
pub const PARITY_SHARDS_COUNT: usize = 4;
pub const TOTAL_SHARDS_COUNT: usize = DATA_SHARDS_COUNT + PARITY_SHARDS_COUNT;
pub const ERASURE_CODING_LARGE_BLOCK_SIZE: i64 = 1024 * 1024 * 1024;
pub const ERASURE_CODING_SMALL_BLOCK_SIZE: i64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardId(pub u8);

impl ShardId {
    pub fn is_data_shard(self) -> bool {
        (self.0 as usize) < DATA_SHARDS_COUNT
    }

    /// Shard file extension, `.ec00` to `.ec13`.
    pub fn extension(self) -> String {
        format!(".ec{:02}", self.0)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
