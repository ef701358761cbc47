use tracing::warn;

use super::{DATA_SHARDS_COUNT, ShardId};

/// A contiguous piece of a located range that lives inside one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErasureInterval {
    /// Index among the large blocks or among the small blocks.
    pub block_index: usize,
    pub inner_block_offset: i64,
    pub size: u64,
    pub is_large_block: bool,
    pub large_block_rows_count: usize,
}

impl ErasureInterval {
    /// Data shard holding this interval and the byte offset inside that shard file.
    pub fn to_shard_id_and_offset(
        &self,
        large_block_size: i64,
        small_block_size: i64,
    ) -> (ShardId, i64) {
        let row_index = (self.block_index / DATA_SHARDS_COUNT) as i64;
        let mut ec_file_offset = self.inner_block_offset;
        if self.is_large_block {
            ec_file_offset += row_index * large_block_size;
        } else {
            let large_rows = self.large_block_rows_count as i64;
            ec_file_offset += large_rows * large_block_size + row_index * small_block_size;
        }
        let shard = (self.block_index % DATA_SHARDS_COUNT) as u8;
        (ShardId(shard), ec_file_offset)
    }
}

fn locate_offset_within_blocks(block_length: i64, offset: i64) -> (usize, i64) {
    ((offset / block_length) as usize, offset % block_length)
}

/// Returns `(block_index, is_large_block, large_block_rows, inner_block_offset)`.
fn locate_offset(
    large_block_length: i64,
    small_block_length: i64,
    shard_dat_size: i64,
    offset: i64,
) -> (usize, bool, i64, i64) {
    let large_row_size = large_block_length * DATA_SHARDS_COUNT as i64;
    let n_large_block_rows = ((shard_dat_size - 1) / large_block_length).max(0);

    if offset < n_large_block_rows * large_row_size {
        let (index, inner) = locate_offset_within_blocks(large_block_length, offset);
        return (index, true, n_large_block_rows, inner);
    }
    let offset = offset - n_large_block_rows * large_row_size;
    let (index, inner) = locate_offset_within_blocks(small_block_length, offset);
    (index, false, n_large_block_rows, inner)
}

/// Maps `[offset, offset + size)` of the original volume onto the blocks
/// striped across the data shards.
///
/// The volume is laid out as rows of [`DATA_SHARDS_COUNT`] large blocks,
/// followed by rows of small blocks for the tail. `shard_dat_size` is the
/// size of one shard file. The returned sizes always add up to `size`.
pub fn locate_data(
    large_block_length: i64,
    small_block_length: i64,
    shard_dat_size: i64,
    offset: i64,
    size: u64,
) -> Vec<ErasureInterval> {
    let mut intervals = Vec::new();
    if large_block_length <= 0 || small_block_length <= 0 || offset < 0 {
        warn!(
            "cannot locate offset {} with block sizes {}/{}",
            offset, large_block_length, small_block_length
        );
        return intervals;
    }

    let (mut block_index, mut is_large_block, n_large_block_rows, mut inner_block_offset) =
        locate_offset(large_block_length, small_block_length, shard_dat_size, offset);
    let large_block_rows_count = n_large_block_rows as usize;

    let mut remaining = size;
    while remaining > 0 {
        let block_length = if is_large_block {
            large_block_length
        } else {
            small_block_length
        };
        let block_remaining = (block_length - inner_block_offset) as u64;
        let take = remaining.min(block_remaining);
        intervals.push(ErasureInterval {
            block_index,
            inner_block_offset,
            size: take,
            is_large_block,
            large_block_rows_count,
        });
        remaining -= take;
        if remaining == 0 {
            break;
        }

        block_index += 1;
        if is_large_block && block_index == large_block_rows_count * DATA_SHARDS_COUNT {
            is_large_block = false;
            block_index = 0;
        }
        inner_block_offset = 0;
    }
    intervals
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_crossing_from_large_to_small_blocks() {
        // 2 rows of large blocks, then small blocks
        let intervals = locate_data(1000, 100, 2500, 19_950, 200);
        assert_eq!(intervals.len(), 3);

        assert_eq!(
            intervals[0],
            ErasureInterval {
                block_index: 19,
                inner_block_offset: 950,
                size: 50,
                is_large_block: true,
                large_block_rows_count: 2,
            }
        );
        assert_eq!(intervals[0].to_shard_id_and_offset(1000, 100), (ShardId(9), 1950));

        assert!(!intervals[1].is_large_block);
        assert_eq!(intervals[1].block_index, 0);
        assert_eq!(intervals[1].size, 100);
        assert_eq!(intervals[1].to_shard_id_and_offset(1000, 100), (ShardId(0), 2000));

        assert_eq!(intervals[2].block_index, 1);
        assert_eq!(intervals[2].size, 50);
        assert_eq!(intervals[2].to_shard_id_and_offset(1000, 100), (ShardId(1), 2000));
    }

    #[test]
    fn test_within_one_block() {
        let intervals = locate_data(1000, 100, 10_000, 1234, 10);
        assert_eq!(intervals.len(), 1);
        assert_eq!(intervals[0].block_index, 1);
        assert_eq!(intervals[0].inner_block_offset, 234);
        assert_eq!(intervals[0].to_shard_id_and_offset(1000, 100), (ShardId(1), 234));
    }

    #[test]
    fn test_small_volume_has_no_large_rows() {
        let intervals = locate_data(1000, 100, 1000, 250, 300);
        assert!(intervals.iter().all(|i| !i.is_large_block));
        assert_eq!(intervals.iter().map(|i| i.size).sum::<u64>(), 300);
        assert_eq!(intervals[0].block_index, 2);
        assert_eq!(intervals[0].inner_block_offset, 50);
    }

    #[test]
    fn test_zero_size() {
        assert!(locate_data(1000, 100, 2500, 10, 0).is_empty());
        assert!(locate_data(0, 100, 2500, 10, 10).is_empty());
    }

    #[test]
    fn test_random_ranges_conserve_size_and_cycle_shards() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..2000 {
            let large = rng.random_range(10..200i64);
            let small = rng.random_range(1..=large);
            let shard_dat_size = rng.random_range(1..2000i64);
            let total = shard_dat_size * DATA_SHARDS_COUNT as i64;
            let offset = rng.random_range(0..total);
            let size = rng.random_range(0..=(total - offset)) as u64;

            let intervals = locate_data(large, small, shard_dat_size, offset, size);
            assert_eq!(intervals.iter().map(|i| i.size).sum::<u64>(), size);

            for pair in intervals.windows(2) {
                let (a, b) = (pair[0], pair[1]);
                assert_eq!(b.inner_block_offset, 0);
                if a.is_large_block == b.is_large_block {
                    assert_eq!(b.block_index, a.block_index + 1);
                    assert_eq!(
                        b.block_index % DATA_SHARDS_COUNT,
                        (a.block_index % DATA_SHARDS_COUNT + 1) % DATA_SHARDS_COUNT
                    );
                } else {
                    assert!(a.is_large_block);
                    assert_eq!(b.block_index, 0);
                }
            }
            for i in &intervals {
                let block_length = if i.is_large_block { large } else { small };
                assert!(i.size as i64 + i.inner_block_offset <= block_length);
            }
        }
    }
}
