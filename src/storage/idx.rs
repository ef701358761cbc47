//! `.idx` files: a flat log of 16-byte `key | offset | size` entries.

use tracing::trace;

use crate::error::Result;
use crate::storage::backend::BackendStorageFile;
use crate::storage::types::{
    NEEDLE_ID_SIZE, NEEDLE_MAP_ENTRY_SIZE, NeedleId, OFFSET_SIZE, Offset, Size,
};

/// Entries fetched per read while walking an index.
pub const ROWS_TO_READ: usize = 1024;

/// Decodes one entry. `bytes` must hold at least [`NEEDLE_MAP_ENTRY_SIZE`] bytes.
pub fn idx_entry(bytes: &[u8]) -> (NeedleId, Offset, Size) {
    let key = NeedleId::from_bytes(&bytes[..NEEDLE_ID_SIZE]);
    let offset = Offset::from_bytes(&bytes[NEEDLE_ID_SIZE..NEEDLE_ID_SIZE + OFFSET_SIZE]);
    let size = Size::from_bytes(&bytes[NEEDLE_ID_SIZE + OFFSET_SIZE..NEEDLE_MAP_ENTRY_SIZE]);
    (key, offset, size)
}

pub fn encode_idx_entry(key: NeedleId, offset: Offset, size: Size) -> [u8; NEEDLE_MAP_ENTRY_SIZE] {
    let mut out = [0u8; NEEDLE_MAP_ENTRY_SIZE];
    out[..NEEDLE_ID_SIZE].copy_from_slice(&key.to_bytes());
    out[NEEDLE_ID_SIZE..NEEDLE_ID_SIZE + OFFSET_SIZE].copy_from_slice(&offset.to_bytes());
    out[NEEDLE_ID_SIZE + OFFSET_SIZE..].copy_from_slice(&size.to_bytes());
    out
}

/// Calls `f` for every entry starting at entry number `start_from`. A trailing
/// partial entry is ignored; the first error from `f` stops the walk.
pub async fn walk_index_file<F>(
    file: &dyn BackendStorageFile,
    start_from: u64,
    mut f: F,
) -> Result<()>
where
    F: FnMut(NeedleId, Offset, Size) -> Result<()>,
{
    let mut reader_offset = start_from * NEEDLE_MAP_ENTRY_SIZE as u64;
    let mut buf = vec![0u8; NEEDLE_MAP_ENTRY_SIZE * ROWS_TO_READ];
    loop {
        let count = file.read_at(&mut buf, reader_offset).await?;
        trace!("{} index offset {} read {}", file.name(), reader_offset, count);
        let whole = count - count % NEEDLE_MAP_ENTRY_SIZE;
        for entry in buf[..whole].chunks_exact(NEEDLE_MAP_ENTRY_SIZE) {
            let (key, offset, size) = idx_entry(entry);
            f(key, offset, size)?;
        }
        if count < buf.len() {
            return Ok(());
        }
        reader_offset += count as u64;
    }
}

/// Binary search over sorted entries for the first one where `le` is false.
/// Returns the entry count when `le` holds everywhere.
pub fn first_invalid_index<F>(bytes: &[u8], mut le: F) -> Result<usize>
where
    F: FnMut(NeedleId, Offset, Size) -> Result<bool>,
{
    let entries = bytes.len() / NEEDLE_MAP_ENTRY_SIZE;
    let (mut left, mut right) = (0usize, entries);
    while left < right {
        let mid = left + (right - left) / 2;
        let loc = mid * NEEDLE_MAP_ENTRY_SIZE;
        let (key, offset, size) = idx_entry(&bytes[loc..loc + NEEDLE_MAP_ENTRY_SIZE]);
        if le(key, offset, size)? {
            left = mid + 1;
        } else {
            right = mid;
        }
    }
    Ok(left)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::MemoryFile;

    fn index_of(n: u64) -> Vec<u8> {
        let mut out = Vec::new();
        for i in 0..n {
            out.extend_from_slice(&encode_idx_entry(
                NeedleId(i),
                Offset(i as u32 * 2),
                Size(i as i32 + 1),
            ));
        }
        out
    }

    #[test]
    fn test_entry_codec() {
        let raw = encode_idx_entry(NeedleId(0xabc), Offset(17), Size::TOMBSTONE);
        assert_eq!(idx_entry(&raw), (NeedleId(0xabc), Offset(17), Size::TOMBSTONE));
    }

    #[tokio::test]
    async fn test_walk_spans_several_reads() {
        let rows = ROWS_TO_READ as u64 * 2 + 5;
        let mut bytes = index_of(rows);
        // half-written trailing entry
        bytes.extend_from_slice(&[1, 2, 3]);
        let file = MemoryFile::with_data("1.idx", bytes);

        let mut seen = Vec::new();
        walk_index_file(&file, 0, |key, offset, size| {
            assert_eq!(offset.0 as u64, key.0 * 2);
            assert_eq!(size.0 as u64, key.0 + 1);
            seen.push(key.0);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(seen, (0..rows).collect::<Vec<_>>());

        let mut from_ten = 0;
        walk_index_file(&file, 10, |_, _, _| {
            from_ten += 1;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(from_ten, rows - 10);
    }

    #[tokio::test]
    async fn test_walk_stops_on_error() {
        let file = MemoryFile::with_data("1.idx", index_of(10));
        let mut calls = 0;
        let res = walk_index_file(&file, 0, |key, _, _| {
            calls += 1;
            if key.0 == 3 {
                Err(crate::error::StorageError::not_found("stop"))
            } else {
                Ok(())
            }
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_first_invalid_index() {
        let bytes = index_of(100);
        for target in [0u64, 1, 37, 99, 100, 150] {
            let idx = first_invalid_index(&bytes, |key, _, _| Ok(key.0 < target)).unwrap();
            assert_eq!(idx as u64, target.min(100));
        }
        assert_eq!(first_invalid_index(&[], |_, _, _| Ok(true)).unwrap(), 0);
    }
}
