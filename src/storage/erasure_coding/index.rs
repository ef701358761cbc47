//! Sorted `.ecx` index of an erasure-coded volume and its `.ecj` deletion
//! journal.
//!
//! Deletions rewrite the size field of the `.ecx` entry in place and append
//! the needle id to the journal, so the index can be rebuilt if the in-place
//! write was lost.

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, StorageError};
use crate::storage::backend::{BackendStorageFile, DiskFile};
use crate::storage::idx::idx_entry;
use crate::storage::types::{
    NEEDLE_ID_SIZE, NEEDLE_MAP_ENTRY_SIZE, NeedleId, OFFSET_SIZE, Offset, Size,
};

/// Binary search of `.ecx` for `needle_id`. `process` is called with the
/// file and the entry's byte offset before returning.
pub async fn search_needle_from_sorted_index<F>(
    ecx: &dyn BackendStorageFile,
    ecx_file_size: u64,
    needle_id: NeedleId,
    process: Option<F>,
) -> Result<(Offset, Size)>
where
    F: AsyncFnOnce(&dyn BackendStorageFile, u64) -> Result<()>,
{
    let mut buf = [0u8; NEEDLE_MAP_ENTRY_SIZE];
    let (mut low, mut high) = (0u64, ecx_file_size / NEEDLE_MAP_ENTRY_SIZE as u64);
    while low < high {
        let middle = low + (high - low) / 2;
        let entry_offset = middle * NEEDLE_MAP_ENTRY_SIZE as u64;
        ecx.read_exact_at(&mut buf, entry_offset).await?;
        let (key, offset, size) = idx_entry(&buf);
        if key == needle_id {
            if let Some(process) = process {
                process(ecx, entry_offset).await?;
            }
            return Ok((offset, size));
        }
        if key < needle_id {
            low = middle + 1;
        } else {
            high = middle;
        }
    }
    Err(StorageError::not_found(format!("needle {needle_id} in ecx")))
}

type NoProcess = fn(&dyn BackendStorageFile, u64) -> std::future::Ready<Result<()>>;

/// Plain lookup in a sorted index, without touching the entry.
pub async fn find_needle_in_sorted_index(
    ecx: &dyn BackendStorageFile,
    ecx_file_size: u64,
    needle_id: NeedleId,
) -> Result<(Offset, Size)> {
    search_needle_from_sorted_index(ecx, ecx_file_size, needle_id, None::<NoProcess>).await
}

/// Overwrites the size of the entry at `entry_offset` with the tombstone.
pub async fn mark_needle_deleted(ecx: &dyn BackendStorageFile, entry_offset: u64) -> Result<()> {
    let tombstone = Size::TOMBSTONE.to_bytes();
    let n = ecx
        .write_at(&tombstone, entry_offset + (NEEDLE_ID_SIZE + OFFSET_SIZE) as u64)
        .await?;
    if n != tombstone.len() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            format!("sorted needle wrote {n} bytes, expected {}", tombstone.len()),
        )
        .into());
    }
    Ok(())
}

fn with_ext(base: &Path, ext: &str) -> PathBuf {
    let mut s = base.as_os_str().to_os_string();
    s.push(ext);
    PathBuf::from(s)
}

/// Open `.ecx` / `.ecj` pair for one erasure-coded volume.
pub struct EcIndex {
    base: PathBuf,
    ecx: DiskFile,
    ecx_file_size: u64,
    ecj: Mutex<DiskFile>,
}

impl EcIndex {
    /// Opens `<base>.ecx` and `<base>.ecj`, creating the journal if missing.
    pub async fn open<P: AsRef<Path>>(base: P) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        let ecx = DiskFile::open(with_ext(&base, ".ecx")).await?;
        let (ecx_file_size, _) = ecx.stat().await?;
        let ecj = DiskFile::open(with_ext(&base, ".ecj")).await?;
        debug!("Opened ec index {:?} with {} bytes", base, ecx_file_size);
        Ok(Self {
            base,
            ecx,
            ecx_file_size,
            ecj: Mutex::new(ecj),
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub async fn find_needle(&self, needle_id: NeedleId) -> Result<(Offset, Size)> {
        find_needle_in_sorted_index(&self.ecx, self.ecx_file_size, needle_id).await
    }

    /// Marks the needle deleted in `.ecx` and journals the id. Deleting an
    /// unknown needle is not an error.
    pub async fn delete_needle(&self, needle_id: NeedleId) -> Result<()> {
        match search_needle_from_sorted_index(
            &self.ecx,
            self.ecx_file_size,
            needle_id,
            Some(mark_needle_deleted),
        )
        .await
        {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        }

        let ecj = self.ecj.lock().await;
        let (end, _) = ecj.stat().await?;
        ecj.write_at(&needle_id.to_bytes(), end).await?;
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.ecx.close().await?;
        self.ecj.lock().await.close().await
    }
}

/// Replays `<base>.ecj` into `<base>.ecx` and removes the journal.
pub async fn rebuild_ecx_file<P: AsRef<Path>>(base: P) -> Result<()> {
    let base = base.as_ref();
    let ecj_path = with_ext(base, ".ecj");
    if !tokio::fs::try_exists(&ecj_path).await? {
        return Ok(());
    }

    let ecx = DiskFile::open(with_ext(base, ".ecx")).await?;
    let (ecx_file_size, _) = ecx.stat().await?;
    let journal = tokio::fs::read(&ecj_path).await?;

    let mut replayed = 0usize;
    for raw in journal.chunks_exact(NEEDLE_ID_SIZE) {
        let needle_id = NeedleId::from_bytes(raw);
        let mark = Some(mark_needle_deleted);
        let found = search_needle_from_sorted_index(&ecx, ecx_file_size, needle_id, mark).await;
        match found {
            Ok(_) => replayed += 1,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    ecx.close().await?;
    tokio::fs::remove_file(&ecj_path).await?;
    info!("Rebuilt {:?}.ecx from {} journal entries", base, replayed);
    Ok(())
}
