//! A volume: superblock and needles in `<id>.dat`, index entries in `<id>.idx`,
//! and an in-memory map from needle id to location rebuilt on open.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::error::{Result, StorageError};
use crate::storage::backend::{BackendStorageFile, DiskFile};
use crate::storage::idx::{encode_idx_entry, walk_index_file};
use crate::storage::needle::{AppendResult, Needle, VolumeId, truncate_back};
use crate::storage::super_block::{SUPER_BLOCK_SIZE, SuperBlock};
use crate::storage::types::{Cookie, NEEDLE_PADDING_SIZE, NeedleId, Offset, Size, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeedleValue {
    pub offset: Offset,
    pub size: Size,
}

pub struct Volume {
    id: VolumeId,
    super_block: SuperBlock,
    dat: Arc<dyn BackendStorageFile>,
    idx: Arc<dyn BackendStorageFile>,
    needle_map: RwLock<HashMap<NeedleId, NeedleValue>>,
    /// Serializes appends; holds the last append timestamp.
    last_append_at_ns: Mutex<u64>,
}

fn padded(len: usize) -> usize {
    len.div_ceil(NEEDLE_PADDING_SIZE) * NEEDLE_PADDING_SIZE
}

impl Volume {
    /// Opens `<dir>/<id>.dat` and `<dir>/<id>.idx`, creating them with
    /// `super_block` if the volume is new.
    pub async fn open_dir<P: AsRef<Path>>(
        dir: P,
        id: VolumeId,
        super_block: SuperBlock,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let dat = DiskFile::open(dir.join(format!("{id}.dat"))).await?;
        let idx = DiskFile::open(dir.join(format!("{id}.idx"))).await?;
        Self::load(id, Arc::new(dat), Arc::new(idx), super_block).await
    }

    /// Loads a volume over arbitrary backends. An empty `.dat` gets
    /// `super_block` written to it; otherwise the stored one wins.
    pub async fn load(
        id: VolumeId,
        dat: Arc<dyn BackendStorageFile>,
        idx: Arc<dyn BackendStorageFile>,
        super_block: SuperBlock,
    ) -> Result<Self> {
        let (dat_size, _) = dat.stat().await?;
        let super_block = if dat_size == 0 {
            let mut bytes = super_block.to_bytes()?;
            bytes.resize(padded(bytes.len()), 0);
            dat.write_at(&bytes, 0).await?;
            info!("Created volume {} with superblock {:?}", id, super_block);
            super_block
        } else {
            read_super_block(dat.as_ref()).await?
        };

        let mut map = HashMap::new();
        walk_index_file(idx.as_ref(), 0, |key, offset, size| {
            if !offset.is_zero() && size.is_valid() {
                map.insert(key, NeedleValue { offset, size });
            } else {
                map.remove(&key);
            }
            Ok(())
        })
        .await?;
        debug!("Loaded volume {} with {} live needles", id, map.len());

        Ok(Self {
            id,
            super_block,
            dat,
            idx,
            needle_map: RwLock::new(map),
            last_append_at_ns: Mutex::new(0),
        })
    }

    pub fn id(&self) -> VolumeId {
        self.id
    }

    pub fn version(&self) -> Version {
        self.super_block.version
    }

    pub fn super_block(&self) -> &SuperBlock {
        &self.super_block
    }

    pub fn file_count(&self) -> usize {
        self.needle_map.read().len()
    }

    pub async fn content_size(&self) -> Result<u64> {
        Ok(self.dat.stat().await?.0)
    }

    pub fn lookup(&self, id: NeedleId) -> Option<NeedleValue> {
        self.needle_map.read().get(&id).copied()
    }

    async fn append_index(&self, key: NeedleId, offset: Offset, size: Size) -> Result<()> {
        let (end, _) = self.idx.stat().await?;
        self.idx
            .write_at(&encode_idx_entry(key, offset, size), end)
            .await?;
        Ok(())
    }

    /// Appends `needle` and records it in the index. An empty needle leaves
    /// the id unreadable, the same as replaying the index on open.
    pub async fn write_needle(&self, needle: &mut Needle) -> Result<AppendResult> {
        let mut last = self.last_append_at_ns.lock().await;
        needle.update_append_at_ns(*last);

        let result = needle.append(self.dat.as_ref(), self.version()).await?;
        let offset = Offset::from_actual_offset(result.offset);
        if let Err(e) = self.append_index(needle.id, offset, result.size).await {
            error!("volume {} index write for {} failed: {}", self.id, needle.id, e);
            truncate_back(self.dat.as_ref(), result.offset).await;
            return Err(e);
        }
        *last = needle.append_at_ns;

        let mut map = self.needle_map.write();
        if result.size.is_valid() {
            map.insert(
                needle.id,
                NeedleValue {
                    offset,
                    size: result.size,
                },
            );
        } else {
            map.remove(&needle.id);
        }
        Ok(result)
    }

    /// Reads a live needle, verifying its cookie. A wrong cookie reads as
    /// not found.
    pub async fn read_needle(&self, id: NeedleId, cookie: Cookie) -> Result<Needle> {
        let Some(nv) = self.lookup(id) else {
            return Err(StorageError::not_found(format!("needle {id} in volume {}", self.id)));
        };
        if nv.size.is_deleted() {
            return Err(StorageError::Deleted(id.to_string()));
        }
        let n = Needle::read_data(
            self.dat.as_ref(),
            nv.offset.to_actual_offset(),
            nv.size,
            self.version(),
        )
        .await?;
        if n.cookie != cookie {
            debug!("volume {} needle {} cookie mismatch", self.id, id);
            return Err(StorageError::not_found(format!("needle {id} in volume {}", self.id)));
        }
        Ok(n)
    }

    /// Appends a tombstone for the needle and drops it from the map. Returns
    /// the size that was freed, zero if the needle was not live.
    pub async fn delete_needle(&self, id: NeedleId, cookie: Cookie) -> Result<Size> {
        let existing = match self.read_needle(id, cookie).await {
            Ok(n) => n,
            Err(e) if e.is_not_found() => return Ok(Size(0)),
            Err(e) => return Err(e),
        };

        let mut last = self.last_append_at_ns.lock().await;
        let mut tombstone = Needle::new(id, cookie, Vec::new());
        tombstone.update_append_at_ns(*last);
        let result = tombstone.append(self.dat.as_ref(), self.version()).await?;
        let offset = Offset::from_actual_offset(result.offset);
        if let Err(e) = self.append_index(id, offset, Size::TOMBSTONE).await {
            error!("volume {} tombstone index write for {} failed: {}", self.id, id, e);
            truncate_back(self.dat.as_ref(), result.offset).await;
            return Err(e);
        }
        *last = tombstone.append_at_ns;

        self.needle_map.write().remove(&id);
        Ok(existing.size)
    }

    pub async fn close(&self) -> Result<()> {
        self.dat.close().await?;
        self.idx.close().await
    }
}

async fn read_super_block(dat: &dyn BackendStorageFile) -> Result<SuperBlock> {
    let mut header = [0u8; SUPER_BLOCK_SIZE];
    dat.read_exact_at(&mut header, 0).await?;
    let version = Version::try_from(header[0])?;
    let extra_size = u16::from_be_bytes([header[6], header[7]]) as usize;
    if version == Version::V1 || extra_size == 0 {
        return SuperBlock::parse(&header);
    }
    let mut full = vec![0u8; SUPER_BLOCK_SIZE + extra_size];
    dat.read_exact_at(&mut full, 0).await?;
    SuperBlock::parse(&full)
}
