use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::trace;

use crate::chunk_cache::ChunkFetcher;
use crate::storage::needle::{FileId, VolumeId};
use crate::storage::volume::Volume;

/// Serves chunks straight out of volumes opened in this process.
#[derive(Default)]
pub struct VolumeChunkFetcher {
    volumes: RwLock<HashMap<VolumeId, Arc<Volume>>>,
}

impl VolumeChunkFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_volume(&self, volume: Arc<Volume>) {
        self.volumes.write().insert(volume.id(), volume);
    }

    pub fn remove_volume(&self, id: VolumeId) -> Option<Arc<Volume>> {
        self.volumes.write().remove(&id)
    }

    fn volume(&self, id: VolumeId) -> Option<Arc<Volume>> {
        self.volumes.read().get(&id).cloned()
    }
}

#[async_trait]
impl ChunkFetcher for VolumeChunkFetcher {
    async fn fetch_chunk(&self, file_id: &str) -> anyhow::Result<Vec<u8>> {
        let fid: FileId = file_id.parse()?;
        let volume = self
            .volume(fid.volume_id)
            .ok_or_else(|| anyhow!("volume {} not found for {}", fid.volume_id, file_id))?;
        let needle = volume
            .read_needle(fid.key, fid.cookie)
            .await
            .with_context(|| format!("read chunk {file_id}"))?;
        trace!("fetched {} bytes for {}", needle.data.len(), file_id);
        Ok(needle.data)
    }
}
