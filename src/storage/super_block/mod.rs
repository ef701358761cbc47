//! Volume superblock: the 8-byte header at offset 0 of every `.dat` file,
//! optionally followed by a JSON extension for version 2 and later.
//!
//! ```text
//! version:u8 | replica_placement:u8 | ttl:2 | compaction_revision:u16 | extra_size:u16 | extra
//! ```

mod replica_placement;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, StorageError};
use crate::storage::ttl::Ttl;
use crate::storage::types::{CURRENT_VERSION, Version};

pub use replica_placement::ReplicaPlacement;

pub const SUPER_BLOCK_SIZE: usize = 8;
pub const MAX_EXTRA_SIZE: usize = 256 * 256 - 2;

/// Erasure coding parameters recorded when a volume was encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureCodingExtra {
    pub data_shards: u32,
    pub parity_shards: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_ids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SuperBlockExtra {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub erasure_coding: Option<ErasureCodingExtra>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperBlock {
    pub version: Version,
    pub replica_placement: Option<ReplicaPlacement>,
    pub ttl: Option<Ttl>,
    pub compaction_revision: u16,
    pub extra: Option<SuperBlockExtra>,
    pub extra_size: u16,
}

impl Default for SuperBlock {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            replica_placement: None,
            ttl: None,
            compaction_revision: 0,
            extra: None,
            extra_size: 0,
        }
    }
}

fn encode_extra(extra: &SuperBlockExtra) -> Result<Vec<u8>> {
    let data = serde_json::to_vec(extra)?;
    if data.len() > MAX_EXTRA_SIZE {
        return Err(StorageError::ExtraTooLarge(data.len()));
    }
    Ok(data)
}

impl SuperBlock {
    pub fn new(version: Version, replica_placement: ReplicaPlacement, ttl: Ttl) -> Self {
        Self {
            version,
            replica_placement: Some(replica_placement),
            ttl: Some(ttl),
            ..Default::default()
        }
    }

    /// Sets the extension and records its encoded size.
    pub fn set_extra(&mut self, extra: SuperBlockExtra) -> Result<()> {
        let data = encode_extra(&extra)?;
        self.extra_size = data.len() as u16;
        self.extra = Some(extra);
        Ok(())
    }

    /// True once both the replica placement and the TTL are known.
    pub fn initialized(&self) -> bool {
        self.replica_placement.is_some() && self.ttl.is_some()
    }

    /// Bytes occupied on disk, extension included.
    pub fn block_size(&self) -> usize {
        match self.version {
            Version::V2 | Version::V3 => SUPER_BLOCK_SIZE + self.extra_size as usize,
            Version::V1 => SUPER_BLOCK_SIZE,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; SUPER_BLOCK_SIZE];
        out[0] = self.version.as_u8();
        out[1] = self.replica_placement.map(|rp| rp.to_byte()).unwrap_or(0);
        out[2..4].copy_from_slice(&self.ttl.unwrap_or(Ttl::EMPTY).to_bytes());
        out[4..6].copy_from_slice(&self.compaction_revision.to_be_bytes());

        if self.version >= Version::V2
            && let Some(extra) = &self.extra
        {
            let data = encode_extra(extra)?;
            out[6..8].copy_from_slice(&(data.len() as u16).to_be_bytes());
            out.extend_from_slice(&data);
        }
        Ok(out)
    }

    /// Decodes a superblock from the start of `bytes`. Trailing bytes after the
    /// extension are ignored.
    pub fn parse(bytes: &[u8]) -> Result<SuperBlock> {
        if bytes.len() < SUPER_BLOCK_SIZE {
            return Err(StorageError::SizeMismatch {
                found: bytes.len() as i64,
                expected: SUPER_BLOCK_SIZE as i64,
            });
        }
        let version = Version::try_from(bytes[0])?;
        let replica_placement = ReplicaPlacement::from_byte(bytes[1])?;
        let ttl = Ttl::from_bytes(&bytes[2..4]);
        let compaction_revision = u16::from_be_bytes([bytes[4], bytes[5]]);

        let mut sb = SuperBlock {
            version,
            replica_placement: Some(replica_placement),
            ttl: Some(ttl),
            compaction_revision,
            extra: None,
            extra_size: 0,
        };

        if version >= Version::V2 {
            let extra_size = u16::from_be_bytes([bytes[6], bytes[7]]);
            if extra_size > 0 {
                let end = SUPER_BLOCK_SIZE + extra_size as usize;
                if bytes.len() < end {
                    warn!(
                        "superblock extension of {} bytes truncated to {}",
                        extra_size,
                        bytes.len() - SUPER_BLOCK_SIZE
                    );
                    return Err(StorageError::SizeMismatch {
                        found: bytes.len() as i64,
                        expected: end as i64,
                    });
                }
                sb.extra = Some(serde_json::from_slice(&bytes[SUPER_BLOCK_SIZE..end])?);
                sb.extra_size = extra_size;
            }
        }
        Ok(sb)
    }
}
