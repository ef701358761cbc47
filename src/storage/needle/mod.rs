//! Needles: the unit of storage inside a volume's `.dat` file.
//!
//! Layout on disk, all integers big-endian:
//!
//! ```text
//! header   cookie:u32 | id:u64 | size:i32
//! body v1  data
//! body v2+ data_size:u32 | data | flags:u8 | [name_size:u8 | name]
//!          | [mime_size:u8 | mime] | [last_modified:5] | [ttl:2]
//!          | [pairs_size:u16 | pairs]
//! tail     checksum:u32 | [append_at_ns:u64, v3 only]
//! padding  1..=8 bytes up to the next multiple of 8
//! ```
//!
//! `size` is the length of the body (not including the tail), and is zero for
//! a needle without data.

mod codec;
mod crc;
mod file_id;
mod io;

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;

use crate::error::{Result, StorageError};
use crate::storage::ttl::Ttl;
use crate::storage::types::{Cookie, NeedleId, Size};

pub use codec::{actual_size, body_length, padding_length};
pub use crc::Crc;
pub use file_id::{FileId, VolumeId};
pub(crate) use io::truncate_back;
pub use io::{
    AppendResult, get_append_at_ns, read_needle_blob, read_needle_header, write_needle_blob,
};

pub const MAX_NAME_SIZE: usize = u8::MAX as usize;
pub const MAX_MIME_SIZE: usize = u8::MAX as usize;
pub const MAX_PAIRS_SIZE: usize = u16::MAX as usize;

/// Prefix of upload headers that end up in the pairs blob, stripped on store.
pub const PAIR_NAME_PREFIX: &str = "Seaweed-";

bitflags! {
    /// Presence bits for the optional v2 body fields.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct NeedleFlags: u8 {
        const COMPRESSED = 0x01;
        const HAS_NAME = 0x02;
        const HAS_MIME = 0x04;
        const HAS_LAST_MODIFIED = 0x08;
        const HAS_TTL = 0x10;
        const HAS_PAIRS = 0x20;
        const IS_CHUNK_MANIFEST = 0x80;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Needle {
    pub cookie: Cookie,
    pub id: NeedleId,
    /// Body length. Set by [`Needle::encode`] and by decoding.
    pub size: Size,

    pub data: Vec<u8>,
    pub flags: NeedleFlags,
    pub name: Vec<u8>,
    pub mime: Vec<u8>,
    /// JSON object of extra metadata.
    pub pairs: Vec<u8>,
    /// Seconds since the epoch; only the low 5 bytes are stored.
    pub last_modified: u64,
    pub ttl: Option<Ttl>,

    pub checksum: Crc,
    /// Version 3 only.
    pub append_at_ns: u64,
}

impl Needle {
    pub fn new(id: NeedleId, cookie: Cookie, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        Self {
            id,
            cookie,
            checksum: Crc::new(&data),
            data,
            ..Default::default()
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags.contains(NeedleFlags::COMPRESSED)
    }

    pub fn set_compressed(&mut self) {
        self.flags.insert(NeedleFlags::COMPRESSED);
    }

    pub fn has_name(&self) -> bool {
        self.flags.contains(NeedleFlags::HAS_NAME)
    }

    /// Names longer than 255 bytes are cut when encoded.
    pub fn set_name(&mut self, name: impl Into<Vec<u8>>) {
        self.name = name.into();
        self.flags.insert(NeedleFlags::HAS_NAME);
    }

    pub fn has_mime(&self) -> bool {
        self.flags.contains(NeedleFlags::HAS_MIME)
    }

    pub fn set_mime(&mut self, mime: impl Into<Vec<u8>>) -> Result<()> {
        let mime = mime.into();
        if mime.len() > MAX_MIME_SIZE {
            return Err(StorageError::FieldTooLarge {
                what: "mime",
                len: mime.len(),
                max: MAX_MIME_SIZE,
            });
        }
        self.mime = mime;
        self.flags.insert(NeedleFlags::HAS_MIME);
        Ok(())
    }

    pub fn has_last_modified(&self) -> bool {
        self.flags.contains(NeedleFlags::HAS_LAST_MODIFIED)
    }

    /// Seconds since the epoch; zero means now.
    pub fn set_last_modified(&mut self, secs: u64) {
        self.last_modified = if secs == 0 {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default()
        } else {
            secs
        };
        self.flags.insert(NeedleFlags::HAS_LAST_MODIFIED);
    }

    pub fn has_ttl(&self) -> bool {
        self.flags.contains(NeedleFlags::HAS_TTL)
    }

    /// An empty TTL clears the field instead of setting it.
    pub fn set_ttl(&mut self, ttl: Ttl) {
        if ttl.is_empty() {
            self.ttl = None;
            self.flags.remove(NeedleFlags::HAS_TTL);
        } else {
            self.ttl = Some(ttl);
            self.flags.insert(NeedleFlags::HAS_TTL);
        }
    }

    pub fn has_pairs(&self) -> bool {
        self.flags.contains(NeedleFlags::HAS_PAIRS)
    }

    /// Stores `pairs` as a JSON object, dropping [`PAIR_NAME_PREFIX`] from keys.
    pub fn set_pairs(&mut self, pairs: &BTreeMap<String, String>) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let trimmed: BTreeMap<&str, &str> = pairs
            .iter()
            .map(|(k, v)| {
                (
                    k.strip_prefix(PAIR_NAME_PREFIX).unwrap_or(k.as_str()),
                    v.as_str(),
                )
            })
            .collect();
        let encoded = serde_json::to_vec(&trimmed)?;
        if encoded.len() > MAX_PAIRS_SIZE {
            return Err(StorageError::FieldTooLarge {
                what: "pairs",
                len: encoded.len(),
                max: MAX_PAIRS_SIZE,
            });
        }
        self.pairs = encoded;
        self.flags.insert(NeedleFlags::HAS_PAIRS);
        Ok(())
    }

    pub fn pairs_map(&self) -> Result<BTreeMap<String, String>> {
        if self.pairs.is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_slice(&self.pairs)?)
    }

    pub fn is_chunk_manifest(&self) -> bool {
        self.flags.contains(NeedleFlags::IS_CHUNK_MANIFEST)
    }

    pub fn set_chunk_manifest(&mut self) {
        self.flags.insert(NeedleFlags::IS_CHUNK_MANIFEST);
    }

    pub fn etag(&self) -> String {
        self.checksum.etag()
    }

    /// Sets the append timestamp so it is strictly after `last_append_at_ns`.
    pub fn update_append_at_ns(&mut self, last_append_at_ns: u64) {
        self.append_at_ns = get_append_at_ns(last_append_at_ns);
    }
}

impl std::fmt::Display for Needle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{} size:{} data:{} name:{} mime:{} compressed:{}",
            self.id,
            self.cookie,
            self.size.0,
            self.data.len(),
            String::from_utf8_lossy(&self.name),
            String::from_utf8_lossy(&self.mime),
            self.is_compressed()
        )
    }
}
