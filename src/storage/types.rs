//! On-disk primitive types and the fixed sizes derived from them.
//!
//! Every multi-byte integer is stored big-endian.

use std::fmt;

use crate::error::{Result, StorageError};

pub const NEEDLE_ID_SIZE: usize = 8;
pub const COOKIE_SIZE: usize = 4;
pub const SIZE_SIZE: usize = 4;
pub const OFFSET_SIZE: usize = 4;
pub const NEEDLE_HEADER_SIZE: usize = COOKIE_SIZE + NEEDLE_ID_SIZE + SIZE_SIZE;
pub const DATA_SIZE_SIZE: usize = 4;
pub const NEEDLE_CHECKSUM_SIZE: usize = 4;
pub const TIMESTAMP_SIZE: usize = 8;
pub const NEEDLE_PADDING_SIZE: usize = 8;
pub const NEEDLE_MAP_ENTRY_SIZE: usize = NEEDLE_ID_SIZE + OFFSET_SIZE + SIZE_SIZE;
pub const LAST_MODIFIED_BYTES_LENGTH: usize = 5;
pub const TTL_BYTES_LENGTH: usize = 2;

/// 4-byte offsets in units of 8 bytes address at most 32 GiB.
pub const MAX_POSSIBLE_VOLUME_SIZE: u64 = 4 * 1024 * 1024 * 1024 * 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NeedleId(pub u64);

impl NeedleId {
    pub fn to_bytes(self) -> [u8; NEEDLE_ID_SIZE] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut raw = [0u8; NEEDLE_ID_SIZE];
        raw.copy_from_slice(&bytes[..NEEDLE_ID_SIZE]);
        NeedleId(u64::from_be_bytes(raw))
    }

    pub fn parse(s: &str) -> Result<Self> {
        u64::from_str_radix(s, 16)
            .map(NeedleId)
            .map_err(|e| StorageError::InvalidFileId(format!("needle id {s}: {e}")))
    }
}

impl fmt::Display for NeedleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Cookie(pub u32);

impl Cookie {
    pub fn random() -> Self {
        Cookie(rand::random::<u32>())
    }

    pub fn to_bytes(self) -> [u8; COOKIE_SIZE] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut raw = [0u8; COOKIE_SIZE];
        raw.copy_from_slice(&bytes[..COOKIE_SIZE]);
        Cookie(u32::from_be_bytes(raw))
    }

    pub fn parse(s: &str) -> Result<Self> {
        if s.len() > COOKIE_SIZE * 2 {
            return Err(StorageError::InvalidFileId(format!("cookie {s} too long")));
        }
        u32::from_str_radix(s, 16)
            .map(Cookie)
            .map_err(|e| StorageError::InvalidFileId(format!("cookie {s}: {e}")))
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Needle size as stored in headers and index entries. Negative values mark
/// a deleted needle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Size(pub i32);

impl Size {
    pub const TOMBSTONE: Size = Size(-1);

    pub fn is_deleted(self) -> bool {
        self.0 < 0
    }

    pub fn is_tombstone(self) -> bool {
        self == Self::TOMBSTONE
    }

    pub fn is_valid(self) -> bool {
        self.0 > 0
    }

    /// Byte length with the deletion marker stripped.
    pub fn raw(self) -> u32 {
        if self.0 < 0 {
            (-(self.0 as i64)) as u32
        } else {
            self.0 as u32
        }
    }

    pub fn to_bytes(self) -> [u8; SIZE_SIZE] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut raw = [0u8; SIZE_SIZE];
        raw.copy_from_slice(&bytes[..SIZE_SIZE]);
        Size(i32::from_be_bytes(raw))
    }
}

/// Offset into a `.dat` file, stored divided by [`NEEDLE_PADDING_SIZE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Offset(pub u32);

impl Offset {
    pub fn from_actual_offset(actual: u64) -> Self {
        Offset((actual / NEEDLE_PADDING_SIZE as u64) as u32)
    }

    pub fn to_actual_offset(self) -> u64 {
        self.0 as u64 * NEEDLE_PADDING_SIZE as u64
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn to_bytes(self) -> [u8; OFFSET_SIZE] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut raw = [0u8; OFFSET_SIZE];
        raw.copy_from_slice(&bytes[..OFFSET_SIZE]);
        Offset(u32::from_be_bytes(raw))
    }
}

/// Needle record format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Version {
    V1 = 1,
    V2 = 2,
    V3 = 3,
}

pub const CURRENT_VERSION: Version = Version::V3;

impl Version {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Version {
    type Error = StorageError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Version::V1),
            2 => Ok(Version::V2),
            3 => Ok(Version::V3),
            other => Err(StorageError::UnsupportedVersion(other)),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.as_u8())
    }
}
