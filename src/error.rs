//! Error surface shared by the codecs, the volume layer and the read path.
//!
//! Decode and locate functions never panic on malformed input; they return one
//! of these variants and leave retry/skip/abort decisions to the caller.

use std::sync::Arc;

use thiserror::Error;

/// Sub-field of a needle body that overran its buffer while decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeedleField {
    Data = 1,
    Name = 2,
    Mime = 3,
    LastModified = 4,
    Ttl = 5,
    PairsSize = 6,
    Pairs = 7,
}

impl NeedleField {
    /// Numeric tag used in diagnostics.
    pub fn index(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for NeedleField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NeedleField::Data => "data",
            NeedleField::Name => "name",
            NeedleField::Mime => "mime",
            NeedleField::LastModified => "last_modified",
            NeedleField::Ttl => "ttl",
            NeedleField::PairsSize => "pairs_size",
            NeedleField::Pairs => "pairs",
        };
        write!(f, "{name} (#{})", self.index())
    }
}

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    // Format errors.
    #[error("needle size mismatch: found {found}, expected {expected}")]
    SizeMismatch { found: i64, expected: i64 },

    #[error("needle field {field} out of range")]
    OutOfRange { field: NeedleField },

    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),

    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("{what} too large: {len} bytes (max {max})")]
    FieldTooLarge {
        what: &'static str,
        len: usize,
        max: usize,
    },

    #[error("superblock extra too large: {0} bytes")]
    ExtraTooLarge(usize),

    // Bounds errors.
    #[error("offset {offset} out of bounds for chunk of {len} bytes")]
    OutOfBounds { offset: u64, len: u64 },

    #[error("volume size {size} exceeds limit {limit}")]
    VolumeSizeExceeded { size: u64, limit: u64 },

    // Lookup errors.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("needle {0} is deleted")]
    Deleted(String),

    // Parse errors for textual forms.
    #[error("invalid replica placement: {0}")]
    InvalidReplicaPlacement(String),

    #[error("invalid ttl: {0}")]
    InvalidTtl(String),

    #[error("invalid file id: {0}")]
    InvalidFileId(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // Read path errors.
    #[error("chunk fetch failed: {0}")]
    Fetch(Arc<anyhow::Error>),

    #[error("operation cancelled")]
    Cancelled,

    // Backend errors are propagated unchanged.
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl StorageError {
    pub fn not_found(what: impl Into<String>) -> Self {
        StorageError::NotFound(what.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: StorageError = io.into();
        match err {
            StorageError::Io(inner) => {
                assert_eq!(inner.kind(), std::io::ErrorKind::PermissionDenied)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_out_of_range_mentions_field_index() {
        let err = StorageError::OutOfRange {
            field: NeedleField::Pairs,
        };
        assert!(err.to_string().contains("#7"));
    }
}
