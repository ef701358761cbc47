//! Reading needles from and appending them to a backend file.
//!
//! Appends are not serialized here: callers writing to the same volume
//! concurrently must hold their own lock around [`Needle::append`] and
//! [`write_needle_blob`].

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{error, warn};

use super::Needle;
use super::codec::{actual_size, body_length, parse_header};
use crate::error::{Result, StorageError};
use crate::storage::backend::BackendStorageFile;
use crate::storage::types::{
    MAX_POSSIBLE_VOLUME_SIZE, NEEDLE_CHECKSUM_SIZE, NEEDLE_HEADER_SIZE, Size, TIMESTAMP_SIZE,
    Version,
};

/// Where an appended record landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    pub offset: u64,
    pub size: Size,
    pub actual_size: u64,
}

/// `max(now, last + 1)` in nanoseconds.
pub fn get_append_at_ns(last_append_at_ns: u64) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    now.max(last_append_at_ns.saturating_add(1))
}

/// Reads the raw record (header, body, tail and padding) at `offset`.
pub async fn read_needle_blob(
    file: &dyn BackendStorageFile,
    offset: u64,
    size: Size,
    version: Version,
) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; actual_size(size, version)];
    if let Err(e) = file.read_exact_at(&mut buf, offset).await {
        let file_size = file.stat().await.map(|(s, _)| s).unwrap_or_default();
        error!(
            "{} read {} bytes at offset {} (file size {}): {}",
            file.name(),
            buf.len(),
            offset,
            file_size,
            e
        );
        return Err(e);
    }
    Ok(buf)
}

/// Reads only the header at `offset`, returning the partially filled needle
/// and the length of what follows it.
pub async fn read_needle_header(
    file: &dyn BackendStorageFile,
    version: Version,
    offset: u64,
) -> Result<(Needle, usize)> {
    let mut header = [0u8; NEEDLE_HEADER_SIZE];
    file.read_exact_at(&mut header, offset).await?;
    let (cookie, id, size) = parse_header(&header)?;
    let n = Needle {
        cookie,
        id,
        size,
        ..Default::default()
    };
    Ok((n, body_length(size, version)))
}

pub(crate) async fn truncate_back(file: &dyn BackendStorageFile, end: u64) {
    if let Err(te) = file.truncate(end).await {
        error!("failed to truncate {} back to {}: {}", file.name(), end, te);
    }
}

impl Needle {
    /// Reads and decodes the needle at `offset`, checking the header against
    /// `size` from the index.
    pub async fn read_data(
        file: &dyn BackendStorageFile,
        offset: u64,
        size: Size,
        version: Version,
    ) -> Result<Needle> {
        let bytes = read_needle_blob(file, offset, size, version).await?;
        Needle::read_bytes(&bytes, offset, size, version)
    }

    /// Reads `body_length` bytes after a header read by [`read_needle_header`]
    /// and fills in the body and tail. Returns the raw bytes read.
    pub async fn read_needle_body(
        &mut self,
        file: &dyn BackendStorageFile,
        version: Version,
        offset: u64,
        body_length: usize,
    ) -> Result<Vec<u8>> {
        if body_length == 0 {
            return Ok(Vec::new());
        }
        let mut bytes = vec![0u8; body_length];
        file.read_exact_at(&mut bytes, offset).await?;
        let size = self.size.0.max(0) as usize;
        if size > bytes.len() {
            return Err(StorageError::SizeMismatch {
                found: bytes.len() as i64,
                expected: size as i64,
            });
        }
        self.read_body_bytes(&bytes[..size], version)?;
        self.read_tail(&bytes[size..], version)?;
        Ok(bytes)
    }

    /// Appends the encoded needle at the current end of `file`.
    ///
    /// On any failure the file is truncated back to its previous length, so a
    /// partial record is never visible to readers.
    pub async fn append(
        &mut self,
        file: &dyn BackendStorageFile,
        version: Version,
    ) -> Result<AppendResult> {
        let (end, _) = file.stat().await?;
        if end >= MAX_POSSIBLE_VOLUME_SIZE && !self.data.is_empty() {
            return Err(StorageError::VolumeSizeExceeded {
                size: end,
                limit: MAX_POSSIBLE_VOLUME_SIZE,
            });
        }

        let result = async {
            let bytes = self.encode(version)?;
            file.write_at(&bytes, end).await.inspect_err(|e| {
                warn!(
                    "failed to write {} bytes to {} at offset {}: {}",
                    bytes.len(),
                    file.name(),
                    end,
                    e
                )
            })?;
            Ok::<_, StorageError>(AppendResult {
                offset: end,
                size: self.size,
                actual_size: bytes.len() as u64,
            })
        }
        .await;

        if result.is_err() {
            truncate_back(file, end).await;
        }
        result
    }
}

/// Appends an already encoded record, stamping `append_at_ns` into the v3
/// tail first. Returns the offset written at.
pub async fn write_needle_blob(
    file: &dyn BackendStorageFile,
    blob: &mut [u8],
    size: Size,
    append_at_ns: u64,
    version: Version,
) -> Result<u64> {
    let (end, _) = file.stat().await?;

    if version == Version::V3 {
        let ts_offset = NEEDLE_HEADER_SIZE + size.0.max(0) as usize + NEEDLE_CHECKSUM_SIZE;
        if blob.len() < ts_offset + TIMESTAMP_SIZE {
            return Err(StorageError::SizeMismatch {
                found: blob.len() as i64,
                expected: (ts_offset + TIMESTAMP_SIZE) as i64,
            });
        }
        blob[ts_offset..ts_offset + TIMESTAMP_SIZE].copy_from_slice(&append_at_ns.to_be_bytes());
    }

    match file.write_at(blob, end).await {
        Ok(_) => Ok(end),
        Err(e) => {
            truncate_back(file, end).await;
            Err(e)
        }
    }
}
