//! Version-aware encoding and decoding of a single needle record.

use tracing::{error, warn};

use super::{Crc, MAX_MIME_SIZE, MAX_NAME_SIZE, MAX_PAIRS_SIZE, Needle, NeedleFlags};
use crate::error::{NeedleField, Result, StorageError};
use crate::stats;
use crate::storage::ttl::Ttl;
use crate::storage::types::{
    Cookie, DATA_SIZE_SIZE, LAST_MODIFIED_BYTES_LENGTH, NEEDLE_CHECKSUM_SIZE, NEEDLE_HEADER_SIZE,
    NEEDLE_ID_SIZE, NEEDLE_PADDING_SIZE, NeedleId, Size, TIMESTAMP_SIZE, TTL_BYTES_LENGTH,
    Version, COOKIE_SIZE,
};

fn tail_length(version: Version) -> usize {
    match version {
        Version::V3 => NEEDLE_CHECKSUM_SIZE + TIMESTAMP_SIZE,
        Version::V1 | Version::V2 => NEEDLE_CHECKSUM_SIZE,
    }
}

fn body_size(size: Size) -> usize {
    size.0.max(0) as usize
}

/// Bytes of padding after the tail. Always in `1..=8`: a record that already
/// ends on a boundary still gets a full 8 bytes.
pub fn padding_length(size: Size, version: Version) -> usize {
    NEEDLE_PADDING_SIZE
        - ((NEEDLE_HEADER_SIZE + body_size(size) + tail_length(version)) % NEEDLE_PADDING_SIZE)
}

/// Everything after the header: body, tail and padding.
pub fn body_length(size: Size, version: Version) -> usize {
    body_size(size) + tail_length(version) + padding_length(size, version)
}

/// Full on-disk footprint of a record with the given body size.
pub fn actual_size(size: Size, version: Version) -> usize {
    NEEDLE_HEADER_SIZE + body_length(size, version)
}

fn write_last_modified(out: &mut Vec<u8>, secs: u64) {
    let raw = secs.to_be_bytes();
    out.extend_from_slice(&raw[8 - LAST_MODIFIED_BYTES_LENGTH..]);
}

fn read_last_modified(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)
}

pub(crate) fn parse_header(bytes: &[u8]) -> Result<(Cookie, NeedleId, Size)> {
    if bytes.len() < NEEDLE_HEADER_SIZE {
        return Err(StorageError::SizeMismatch {
            found: bytes.len() as i64,
            expected: NEEDLE_HEADER_SIZE as i64,
        });
    }
    let cookie = Cookie::from_bytes(&bytes[0..COOKIE_SIZE]);
    let id = NeedleId::from_bytes(&bytes[COOKIE_SIZE..COOKIE_SIZE + NEEDLE_ID_SIZE]);
    let size = Size::from_bytes(&bytes[COOKIE_SIZE + NEEDLE_ID_SIZE..NEEDLE_HEADER_SIZE]);
    Ok((cookie, id, size))
}

fn out_of_range(field: NeedleField) -> StorageError {
    stats::record_out_of_range();
    StorageError::OutOfRange { field }
}

impl Needle {
    /// Serializes the needle for `version`, padding included.
    ///
    /// Recomputes `size` and `checksum` from the current fields, and cuts a
    /// name longer than 255 bytes. Version 1 only stores the data.
    pub fn encode(&mut self, version: Version) -> Result<Vec<u8>> {
        if self.mime.len() > MAX_MIME_SIZE {
            return Err(StorageError::FieldTooLarge {
                what: "mime",
                len: self.mime.len(),
                max: MAX_MIME_SIZE,
            });
        }
        if self.pairs.len() > MAX_PAIRS_SIZE {
            return Err(StorageError::FieldTooLarge {
                what: "pairs",
                len: self.pairs.len(),
                max: MAX_PAIRS_SIZE,
            });
        }
        if self.data.len() > i32::MAX as usize {
            return Err(StorageError::FieldTooLarge {
                what: "data",
                len: self.data.len(),
                max: i32::MAX as usize,
            });
        }
        self.name.truncate(MAX_NAME_SIZE);
        self.checksum = Crc::new(&self.data);

        let mut body = Vec::new();
        match version {
            Version::V1 => body.extend_from_slice(&self.data),
            Version::V2 | Version::V3 => {
                if !self.data.is_empty() {
                    self.encode_v2_body(&mut body);
                }
            }
        }
        if body.len() > i32::MAX as usize {
            return Err(StorageError::FieldTooLarge {
                what: "needle body",
                len: body.len(),
                max: i32::MAX as usize,
            });
        }
        self.size = Size(body.len() as i32);

        let mut out = Vec::with_capacity(actual_size(self.size, version));
        out.extend_from_slice(&self.cookie.to_bytes());
        out.extend_from_slice(&self.id.to_bytes());
        out.extend_from_slice(&self.size.to_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(&self.checksum.0.to_be_bytes());
        if version == Version::V3 {
            out.extend_from_slice(&self.append_at_ns.to_be_bytes());
        }
        out.resize(out.len() + padding_length(self.size, version), 0);
        Ok(out)
    }

    fn encode_v2_body(&self, body: &mut Vec<u8>) {
        body.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        body.extend_from_slice(&self.data);
        body.push(self.flags.bits());
        if self.has_name() {
            body.push(self.name.len() as u8);
            body.extend_from_slice(&self.name);
        }
        if self.has_mime() {
            body.push(self.mime.len() as u8);
            body.extend_from_slice(&self.mime);
        }
        if self.has_last_modified() {
            write_last_modified(body, self.last_modified);
        }
        if self.has_ttl() {
            body.extend_from_slice(&self.ttl.unwrap_or(Ttl::EMPTY).to_bytes());
        }
        if self.has_pairs() {
            body.extend_from_slice(&(self.pairs.len() as u16).to_be_bytes());
            body.extend_from_slice(&self.pairs);
        }
    }

    /// Decodes a record whose header is at the start of `bytes`, trusting the
    /// size found in the header.
    pub fn decode(bytes: &[u8], version: Version) -> Result<Needle> {
        let (_, _, size) = parse_header(bytes)?;
        Self::decode_checked(bytes, size, version)
    }

    /// Decodes a record read at `offset`, failing with `SizeMismatch` when the
    /// header disagrees with the size recorded in the index.
    pub fn read_bytes(bytes: &[u8], offset: u64, size: Size, version: Version) -> Result<Needle> {
        let (_, id, found) = parse_header(bytes)?;
        if found != size {
            stats::record_size_mismatch();
            error!(
                "entry not found: offset {} found id {} size {}, expected size {}",
                offset, id, found.0, size.0
            );
            return Err(StorageError::SizeMismatch {
                found: found.0 as i64,
                expected: size.0 as i64,
            });
        }
        Self::decode_checked(bytes, size, version)
    }

    fn decode_checked(bytes: &[u8], size: Size, version: Version) -> Result<Needle> {
        let (cookie, id, header_size) = parse_header(bytes)?;
        if header_size.is_deleted() {
            return Err(StorageError::Deleted(id.to_string()));
        }
        let needed = NEEDLE_HEADER_SIZE + body_size(size) + tail_length(version);
        if bytes.len() < needed {
            stats::record_size_mismatch();
            warn!(
                "needle {} truncated: have {} bytes, need {}",
                id,
                bytes.len(),
                needed
            );
            return Err(StorageError::SizeMismatch {
                found: bytes.len() as i64,
                expected: needed as i64,
            });
        }

        let mut n = Needle {
            cookie,
            id,
            size,
            ..Default::default()
        };
        let body_end = NEEDLE_HEADER_SIZE + body_size(size);
        n.read_body_bytes(&bytes[NEEDLE_HEADER_SIZE..body_end], version)?;
        n.read_tail(&bytes[body_end..], version)?;
        Ok(n)
    }

    /// Parses the body (without tail) into this needle.
    pub(crate) fn read_body_bytes(&mut self, body: &[u8], version: Version) -> Result<()> {
        match version {
            Version::V1 => {
                self.data = body.to_vec();
                Ok(())
            }
            Version::V2 | Version::V3 => {
                if body.is_empty() {
                    return Ok(());
                }
                self.read_v2_body(body)
            }
        }
    }

    fn read_v2_body(&mut self, bytes: &[u8]) -> Result<()> {
        let len = bytes.len();
        let mut index = 0;
        if index + DATA_SIZE_SIZE > len {
            return Err(out_of_range(NeedleField::Data));
        }
        let data_size = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        index += DATA_SIZE_SIZE;
        if index + data_size > len {
            return Err(out_of_range(NeedleField::Data));
        }
        self.data = bytes[index..index + data_size].to_vec();
        index += data_size;

        if index < len {
            self.flags = NeedleFlags::from_bits_retain(bytes[index]);
            index += 1;
        }
        if index < len && self.has_name() {
            let name_size = bytes[index] as usize;
            index += 1;
            if index + name_size > len {
                return Err(out_of_range(NeedleField::Name));
            }
            self.name = bytes[index..index + name_size].to_vec();
            index += name_size;
        }
        if index < len && self.has_mime() {
            let mime_size = bytes[index] as usize;
            index += 1;
            if index + mime_size > len {
                return Err(out_of_range(NeedleField::Mime));
            }
            self.mime = bytes[index..index + mime_size].to_vec();
            index += mime_size;
        }
        if index < len && self.has_last_modified() {
            if index + LAST_MODIFIED_BYTES_LENGTH > len {
                return Err(out_of_range(NeedleField::LastModified));
            }
            self.last_modified =
                read_last_modified(&bytes[index..index + LAST_MODIFIED_BYTES_LENGTH]);
            index += LAST_MODIFIED_BYTES_LENGTH;
        }
        if index < len && self.has_ttl() {
            if index + TTL_BYTES_LENGTH > len {
                return Err(out_of_range(NeedleField::Ttl));
            }
            self.ttl = Some(Ttl::from_bytes(&bytes[index..index + TTL_BYTES_LENGTH]));
            index += TTL_BYTES_LENGTH;
        }
        if index < len && self.has_pairs() {
            if index + 2 > len {
                return Err(out_of_range(NeedleField::PairsSize));
            }
            let pairs_size = u16::from_be_bytes([bytes[index], bytes[index + 1]]) as usize;
            index += 2;
            if index + pairs_size > len {
                return Err(out_of_range(NeedleField::Pairs));
            }
            self.pairs = bytes[index..index + pairs_size].to_vec();
        }
        Ok(())
    }

    /// Reads the checksum (and v3 timestamp), verifying the checksum against
    /// the data already decoded.
    pub(crate) fn read_tail(&mut self, tail: &[u8], version: Version) -> Result<()> {
        if tail.len() < tail_length(version) {
            return Err(StorageError::SizeMismatch {
                found: tail.len() as i64,
                expected: tail_length(version) as i64,
            });
        }
        let stored = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]);
        if !self.data.is_empty() {
            let computed = Crc::new(&self.data).0;
            if stored != computed {
                stats::record_checksum_mismatch();
                warn!(
                    "needle {} checksum mismatch: stored {:#010x} computed {:#010x}",
                    self.id, stored, computed
                );
                return Err(StorageError::ChecksumMismatch { stored, computed });
            }
        }
        self.checksum = Crc(stored);
        if version == Version::V3 {
            let mut ts = [0u8; TIMESTAMP_SIZE];
            ts.copy_from_slice(&tail[NEEDLE_CHECKSUM_SIZE..NEEDLE_CHECKSUM_SIZE + TIMESTAMP_SIZE]);
            self.append_at_ns = u64::from_be_bytes(ts);
        }
        Ok(())
    }

    /// On-disk footprint of this needle for `version`.
    pub fn disk_size(&self, version: Version) -> usize {
        actual_size(self.size, version)
    }
}
