/// CRC32-Castagnoli over needle data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Crc(pub u32);

impl Crc {
    pub fn new(data: &[u8]) -> Self {
        Crc(0).update(data)
    }

    pub fn update(self, data: &[u8]) -> Self {
        Crc(crc32c::crc32c_append(self.0, data))
    }

    /// Mangled form written by very old volumes. Compare against the raw
    /// value for anything new.
    #[deprecated(note = "compare the raw checksum instead")]
    pub fn value(self) -> u32 {
        (self.0 >> 15 | self.0 << 17).wrapping_add(0xa282_ead8)
    }

    /// Hex of the big-endian checksum, used as an HTTP etag.
    pub fn etag(self) -> String {
        hex::encode(self.0.to_be_bytes())
    }
}
