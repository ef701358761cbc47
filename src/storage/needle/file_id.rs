use std::fmt;
use std::str::FromStr;

use crate::error::{Result, StorageError};
use crate::storage::types::{COOKIE_SIZE, Cookie, NEEDLE_ID_SIZE, NeedleId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VolumeId(pub u32);

impl FromStr for VolumeId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<u32>()
            .map(VolumeId)
            .map_err(|e| StorageError::InvalidFileId(format!("volume id {s}: {e}")))
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Public handle of a stored needle: `"<volume>,<key><cookie>"`, key and
/// cookie in hex with the key's leading zero bytes dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
    pub volume_id: VolumeId,
    pub key: NeedleId,
    pub cookie: Cookie,
}

impl FileId {
    pub fn new(volume_id: VolumeId, key: NeedleId, cookie: Cookie) -> Self {
        Self {
            volume_id,
            key,
            cookie,
        }
    }

    /// The part after the comma.
    pub fn needle_id_cookie(&self) -> String {
        format_needle_id_cookie(self.key, self.cookie)
    }
}

fn format_needle_id_cookie(key: NeedleId, cookie: Cookie) -> String {
    let mut bytes = [0u8; NEEDLE_ID_SIZE + COOKIE_SIZE];
    bytes[..NEEDLE_ID_SIZE].copy_from_slice(&key.to_bytes());
    bytes[NEEDLE_ID_SIZE..].copy_from_slice(&cookie.to_bytes());
    let first_nonzero = bytes[..NEEDLE_ID_SIZE]
        .iter()
        .position(|b| *b != 0)
        .unwrap_or(NEEDLE_ID_SIZE);
    hex::encode(&bytes[first_nonzero..])
}

/// Splits `<key><cookie>[_<delta>]`; the last eight hex digits are the cookie
/// and a decimal delta is added to the key.
pub fn parse_needle_id_cookie(s: &str) -> Result<(NeedleId, Cookie)> {
    let (key_cookie, delta) = match s.rfind('_') {
        Some(i) if i > 0 => (&s[..i], Some(&s[i + 1..])),
        _ => (s, None),
    };
    if key_cookie.len() <= COOKIE_SIZE * 2 {
        return Err(StorageError::InvalidFileId(format!("{s}: key hash too short")));
    }
    if key_cookie.len() > (NEEDLE_ID_SIZE + COOKIE_SIZE) * 2 {
        return Err(StorageError::InvalidFileId(format!("{s}: key hash too long")));
    }
    if !key_cookie.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(StorageError::InvalidFileId(format!("{s}: key hash is not hex")));
    }
    let split = key_cookie.len() - COOKIE_SIZE * 2;
    let key = NeedleId::parse(&key_cookie[..split])?;
    let cookie = Cookie::parse(&key_cookie[split..])?;
    let key = match delta {
        Some(d) => {
            let d: u64 = d
                .parse()
                .map_err(|e| StorageError::InvalidFileId(format!("{s}: delta: {e}")))?;
            NeedleId(key.0.wrapping_add(d))
        }
        None => key,
    };
    Ok((key, cookie))
}

impl FromStr for FileId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        let Some((vid, rest)) = s.split_once(',') else {
            return Err(StorageError::InvalidFileId(format!("{s}: missing comma")));
        };
        if vid.is_empty() {
            return Err(StorageError::InvalidFileId(format!("{s}: missing volume")));
        }
        // an optional extension after the key is ignored
        let rest = rest.split('.').next().unwrap_or(rest);
        let volume_id = vid.parse()?;
        let (key, cookie) = parse_needle_id_cookie(rest)?;
        Ok(FileId::new(volume_id, key, cookie))
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.volume_id, self.needle_id_cookie())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_drops_leading_zero_bytes() {
        let fid = FileId::new(VolumeId(3), NeedleId(0x01637037), Cookie(0xd6a1b2c3));
        assert_eq!(fid.to_string(), "3,01637037d6a1b2c3");
        assert_eq!(fid.to_string().parse::<FileId>().unwrap(), fid);
    }

    #[test]
    fn test_parse_delta_and_extension() {
        let fid: FileId = "7,0a0000000b_5".parse().unwrap();
        assert_eq!(fid.key, NeedleId(0x0a + 5));
        assert_eq!(fid.cookie, Cookie(0x0b));

        let fid: FileId = "7,0a0000000b.jpg".parse().unwrap();
        assert_eq!(fid.key, NeedleId(0x0a));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("7".parse::<FileId>().is_err());
        assert!(",0a0000000b".parse::<FileId>().is_err());
        assert!("7,0000000b".parse::<FileId>().is_err());
        assert!("7,1122334455667788990011223".parse::<FileId>().is_err());
        assert!("x,0a0000000b".parse::<FileId>().is_err());
        assert!("7,zz0000000b".parse::<FileId>().is_err());
    }

    #[test]
    fn test_parse_rejects_multibyte_chars() {
        let cases = [
            "1,a\u{e9}1234567",
            "1,\u{e9}\u{e9}\u{e9}\u{e9}\u{e9}",
            "2,0a0000000\u{1f600}_1",
        ];
        for bad in cases {
            let err = bad.parse::<FileId>().unwrap_err();
            assert!(matches!(err, StorageError::InvalidFileId(_)), "{bad}: {err}");
        }
    }
}
