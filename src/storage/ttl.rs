//! Time-to-live carried by needles and volume superblocks: one count byte and
//! one unit byte.

use std::fmt;

use crate::error::{Result, StorageError};
use crate::storage::types::TTL_BYTES_LENGTH;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TtlUnit {
    #[default]
    Empty = 0,
    Minute = 1,
    Hour = 2,
    Day = 3,
    Week = 4,
    Month = 5,
    Year = 6,
}

impl TtlUnit {
    fn from_byte(b: u8) -> TtlUnit {
        match b {
            1 => TtlUnit::Minute,
            2 => TtlUnit::Hour,
            3 => TtlUnit::Day,
            4 => TtlUnit::Week,
            5 => TtlUnit::Month,
            6 => TtlUnit::Year,
            _ => TtlUnit::Empty,
        }
    }

    fn from_symbol(c: char) -> Option<TtlUnit> {
        match c {
            'm' => Some(TtlUnit::Minute),
            'h' => Some(TtlUnit::Hour),
            'd' => Some(TtlUnit::Day),
            'w' => Some(TtlUnit::Week),
            'M' => Some(TtlUnit::Month),
            'y' => Some(TtlUnit::Year),
            _ => None,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            TtlUnit::Empty => "",
            TtlUnit::Minute => "m",
            TtlUnit::Hour => "h",
            TtlUnit::Day => "d",
            TtlUnit::Week => "w",
            TtlUnit::Month => "M",
            TtlUnit::Year => "y",
        }
    }

    fn minutes(self) -> u32 {
        match self {
            TtlUnit::Empty => 0,
            TtlUnit::Minute => 1,
            TtlUnit::Hour => 60,
            TtlUnit::Day => 60 * 24,
            TtlUnit::Week => 60 * 24 * 7,
            TtlUnit::Month => 60 * 24 * 30,
            TtlUnit::Year => 60 * 24 * 365,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ttl {
    pub count: u8,
    pub unit: TtlUnit,
}

impl Ttl {
    pub const EMPTY: Ttl = Ttl {
        count: 0,
        unit: TtlUnit::Empty,
    };

    /// Parses forms like `3d` or `12h`. A bare number is minutes, and an
    /// empty string is no TTL at all.
    pub fn parse(s: &str) -> Result<Ttl> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Ttl::EMPTY);
        }
        let Some(last) = s.chars().last() else {
            return Ok(Ttl::EMPTY);
        };
        let (digits, unit) = if last.is_ascii_digit() {
            (s, TtlUnit::Minute)
        } else {
            let unit = TtlUnit::from_symbol(last)
                .ok_or_else(|| StorageError::InvalidTtl(s.to_string()))?;
            (&s[..s.len() - last.len_utf8()], unit)
        };
        let count: u32 = digits
            .parse()
            .map_err(|_| StorageError::InvalidTtl(s.to_string()))?;
        Ok(fit_ttl_count(count, unit))
    }

    pub fn from_bytes(bytes: &[u8]) -> Ttl {
        if bytes.len() < TTL_BYTES_LENGTH || (bytes[0] == 0 && bytes[1] == 0) {
            return Ttl::EMPTY;
        }
        Ttl {
            count: bytes[0],
            unit: TtlUnit::from_byte(bytes[1]),
        }
    }

    pub fn to_bytes(self) -> [u8; TTL_BYTES_LENGTH] {
        [self.count, self.unit as u8]
    }

    pub fn from_u32(v: u32) -> Ttl {
        Ttl::from_bytes(&[(v >> 8) as u8, v as u8])
    }

    pub fn to_u32(self) -> u32 {
        if self.count == 0 {
            return 0;
        }
        ((self.count as u32) << 8) | self.unit as u32
    }

    pub fn is_empty(self) -> bool {
        self.count == 0 || self.unit == TtlUnit::Empty
    }

    pub fn minutes(self) -> u32 {
        self.count as u32 * self.unit.minutes()
    }
}

/// Moves to a coarser unit until `count` fits in a byte, as long as the
/// conversion is exact. Counts that never fit are clamped.
fn fit_ttl_count(count: u32, unit: TtlUnit) -> Ttl {
    if count == 0 || unit == TtlUnit::Empty {
        return Ttl::EMPTY;
    }
    let total_minutes = count as u64 * unit.minutes() as u64;
    if count <= u8::MAX as u32 {
        return Ttl {
            count: count as u8,
            unit,
        };
    }
    for candidate in [
        TtlUnit::Hour,
        TtlUnit::Day,
        TtlUnit::Week,
        TtlUnit::Month,
        TtlUnit::Year,
    ] {
        if candidate <= unit {
            continue;
        }
        let m = candidate.minutes() as u64;
        if total_minutes % m == 0 && total_minutes / m <= u8::MAX as u64 {
            return Ttl {
                count: (total_minutes / m) as u8,
                unit: candidate,
            };
        }
    }
    let years = total_minutes.div_ceil(TtlUnit::Year.minutes() as u64);
    Ttl {
        count: years.min(u8::MAX as u64) as u8,
        unit: TtlUnit::Year,
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        write!(f, "{}{}", self.count, self.unit.symbol())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let ttl = Ttl::parse("3d").unwrap();
        assert_eq!(ttl.count, 3);
        assert_eq!(ttl.unit, TtlUnit::Day);
        assert_eq!(ttl.to_string(), "3d");
        assert_eq!(ttl.minutes(), 3 * 24 * 60);

        assert_eq!(Ttl::parse("15").unwrap().unit, TtlUnit::Minute);
        assert_eq!(Ttl::parse("").unwrap(), Ttl::EMPTY);
        assert!(Ttl::parse("3x").is_err());
        assert!(Ttl::parse("d").is_err());
    }

    #[test]
    fn test_large_count_moves_to_coarser_unit() {
        let ttl = Ttl::parse("300m").unwrap();
        assert_eq!(ttl, Ttl { count: 5, unit: TtlUnit::Hour });

        let ttl = Ttl::parse("720h").unwrap();
        assert_eq!(ttl, Ttl { count: 30, unit: TtlUnit::Day });
    }

    #[test]
    fn test_bytes() {
        let ttl = Ttl::parse("2w").unwrap();
        assert_eq!(ttl.to_bytes(), [2, 4]);
        assert_eq!(Ttl::from_bytes(&ttl.to_bytes()), ttl);
        assert_eq!(Ttl::from_bytes(&[0, 0]), Ttl::EMPTY);
        assert_eq!(Ttl::from_u32(ttl.to_u32()), ttl);
        assert_eq!(Ttl::EMPTY.to_u32(), 0);
    }
}
