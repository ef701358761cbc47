use std::fmt;
use std::str::FromStr;

use crate::error::{Result, StorageError};

/// Extra copies kept on the same rack, on other racks and in other data
/// centers. Stored as the decimal `dc*100 + rack*10 + same_rack` in one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ReplicaPlacement {
    pub same_rack_count: u8,
    pub diff_rack_count: u8,
    pub diff_data_center_count: u8,
}

impl ReplicaPlacement {
    pub fn new(
        diff_data_center_count: u8,
        diff_rack_count: u8,
        same_rack_count: u8,
    ) -> Result<Self> {
        let rp = Self {
            same_rack_count,
            diff_rack_count,
            diff_data_center_count,
        };
        rp.validate()?;
        Ok(rp)
    }

    fn validate(&self) -> Result<()> {
        let digits = [
            self.diff_data_center_count,
            self.diff_rack_count,
            self.same_rack_count,
        ];
        if digits.iter().any(|d| *d > 9) {
            return Err(StorageError::InvalidReplicaPlacement(format!("{digits:?}")));
        }
        let value = self.value();
        if value > u8::MAX as u32 {
            return Err(StorageError::InvalidReplicaPlacement(format!(
                "{value} does not fit in a byte"
            )));
        }
        Ok(())
    }

    fn value(&self) -> u32 {
        self.diff_data_center_count as u32 * 100
            + self.diff_rack_count as u32 * 10
            + self.same_rack_count as u32
    }

    pub fn from_byte(b: u8) -> Result<Self> {
        format!("{b:03}").parse()
    }

    pub fn to_byte(&self) -> u8 {
        self.value() as u8
    }

    pub fn has_replication(&self) -> bool {
        self.diff_data_center_count != 0 || self.diff_rack_count != 0 || self.same_rack_count != 0
    }

    pub fn copy_count(&self) -> usize {
        self.diff_data_center_count as usize
            + self.diff_rack_count as usize
            + self.same_rack_count as usize
            + 1
    }
}

impl FromStr for ReplicaPlacement {
    type Err = StorageError;

    /// Accepts up to three digits, left padded with zeros: `"1"` is `"001"`.
    fn from_str(s: &str) -> Result<Self> {
        if s.len() > 3 {
            return Err(StorageError::InvalidReplicaPlacement(s.to_string()));
        }
        let padded = format!("{s:0>3}");
        let mut digits = [0u8; 3];
        for (i, c) in padded.chars().enumerate() {
            let d = c
                .to_digit(10)
                .ok_or_else(|| StorageError::InvalidReplicaPlacement(s.to_string()))?;
            digits[i] = d as u8;
        }
        Self::new(digits[0], digits[1], digits[2])
    }
}

impl fmt::Display for ReplicaPlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.diff_data_center_count, self.diff_rack_count, self.same_rack_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_byte() {
        let rp: ReplicaPlacement = "012".parse().unwrap();
        assert_eq!(rp.diff_data_center_count, 0);
        assert_eq!(rp.diff_rack_count, 1);
        assert_eq!(rp.same_rack_count, 2);
        assert_eq!(rp.to_byte(), 12);
        assert_eq!(rp.copy_count(), 4);
        assert!(rp.has_replication());
        assert_eq!(ReplicaPlacement::from_byte(12).unwrap(), rp);
        assert_eq!(rp.to_string(), "012");
    }

    #[test]
    fn test_short_strings_are_padded() {
        let rp: ReplicaPlacement = "1".parse().unwrap();
        assert_eq!(rp.same_rack_count, 1);
        let rp: ReplicaPlacement = "".parse().unwrap();
        assert!(!rp.has_replication());
        assert_eq!(rp.copy_count(), 1);
    }

    #[test]
    fn test_invalid() {
        assert!("3x0".parse::<ReplicaPlacement>().is_err());
        assert!("0000".parse::<ReplicaPlacement>().is_err());
        assert!("300".parse::<ReplicaPlacement>().is_err());
        assert!(ReplicaPlacement::new(0, 10, 0).is_err());
    }

    #[test]
    fn test_every_valid_byte_round_trips() {
        for b in 0..=255u8 {
            let rp = ReplicaPlacement::from_byte(b).unwrap();
            assert_eq!(rp.to_byte(), b);
        }
    }
}
