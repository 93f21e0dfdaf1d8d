//! Range-checked wire values
//!
//! Every narrow integer that appears on the wire has a newtype here. Values
//! arriving from wider integer types go through `TryFrom<i64>`, so an
//! out-of-range station id or sequence id is rejected before a record holding
//! it can exist.

use std::fmt;
use thiserror::Error;

/// Validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} out of range: {value} (allowed {min}..={max})")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("Invalid code {0:?}: expected 1 to 5 printable ASCII characters")]
    InvalidCode(String),
}

fn out_of_range(field: &'static str, value: i64, min: i64, max: i64) -> ValidationError {
    ValidationError::OutOfRange {
        field,
        value,
        min,
        max,
    }
}

macro_rules! wire_int {
    ($(#[$meta:meta])* $name:ident($inner:ty), $field:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name($inner);

        impl $name {
            pub const MIN: Self = Self(<$inner>::MIN);
            pub const MAX: Self = Self(<$inner>::MAX);

            pub const fn new(value: $inner) -> Self {
                Self(value)
            }

            pub const fn get(self) -> $inner {
                self.0
            }
        }

        impl TryFrom<i64> for $name {
            type Error = ValidationError;

            fn try_from(value: i64) -> Result<Self, Self::Error> {
                <$inner>::try_from(value).map(Self).map_err(|_| {
                    out_of_range($field, value, <$inner>::MIN as i64, <$inner>::MAX as i64)
                })
            }
        }

        impl From<$name> for $inner {
            fn from(value: $name) -> $inner {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

wire_int!(
    /// Record type tag (0-255)
    RecordType(u8),
    "record_type"
);

wire_int!(
    /// Session-scoped station id (0-255)
    StationId(u8),
    "station_id"
);

wire_int!(
    /// Live record instance id (0-65535)
    SequenceId(u16),
    "sequence_id"
);

wire_int!(
    /// Count of live records lost or reordered recently (0-255)
    LostLiveCount(u8),
    "lost_live_records"
);

impl SequenceId {
    /// Next id, wrapping from 65535 back to 0
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl LostLiveCount {
    /// Saturating conversion from a running tally
    pub fn saturating(value: i64) -> Self {
        Self(value.clamp(0, u8::MAX as i64) as u8)
    }
}

/// Field identifier, 0-31
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldId(u8);

impl FieldId {
    pub const MAX: u8 = 31;

    /// Live delta marker: the sequence id of the base live record
    pub const LIVE_DIFF: Self = Self(0);

    /// Delta marker: the timestamp of the base sample
    pub const SAMPLE_DIFF: Self = Self(1);

    pub fn new(id: u8) -> Result<Self, ValidationError> {
        if id > Self::MAX {
            return Err(out_of_range("field_id", id as i64, 0, Self::MAX as i64));
        }
        Ok(Self(id))
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    /// Id of a set bit, always within 0-31
    pub(crate) const fn from_bit_index(index: u8) -> Self {
        Self(index & Self::MAX)
    }

    pub(crate) const fn bit(self) -> u32 {
        1u32 << self.0
    }
}

impl TryFrom<i64> for FieldId {
    type Error = ValidationError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u8::try_from(value)
            .map_err(|_| out_of_range("field_id", value, 0, Self::MAX as i64))
            .and_then(Self::new)
    }
}

/// Width of station, image type and image source codes on the wire
pub const CODE_LENGTH: usize = 5;

/// Short ASCII code naming a station, image type or image source
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Code(String);

impl Code {
    pub fn new(code: impl Into<String>) -> Result<Self, ValidationError> {
        let code = code.into();
        if code.is_empty() || code.len() > CODE_LENGTH || !code.chars().all(|c| c.is_ascii_graphic())
        {
            return Err(ValidationError::InvalidCode(code));
        }
        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// NUL-padded wire form
    pub fn to_wire(&self) -> [u8; CODE_LENGTH] {
        let mut out = [0u8; CODE_LENGTH];
        out[..self.0.len()].copy_from_slice(self.0.as_bytes());
        out
    }

    pub fn from_wire(raw: &[u8; CODE_LENGTH]) -> Result<Self, ValidationError> {
        let end = raw.iter().position(|b| *b == 0).unwrap_or(CODE_LENGTH);
        let text = String::from_utf8_lossy(&raw[..end]).trim_end().to_string();
        Self::new(text)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for Code {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundaries_accepted() {
        assert_eq!(RecordType::try_from(0i64).unwrap().get(), 0);
        assert_eq!(RecordType::try_from(255i64).unwrap().get(), 255);
        assert_eq!(StationId::try_from(255i64).unwrap().get(), 255);
        assert_eq!(SequenceId::try_from(65535i64).unwrap().get(), 65535);
        assert_eq!(SequenceId::try_from(0i64).unwrap().get(), 0);
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(matches!(
            RecordType::try_from(256i64),
            Err(ValidationError::OutOfRange { field: "record_type", .. })
        ));
        assert!(matches!(
            StationId::try_from(256i64),
            Err(ValidationError::OutOfRange { field: "station_id", .. })
        ));
        assert!(matches!(
            SequenceId::try_from(65536i64),
            Err(ValidationError::OutOfRange { field: "sequence_id", .. })
        ));
    }

    #[test]
    fn test_negative_rejected() {
        assert!(RecordType::try_from(-1i64).is_err());
        assert!(StationId::try_from(-1i64).is_err());
        assert!(SequenceId::try_from(-1i64).is_err());
        assert!(FieldId::try_from(-1i64).is_err());
    }

    #[test]
    fn test_field_id_range() {
        assert!(FieldId::new(31).is_ok());
        assert!(FieldId::new(32).is_err());
    }

    #[test]
    fn test_sequence_wraps() {
        assert_eq!(SequenceId::MAX.next(), SequenceId::new(0));
    }

    #[test]
    fn test_lost_live_saturates() {
        assert_eq!(LostLiveCount::saturating(1000).get(), 255);
        assert_eq!(LostLiveCount::saturating(-4).get(), 0);
    }

    #[test]
    fn test_code_wire_form() {
        let code = Code::new("rua").unwrap();
        let wire = code.to_wire();
        assert_eq!(&wire, b"rua\0\0");
        assert_eq!(Code::from_wire(&wire).unwrap(), code);

        assert!(Code::new("toolong").is_err());
        assert!(Code::new("").is_err());
    }
}
