use rust_decimal::{prelude::FromPrimitive, Decimal};
use serde::Serialize;

/// SunSpec point types. Each Modbus register holds 16 bits; multi-register values are big-endian.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PointType {
    Int16,
    Int32,
    Int64,
    Uint16,
    Uint32,
    Uint64,
    Acc16,
    Acc32,
    Acc64,
    Enum16,
    Enum32,
    Bitfield16,
    Bitfield32,
    Sunssf,
    Float32,
    Count,
    Pad,
    String(u16),
}

/// SunSpec only defines scale factors in this range.
const SCALE_FACTOR_RANGE: std::ops::RangeInclusive<i16> = -10..=10;

impl PointType {
    /// Number of registers occupied by the point.
    pub fn size(&self) -> u16 {
        use PointType::*;
        match self {
            Int16 | Uint16 | Acc16 | Enum16 | Bitfield16 | Sunssf | Count | Pad => 1,
            Int32 | Uint32 | Acc32 | Enum32 | Bitfield32 | Float32 => 2,
            Int64 | Uint64 | Acc64 => 4,
            String(length) => *length,
        }
    }

    /// Decode the registers of a single point.
    ///
    /// Returns `None` for the "not implemented" sentinel of the type, for out of range scale factors, and for the
    /// types that never carry a numeric reading (strings and padding).
    pub fn parse_words(&self, words: &[u16]) -> Option<Decimal> {
        use PointType::*;

        if words.len() != usize::from(self.size()) {
            return None;
        }
        let wide = words
            .iter()
            .fold(0u64, |acc, word| (acc << 16) | u64::from(*word));

        match *self {
            Int16 => {
                let value = words[0] as i16;
                (value != i16::MIN).then(|| Decimal::from(value))
            }
            Sunssf => {
                let value = words[0] as i16;
                SCALE_FACTOR_RANGE
                    .contains(&value)
                    .then(|| Decimal::from(value))
            }
            Uint16 | Enum16 | Bitfield16 => (words[0] != u16::MAX).then(|| Decimal::from(words[0])),
            Acc16 => (words[0] != 0).then(|| Decimal::from(words[0])),
            Count => Some(Decimal::from(words[0])),
            Int32 => {
                let value = wide as u32 as i32;
                (value != i32::MIN).then(|| Decimal::from(value))
            }
            Uint32 | Enum32 | Bitfield32 => {
                let value = wide as u32;
                (value != u32::MAX).then(|| Decimal::from(value))
            }
            Acc32 | Acc64 => (wide != 0).then(|| Decimal::from(wide)),
            Int64 => {
                let value = wide as i64;
                (value != i64::MIN).then(|| Decimal::from(value))
            }
            Uint64 => (wide != u64::MAX).then(|| Decimal::from(wide)),
            Float32 => {
                let value = f32::from_bits(wide as u32);
                if value.is_nan() {
                    None
                } else {
                    Decimal::from_f32(value)
                }
            }
            Pad | String(_) => None,
        }
    }
}

/// A named point at a fixed position inside a SunSpec model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Point {
    pub name: &'static str,
    pub kind: PointType,

    /// Name of the `sunssf` point in the same model that scales this one
    pub scale_factor: Option<&'static str>,
}

impl Point {
    pub const fn new(name: &'static str, kind: PointType) -> Self {
        Point {
            name,
            kind,
            scale_factor: None,
        }
    }

    pub const fn scaled(name: &'static str, kind: PointType, scale_factor: &'static str) -> Self {
        Point {
            name,
            kind,
            scale_factor: Some(scale_factor),
        }
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn sizes() {
    assert_eq!(PointType::Int16.size(), 1);
    assert_eq!(PointType::Bitfield32.size(), 2);
    assert_eq!(PointType::Acc64.size(), 4);
    assert_eq!(PointType::String(16).size(), 16);
}

#[test]
fn parse_signed_values() {
    assert_eq!(PointType::Int16.parse_words(&[0xFFFE]), Some(Decimal::from(-2)));
    assert_eq!(
        PointType::Int32.parse_words(&[0xFFFF, 0xFFFF]),
        Some(Decimal::from(-1))
    );
    assert_eq!(
        PointType::Int64.parse_words(&[0, 0, 0x0001, 0x0000]),
        Some(Decimal::from(65536))
    );
}

#[test]
fn parse_unsigned_values_big_endian() {
    assert_eq!(PointType::Uint16.parse_words(&[1500]), Some(Decimal::from(1500)));
    assert_eq!(
        PointType::Uint32.parse_words(&[0x0001, 0x86A0]),
        Some(Decimal::from(100_000))
    );
    assert_eq!(
        PointType::Acc64.parse_words(&[0, 0, 0x0012, 0xD687]),
        Some(Decimal::from(1_234_567))
    );
}

#[test]
fn not_implemented_sentinels_are_dropped() {
    assert_eq!(PointType::Int16.parse_words(&[0x8000]), None);
    assert_eq!(PointType::Uint16.parse_words(&[0xFFFF]), None);
    assert_eq!(PointType::Enum16.parse_words(&[0xFFFF]), None);
    assert_eq!(PointType::Acc32.parse_words(&[0, 0]), None);
    assert_eq!(PointType::Int32.parse_words(&[0x8000, 0]), None);
    assert_eq!(PointType::Bitfield32.parse_words(&[0xFFFF, 0xFFFF]), None);
    assert_eq!(PointType::Uint64.parse_words(&[0xFFFF; 4]), None);
    assert_eq!(PointType::Sunssf.parse_words(&[0x8000]), None);
    assert_eq!(PointType::Float32.parse_words(&[0x7FC0, 0x0000]), None);
}

#[test]
fn scale_factors_outside_the_sunspec_range_are_dropped() {
    assert_eq!(PointType::Sunssf.parse_words(&[(-2i16) as u16]), Some(Decimal::from(-2)));
    assert_eq!(PointType::Sunssf.parse_words(&[11]), None);
}

#[test]
fn strings_and_padding_are_not_readings() {
    assert_eq!(PointType::String(2).parse_words(&[0x4142, 0x4300]), None);
    assert_eq!(PointType::Pad.parse_words(&[0]), None);
}

#[test]
fn wrong_word_count_is_rejected() {
    assert_eq!(PointType::Uint32.parse_words(&[1]), None);
}

#[test]
fn parse_float() {
    assert_eq!(
        PointType::Float32.parse_words(&[0x4049, 0x0000]),
        Some(Decimal::new(3140625, 6))
    );
}
