//! Turns raw register readings into published metrics.

use rust_decimal::{prelude::ToPrimitive, Decimal, MathematicalOps};

use crate::modbus::{register::PointType, sunspec};
use crate::readings::{self, RawReading, RawReadings, Readings};
use crate::Error;

/// Points that are never published.
pub const EXCLUDED_POINTS: &[&str] = &["ID", "MnAlrmInfo"];

/// Apply scale factors and rename readings to their published metric names.
///
/// Fails when a reading refers to a scale factor that is not part of `raw`.
pub fn map(raw: &RawReadings) -> crate::Result<Readings> {
    let mut readings = Readings::new();

    for reading in raw.values() {
        if reading.kind == PointType::Sunssf || EXCLUDED_POINTS.contains(&reading.point) {
            continue;
        }
        let Some(model) = sunspec::lookup(reading.model) else {
            continue;
        };

        let value = match reading.scale_factor {
            None => reading.value,
            Some(scale_factor) => scale(raw, reading, scale_factor)?,
        };

        readings.insert(
            readings::key(model.name, reading.instance, reading.point),
            value.normalize(),
        );
    }

    Ok(readings)
}

fn scale(raw: &RawReadings, reading: &RawReading, scale_factor: &str) -> crate::Result<Decimal> {
    let key = readings::key(reading.model, reading.instance, scale_factor);
    let exponent = raw
        .get(&key)
        .and_then(|sf| sf.value.to_i64())
        .ok_or_else(|| Error::Mapping(key.clone()))?;

    Decimal::TEN
        .checked_powi(exponent)
        .and_then(|factor| reading.value.checked_mul(factor))
        .ok_or(Error::Mapping(key))
}
