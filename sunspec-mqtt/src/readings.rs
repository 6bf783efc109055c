//! The value sets passed between the reader, the mapper and the publisher.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::modbus::register::PointType;

/// Unscaled readings of one device scan, keyed by [`key`].
pub type RawReadings = BTreeMap<String, RawReading>;

/// Readings in real-world units, keyed by metric name.
pub type Readings = BTreeMap<String, Decimal>;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RawReading {
    #[serde(skip)]
    pub model: u16,

    /// Zero for the first occurrence of `model` in the device's model chain
    #[serde(skip)]
    pub instance: usize,

    #[serde(skip)]
    pub point: &'static str,

    #[serde(rename = "type")]
    pub kind: PointType,

    pub value: Decimal,

    /// Name of the scale factor point within the same model instance
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale_factor: Option<&'static str>,
}

/// `701/W` for the first instance of a model, `701_1/W` for the second, and so on.
pub fn key<M: std::fmt::Display>(model: M, instance: usize, point: &str) -> String {
    if instance == 0 {
        format!("{}/{}", model, point)
    } else {
        format!("{}_{}/{}", model, instance, point)
    }
}

#[test]
fn keys() {
    assert_eq!(key(701, 0, "W"), "701/W");
    assert_eq!(key(502, 2, "InW"), "502_2/InW");
    assert_eq!(key("SolarModule", 1, "InW"), "SolarModule_1/InW");
}
