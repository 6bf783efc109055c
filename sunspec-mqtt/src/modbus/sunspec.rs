//! SunSpec register map: marker discovery, the model chain, and the fixed blocks of the models this agent reports.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::register::{
    Point, PointType,
    PointType::{Acc32, Acc64, Bitfield32, Enum16, Enum32, Int16, Int32, Sunssf, Uint16, Uint32},
};
use crate::readings::{self, RawReading, RawReadings};
use crate::Error;

/// "SunS"
pub const MARKER: [u16; 2] = [0x5375, 0x6E53];

/// Where to look for the marker, most common first.
pub const BASE_ADDRESSES: [u16; 3] = [40000, 0, 50000];

/// Model id terminating the chain.
pub const END_MODEL: u16 = 0xFFFF;

/// Modbus limits a single read to 125 registers.
pub const MAX_READ: u16 = 125;

const MAX_MODELS: usize = 64;

pub struct Model {
    pub id: u16,
    pub name: &'static str,
    pub points: &'static [Point],
}

impl Model {
    /// Registers occupied by the fixed block (repeating groups are not decoded).
    pub fn fixed_len(&self) -> u16 {
        self.points.iter().map(|p| p.kind.size()).sum()
    }

    pub fn decode(
        &self,
        instance: usize,
        body: &[u16],
    ) -> crate::Result<Vec<(String, RawReading)>> {
        let fixed_len = usize::from(self.fixed_len());
        if body.len() < fixed_len {
            return Err(Error::protocol(format!(
                "model {} ({}) has {} registers, expected at least {}",
                self.id,
                self.name,
                body.len(),
                fixed_len
            )));
        }

        let mut offset = 0;
        let mut readings = Vec::new();
        for point in self.points {
            let size = usize::from(point.kind.size());
            let words = &body[offset..offset + size];
            offset += size;

            if let Some(value) = point.kind.parse_words(words) {
                readings.push((
                    readings::key(self.id, instance, point.name),
                    RawReading {
                        model: self.id,
                        instance,
                        point: point.name,
                        kind: point.kind,
                        value,
                        scale_factor: point.scale_factor,
                    },
                ));
            }
        }
        Ok(readings)
    }
}

pub fn lookup(id: u16) -> Option<&'static Model> {
    MODELS.iter().find(|m| m.id == id)
}

pub static MODELS: [Model; 4] = [
    Model {
        id: 701,
        name: "DERMeasureAC",
        points: DER_MEASURE_AC,
    },
    Model {
        id: 713,
        name: "DERStorageCapacity",
        points: DER_STORAGE_CAPACITY,
    },
    Model {
        id: 714,
        name: "DERMeasureDC",
        points: DER_MEASURE_DC,
    },
    Model {
        id: 502,
        name: "SolarModule",
        points: SOLAR_MODULE,
    },
];

const DER_MEASURE_AC: &[Point] = &[
    Point::new("ACType", Enum16),
    Point::new("St", Enum16),
    Point::new("InvSt", Enum16),
    Point::new("ConnSt", Enum16),
    Point::new("Alrm", Bitfield32),
    Point::new("DERMode", Bitfield32),
    Point::scaled("W", Int16, "W_SF"),
    Point::scaled("VA", Int16, "VA_SF"),
    Point::scaled("Var", Int16, "Var_SF"),
    Point::scaled("PF", Int16, "PF_SF"),
    Point::scaled("A", Int16, "A_SF"),
    Point::scaled("LLV", Uint16, "V_SF"),
    Point::scaled("LNV", Uint16, "V_SF"),
    Point::scaled("Hz", Uint32, "Hz_SF"),
    Point::scaled("TotWhInj", Acc64, "TotWh_SF"),
    Point::scaled("TotWhAbs", Acc64, "TotWh_SF"),
    Point::scaled("TotVarhInj", Acc64, "TotVarh_SF"),
    Point::scaled("TotVarhAbs", Acc64, "TotVarh_SF"),
    Point::scaled("TmpAmb", Int16, "Tmp_SF"),
    Point::scaled("TmpCab", Int16, "Tmp_SF"),
    Point::scaled("TmpSnk", Int16, "Tmp_SF"),
    Point::scaled("TmpTrns", Int16, "Tmp_SF"),
    Point::scaled("TmpSw", Int16, "Tmp_SF"),
    Point::scaled("TmpOt", Int16, "Tmp_SF"),
    Point::scaled("WL1", Int16, "W_SF"),
    Point::scaled("VAL1", Int16, "VA_SF"),
    Point::scaled("VarL1", Int16, "Var_SF"),
    Point::scaled("PFL1", Int16, "PF_SF"),
    Point::scaled("AL1", Int16, "A_SF"),
    Point::scaled("VL1L2", Uint16, "V_SF"),
    Point::scaled("VL1", Uint16, "V_SF"),
    Point::scaled("TotWhInjL1", Acc64, "TotWh_SF"),
    Point::scaled("TotWhAbsL1", Acc64, "TotWh_SF"),
    Point::scaled("TotVarhInjL1", Acc64, "TotVarh_SF"),
    Point::scaled("TotVarhAbsL1", Acc64, "TotVarh_SF"),
    Point::scaled("WL2", Int16, "W_SF"),
    Point::scaled("VAL2", Int16, "VA_SF"),
    Point::scaled("VarL2", Int16, "Var_SF"),
    Point::scaled("PFL2", Int16, "PF_SF"),
    Point::scaled("AL2", Int16, "A_SF"),
    Point::scaled("VL2L3", Uint16, "V_SF"),
    Point::scaled("VL2", Uint16, "V_SF"),
    Point::scaled("TotWhInjL2", Acc64, "TotWh_SF"),
    Point::scaled("TotWhAbsL2", Acc64, "TotWh_SF"),
    Point::scaled("TotVarhInjL2", Acc64, "TotVarh_SF"),
    Point::scaled("TotVarhAbsL2", Acc64, "TotVarh_SF"),
    Point::scaled("WL3", Int16, "W_SF"),
    Point::scaled("VAL3", Int16, "VA_SF"),
    Point::scaled("VarL3", Int16, "Var_SF"),
    Point::scaled("PFL3", Int16, "PF_SF"),
    Point::scaled("AL3", Int16, "A_SF"),
    Point::scaled("VL3L1", Uint16, "V_SF"),
    Point::scaled("VL3", Uint16, "V_SF"),
    Point::scaled("TotWhInjL3", Acc64, "TotWh_SF"),
    Point::scaled("TotWhAbsL3", Acc64, "TotWh_SF"),
    Point::scaled("TotVarhInjL3", Acc64, "TotVarh_SF"),
    Point::scaled("TotVarhAbsL3", Acc64, "TotVarh_SF"),
    Point::new("ThrotPct", Uint16),
    Point::new("ThrotSrc", Bitfield32),
    Point::new("A_SF", Sunssf),
    Point::new("V_SF", Sunssf),
    Point::new("Hz_SF", Sunssf),
    Point::new("W_SF", Sunssf),
    Point::new("PF_SF", Sunssf),
    Point::new("VA_SF", Sunssf),
    Point::new("Var_SF", Sunssf),
    Point::new("TotWh_SF", Sunssf),
    Point::new("TotVarh_SF", Sunssf),
    Point::new("Tmp_SF", Sunssf),
    Point::new("MnAlrmInfo", PointType::String(32)),
];

const DER_STORAGE_CAPACITY: &[Point] = &[
    Point::scaled("WHRtg", Uint16, "WH_SF"),
    Point::scaled("WHAvail", Uint16, "WH_SF"),
    Point::scaled("SoC", Uint16, "Pct_SF"),
    Point::scaled("SoH", Uint16, "Pct_SF"),
    Point::new("Sta", Enum16),
    Point::new("WH_SF", Sunssf),
    Point::new("Pct_SF", Sunssf),
];

const DER_MEASURE_DC: &[Point] = &[
    Point::new("PrtAlrms", Bitfield32),
    Point::new("NPrt", Uint16),
    Point::scaled("DCA", Int16, "DCA_SF"),
    Point::scaled("DCW", Int16, "DCW_SF"),
    Point::scaled("DCWhInj", Acc64, "DCWH_SF"),
    Point::scaled("DCWhAbs", Acc64, "DCWH_SF"),
    Point::new("DCA_SF", Sunssf),
    Point::new("DCV_SF", Sunssf),
    Point::new("DCW_SF", Sunssf),
    Point::new("DCWH_SF", Sunssf),
    Point::new("Tmp_SF", Sunssf),
];

const SOLAR_MODULE: &[Point] = &[
    Point::new("A_SF", Sunssf),
    Point::new("V_SF", Sunssf),
    Point::new("W_SF", Sunssf),
    Point::new("Wh_SF", Sunssf),
    Point::new("Stat", Enum16),
    Point::new("StatVend", Enum16),
    Point::new("Evt", Bitfield32),
    Point::new("EvtVend", Bitfield32),
    Point::new("Ctl", Enum16),
    Point::new("CtlVend", Enum32),
    Point::new("CtlVal", Int32),
    Point::new("Tms", Uint32),
    Point::scaled("OutA", Int16, "A_SF"),
    Point::scaled("OutV", Int16, "V_SF"),
    Point::scaled("OutWh", Acc32, "Wh_SF"),
    Point::scaled("OutPw", Int16, "W_SF"),
    Point::new("Tmp", Int16),
    Point::scaled("InA", Int16, "A_SF"),
    Point::scaled("InV", Int16, "V_SF"),
    Point::scaled("InWh", Acc32, "Wh_SF"),
    Point::scaled("InW", Int16, "W_SF"),
];

/// Anything that can answer "read holding registers".
#[async_trait]
pub trait RegisterSource: Send {
    async fn read_holding(&mut self, address: u16, count: u16) -> std::io::Result<Vec<u16>>;
}

/// Errors that mean the transport is gone, as opposed to the device refusing a particular request.
fn is_transport_error(error: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        error.kind(),
        TimedOut
            | ConnectionRefused
            | ConnectionReset
            | ConnectionAborted
            | NotConnected
            | BrokenPipe
            | UnexpectedEof
    )
}

fn classify(error: std::io::Error) -> Error {
    if is_transport_error(&error) {
        Error::DeviceUnreachable(error)
    } else {
        Error::protocol(error.to_string())
    }
}

fn overflow() -> Error {
    Error::protocol("model chain runs past the end of the register space")
}

async fn read<S: RegisterSource + ?Sized>(
    source: &mut S,
    address: u16,
    count: u16,
) -> crate::Result<Vec<u16>> {
    let words = source.read_holding(address, count).await.map_err(classify)?;
    if words.len() != usize::from(count) {
        return Err(Error::protocol(format!(
            "asked for {} registers at {} but received {}",
            count,
            address,
            words.len()
        )));
    }
    Ok(words)
}

async fn read_block<S: RegisterSource + ?Sized>(
    source: &mut S,
    start: u16,
    len: u16,
) -> crate::Result<Vec<u16>> {
    let mut words = Vec::with_capacity(usize::from(len));
    let mut offset = 0;
    while offset < len {
        let count = (len - offset).min(MAX_READ);
        let address = start.checked_add(offset).ok_or_else(overflow)?;
        words.extend(read(source, address, count).await?);
        offset += count;
    }
    Ok(words)
}

async fn find_base<S: RegisterSource + ?Sized>(source: &mut S) -> crate::Result<u16> {
    for base in BASE_ADDRESSES {
        match source.read_holding(base, 2).await {
            Ok(words) if words[..] == MARKER => {
                debug!(base, "Found SunSpec marker");
                return Ok(base);
            }
            Ok(words) => trace!(base, ?words, "No SunSpec marker"),
            Err(error) if is_transport_error(&error) => return Err(Error::DeviceUnreachable(error)),
            Err(error) => trace!(base, %error, "No SunSpec marker"),
        }
    }
    Err(Error::protocol("SunSpec marker not found"))
}

/// Walk the device's model chain and decode every model listed in [`MODELS`].
pub async fn scan<S: RegisterSource + ?Sized>(source: &mut S) -> crate::Result<RawReadings> {
    let base = find_base(source).await?;
    let mut address = base.checked_add(2).ok_or_else(overflow)?;
    let mut instances: HashMap<u16, usize> = HashMap::new();
    let mut readings = RawReadings::new();

    // One header per model plus the end marker.
    for _ in 0..=MAX_MODELS {
        let header = read(source, address, 2).await?;
        let (id, len) = (header[0], header[1]);
        if id == END_MODEL {
            return Ok(readings);
        }

        let body = address.checked_add(2).ok_or_else(overflow)?;
        match lookup(id) {
            Some(model) => {
                let fixed_len = model.fixed_len();
                if len < fixed_len {
                    return Err(Error::protocol(format!(
                        "model {} ({}) declares {} registers, expected at least {}",
                        id, model.name, len, fixed_len
                    )));
                }
                let instance = instances.entry(id).or_default();
                let words = read_block(source, body, fixed_len).await?;
                debug!(id, name = model.name, instance = *instance, address, "Decoding model");
                readings.extend(model.decode(*instance, &words)?);
                *instance += 1;
            }
            None => trace!(id, len, address, "Skipping model"),
        }

        address = body.checked_add(len).ok_or_else(overflow)?;
    }

    Err(Error::protocol(format!(
        "model chain has more than {} models",
        MAX_MODELS
    )))
}
