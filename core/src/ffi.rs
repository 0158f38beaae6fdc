//! Offline entry points exported to mobile hosts.
//!
//! Live downloads need a transport the host owns, so only the pure parts of
//! the library cross the boundary: splitting a memory image into dives,
//! decoding one dive, and the ring arithmetic used to interpret pointers.

use crate::context::Context;
use crate::device::Family;
use crate::error::Error;
use crate::parser::{self, EventKind, FieldType, FieldValue, Sample};
use crate::ringbuffer::{Ring, RingMode};

#[derive(Debug, Clone, PartialEq, thiserror::Error, uniffi::Error)]
pub enum FfiError {
    #[error("{status}: {message}")]
    Failed { status: String, message: String },
}

impl From<Error> for FfiError {
    fn from(err: Error) -> Self {
        FfiError::Failed {
            status: err.status().name().to_string(),
            message: err.to_string(),
        }
    }
}

impl FfiError {
    pub fn status(&self) -> &str {
        match self {
            FfiError::Failed { status, .. } => status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct FfiRawDive {
    pub data: Vec<u8>,
    pub fingerprint: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct FfiGasMix {
    pub oxygen: f64,
    pub helium: f64,
}

#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct FfiTank {
    pub gasmix: Option<u32>,
    pub begin_pressure: f64,
    pub end_pressure: f64,
}

#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct FfiTankPressure {
    pub tank: u32,
    pub bar: f64,
}

/// Every value reported for one sample time.
#[derive(Debug, Clone, Default, PartialEq, uniffi::Record)]
pub struct FfiSamplePoint {
    pub time: u32,
    pub depth: Option<f64>,
    pub temperature: Option<f64>,
    pub pressures: Vec<FfiTankPressure>,
    pub gasmix: Option<u32>,
    pub rbt: Option<u32>,
    pub heartbeat: Option<u32>,
    pub bearing: Option<u32>,
    pub bookmark: bool,
}

#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct FfiDive {
    /// ISO 8601, absent when the record cannot be placed in time.
    pub datetime: Option<String>,
    pub divetime: u32,
    pub max_depth: f64,
    pub avg_depth: f64,
    pub temperature_minimum: Option<f64>,
    pub temperature_maximum: Option<f64>,
    pub dive_mode: Option<String>,
    pub gasmixes: Vec<FfiGasMix>,
    pub tanks: Vec<FfiTank>,
    pub samples: Vec<FfiSamplePoint>,
}

fn family(name: &str) -> Result<Family, FfiError> {
    Ok(name.parse::<Family>()?)
}

/// A field the record does not carry reads as absent.
fn optional(value: crate::Result<FieldValue>) -> Result<Option<FieldValue>, FfiError> {
    match value {
        Ok(value) => Ok(Some(value)),
        Err(Error::Unsupported) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn count(value: FieldValue) -> usize {
    match value {
        FieldValue::Count(n) => n,
        _ => 0,
    }
}

#[uniffi::export]
pub fn ffi_families() -> Vec<String> {
    Family::ALL.iter().map(|f| f.name().to_string()).collect()
}

/// Split a memory image into dives, newest first, stopping at `fingerprint`.
#[uniffi::export]
pub fn ffi_extract_dives(
    family_name: String,
    image: Vec<u8>,
    fingerprint: Vec<u8>,
) -> Result<Vec<FfiRawDive>, FfiError> {
    let family = family(&family_name)?;
    let mut dives = Vec::new();
    crate::extract::extract_dives(family, &image, &fingerprint, &mut |data: &[u8], fp: &[u8]| {
        dives.push(FfiRawDive {
            data: data.to_vec(),
            fingerprint: fp.to_vec(),
        });
        true
    })?;
    Ok(dives)
}

/// Decode one raw dive. `devtime` and `systime` pair the device clock with
/// host time, as reported by the download that produced the dive.
#[uniffi::export]
pub fn ffi_parse_dive(
    family_name: String,
    model: u32,
    data: Vec<u8>,
    devtime: Option<u32>,
    systime: Option<i64>,
) -> Result<FfiDive, FfiError> {
    let family = family(&family_name)?;
    let ctx = Context::new().into_shared();
    let mut parser = parser::for_family(ctx, family, model, &data)?;
    if let (Some(devtime), Some(systime)) = (devtime, systime) {
        parser.set_clock(devtime, systime)?;
    }

    let mut samples: Vec<FfiSamplePoint> = Vec::new();
    parser.samples_foreach(&mut |sample: &Sample| {
        if let Sample::Time(time) = *sample {
            samples.push(FfiSamplePoint {
                time,
                ..FfiSamplePoint::default()
            });
            return;
        }
        let Some(point) = samples.last_mut() else {
            return;
        };
        match *sample {
            Sample::Time(_) => {}
            Sample::Depth(depth) => point.depth = Some(depth),
            Sample::Temperature(t) => point.temperature = Some(t),
            Sample::Pressure { tank, bar } => point.pressures.push(FfiTankPressure {
                tank: tank as u32,
                bar,
            }),
            Sample::Rbt(rbt) => point.rbt = Some(rbt),
            Sample::Heartbeat(bpm) => point.heartbeat = Some(bpm),
            Sample::Bearing(bearing) => point.bearing = Some(bearing),
            Sample::Gasmix(index) => point.gasmix = Some(index as u32),
            Sample::Event {
                kind: EventKind::Bookmark,
                ..
            } => point.bookmark = true,
        }
    })?;

    let datetime = match parser.datetime() {
        Ok(datetime) => Some(datetime.format("%Y-%m-%dT%H:%M:%S").to_string()),
        Err(Error::Unsupported) => None,
        Err(err) => return Err(err.into()),
    };

    let mut gasmixes = Vec::new();
    for i in 0..count(parser.field(FieldType::GasMixCount)?) {
        if let FieldValue::GasMix(mix) = parser.field(FieldType::GasMix(i))? {
            gasmixes.push(FfiGasMix {
                oxygen: mix.oxygen,
                helium: mix.helium,
            });
        }
    }
    let mut tanks = Vec::new();
    for i in 0..count(parser.field(FieldType::TankCount)?) {
        if let FieldValue::Tank(tank) = parser.field(FieldType::Tank(i))? {
            tanks.push(FfiTank {
                gasmix: tank.gasmix.map(|index| index as u32),
                begin_pressure: tank.begin_pressure,
                end_pressure: tank.end_pressure,
            });
        }
    }

    let depth = |value: Option<FieldValue>| match value {
        Some(FieldValue::Depth(depth)) => depth,
        _ => 0.0,
    };
    let temperature = |value: Option<FieldValue>| match value {
        Some(FieldValue::Temperature(t)) => Some(t),
        _ => None,
    };

    Ok(FfiDive {
        datetime,
        divetime: match parser.field(FieldType::DiveTime)? {
            FieldValue::DiveTime(seconds) => seconds,
            _ => 0,
        },
        max_depth: depth(optional(parser.field(FieldType::MaxDepth))?),
        avg_depth: depth(optional(parser.field(FieldType::AvgDepth))?),
        temperature_minimum: temperature(optional(parser.field(FieldType::TemperatureMinimum))?),
        temperature_maximum: temperature(optional(parser.field(FieldType::TemperatureMaximum))?),
        dive_mode: match optional(parser.field(FieldType::DiveMode))? {
            Some(FieldValue::DiveMode(mode)) => Some(format!("{mode:?}")),
            _ => None,
        },
        gasmixes,
        tanks,
        samples,
    })
}

/// Forward distance between two ring addresses. `full` resolves equal
/// addresses to the whole ring instead of nothing.
#[uniffi::export]
pub fn ffi_ringbuffer_distance(
    begin: u32,
    end: u32,
    a: u32,
    b: u32,
    full: bool,
) -> Result<u32, FfiError> {
    let ring = Ring::new(begin, end)?;
    let mode = if full { RingMode::Full } else { RingMode::Empty };
    Ok(ring.distance(a, b, mode)?)
}
