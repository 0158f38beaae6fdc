//! Dive record decoding.
//!
//! A parser borrows one raw dive, as handed out by
//! [`crate::Device::foreach`] or [`crate::extract::extract_dives`], and turns
//! it into summary fields and a time-ordered stream of [`Sample`]s.

pub mod bitstream;
pub mod reefnet_sensus;
pub mod summary;
pub mod uwatec_smart;

use std::sync::Arc;

use chrono::NaiveDateTime;

use crate::context::Context;
use crate::device::Family;
use crate::error::{Error, Result};

pub use reefnet_sensus::SensusParser;
pub use summary::ProfileSummary;
pub use uwatec_smart::UwatecSmartParser;

/// Standard gravity, m/s².
pub const GRAVITY: f64 = 9.80665;
/// Standard atmosphere, bar.
pub const ATM: f64 = 1.01325;
/// Pascal per bar.
pub const BAR: f64 = 100_000.0;

/// Most gas mixes a dive can carry.
pub const MAX_GASMIXES: usize = 10;
/// Most tanks a dive can carry.
pub const MAX_TANKS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Bookmark,
}

/// One decoded sample value. A `Time` sample opens each sample point; the
/// values that follow belong to it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample {
    /// Seconds since the start of the dive.
    Time(u32),
    /// Metres.
    Depth(f64),
    /// Degrees Celsius.
    Temperature(f64),
    /// Tank pressure in bar; `tank` indexes the dive's tank list.
    Pressure { tank: usize, bar: f64 },
    /// Remaining bottom time, minutes.
    Rbt(u32),
    /// Beats per minute.
    Heartbeat(u32),
    /// Compass bearing, degrees.
    Bearing(u32),
    /// Index into the dive's gas mix list.
    Gasmix(usize),
    Event { kind: EventKind, value: u32 },
}

pub type SampleCallback<'c> = dyn FnMut(&Sample) + 'c;

/// Breathing gas as fractions of one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GasMix {
    pub oxygen: f64,
    pub helium: f64,
}

impl GasMix {
    pub fn nitrogen(&self) -> f64 {
        1.0 - self.oxygen - self.helium
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tank {
    /// Index into the gas mix list, if the tank is tied to one.
    pub gasmix: Option<usize>,
    /// Bar.
    pub begin_pressure: f64,
    /// Bar.
    pub end_pressure: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiveMode {
    OpenCircuit,
    Gauge,
    Freedive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaterType {
    Fresh,
    Salt,
}

impl WaterType {
    /// kg/m³.
    pub fn density(&self) -> f64 {
        match self {
            WaterType::Fresh => 1000.0,
            WaterType::Salt => 1025.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    DiveTime,
    MaxDepth,
    AvgDepth,
    GasMixCount,
    GasMix(usize),
    TankCount,
    Tank(usize),
    TemperatureSurface,
    TemperatureMinimum,
    TemperatureMaximum,
    DiveMode,
    Salinity,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    /// Seconds.
    DiveTime(u32),
    /// Metres.
    Depth(f64),
    Count(usize),
    GasMix(GasMix),
    Tank(Tank),
    /// Degrees Celsius.
    Temperature(f64),
    DiveMode(DiveMode),
    Salinity { water: WaterType, density: f64 },
}

pub trait Parser {
    fn family(&self) -> Family;

    /// Pair a device clock reading with host time, so record timestamps in
    /// device ticks can be placed on the host calendar.
    fn set_clock(&mut self, _devtime: u32, _systime: i64) -> Result<()> {
        Err(Error::Unsupported)
    }

    fn datetime(&self) -> Result<NaiveDateTime>;

    fn field(&mut self, field: FieldType) -> Result<FieldValue>;

    fn samples_foreach(&mut self, callback: &mut SampleCallback<'_>) -> Result<()>;
}

/// Build the parser matching `family` over one raw dive.
pub fn for_family<'d>(
    ctx: Arc<Context>,
    family: Family,
    model: u32,
    data: &'d [u8],
) -> Result<Box<dyn Parser + 'd>> {
    match family {
        Family::UwatecSmart => Ok(Box::new(UwatecSmartParser::new(ctx, model, data)?)),
        Family::ReefnetSensus => Ok(Box::new(SensusParser::new(ctx, data)?)),
        other => {
            tracing::debug!(family = %other, "no parser for family");
            Err(Error::Unsupported)
        }
    }
}

/// Depth below the surface for a hydrostatic pressure, bar over ambient.
pub fn depth_from_pressure(bar: f64, water: WaterType) -> f64 {
    bar * BAR / (water.density() * GRAVITY)
}
