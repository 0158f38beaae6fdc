//! Reefnet Sensus dive records: a start signature, then one depth byte per
//! interval with a temperature byte after every sixth depth.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime};

use super::{
    depth_from_pressure, DiveMode, FieldType, FieldValue, Parser, ProfileSummary, Sample,
    SampleCallback, WaterType, ATM,
};
use crate::array::u32_le;
use crate::backend::reefnet_sensus::{
    SIGNATURE, SURFACE_DEPTH, SURFACE_SAMPLES, TEMPERATURE_EVERY,
};
use crate::context::Context;
use crate::ctx_warning;
use crate::device::Family;
use crate::error::{Error, Result};

/// Feet of seawater per atmosphere.
const FSW_PER_ATM: f64 = 33.0;

/// Raw depths are absolute pressure in feet of seawater, offset so that
/// the surface reads `SURFACE_DEPTH`.
fn depth(raw: u8) -> f64 {
    let absolute = (f64::from(raw) + FSW_PER_ATM - f64::from(SURFACE_DEPTH)) * ATM / FSW_PER_ATM;
    depth_from_pressure(absolute - ATM, WaterType::Salt)
}

fn celsius(fahrenheit: u8) -> f64 {
    (f64::from(fahrenheit) - 32.0) * 5.0 / 9.0
}

pub struct SensusParser<'d> {
    ctx: Arc<Context>,
    data: &'d [u8],
    clock: Option<(u32, i64)>,
    summary: Option<ProfileSummary>,
}

impl<'d> SensusParser<'d> {
    pub fn new(ctx: Arc<Context>, data: &'d [u8]) -> Result<Self> {
        if data.len() < SIGNATURE || data[0] != 0xFF || data[SIGNATURE - 1] != 0xFE {
            return Err(Error::data_format("missing dive signature"));
        }
        Ok(SensusParser {
            ctx,
            data,
            clock: None,
            summary: None,
        })
    }

    fn interval(&self) -> u32 {
        u32::from(self.data[1])
    }

    fn decode(&self, callback: &mut SampleCallback<'_>) {
        let data = self.data;
        let interval = self.interval();
        let mut offset = SIGNATURE;
        let mut nsamples = 0u32;
        let mut surface = 0u32;
        let mut time = 0u32;

        while offset < data.len() {
            let raw = data[offset];
            offset += 1;
            time += interval;
            callback(&Sample::Time(time));
            callback(&Sample::Depth(depth(raw)));

            if nsamples % TEMPERATURE_EVERY == 0 {
                let Some(&temperature) = data.get(offset) else {
                    ctx_warning!(self.ctx, "dive ends before its temperature byte");
                    break;
                };
                offset += 1;
                callback(&Sample::Temperature(celsius(temperature)));
            }
            nsamples += 1;

            if raw < SURFACE_DEPTH {
                surface += 1;
                if surface == SURFACE_SAMPLES {
                    break;
                }
            } else {
                surface = 0;
            }
        }
    }

    fn profile(&mut self) -> &ProfileSummary {
        if self.summary.is_none() {
            let mut summary = ProfileSummary::new();
            self.decode(&mut |sample: &Sample| summary.add(sample));
            self.summary = Some(summary);
        }
        self.summary.get_or_insert_with(ProfileSummary::new)
    }
}

impl Parser for SensusParser<'_> {
    fn family(&self) -> Family {
        Family::ReefnetSensus
    }

    fn set_clock(&mut self, devtime: u32, systime: i64) -> Result<()> {
        self.clock = Some((devtime, systime));
        Ok(())
    }

    /// Record timestamps are device clock seconds, so a clock pairing is
    /// required.
    fn datetime(&self) -> Result<NaiveDateTime> {
        let (devtime, systime) = self.clock.ok_or(Error::Unsupported)?;
        let timestamp = i64::from(u32_le(self.data, 2));
        let utc = systime - (i64::from(devtime) - timestamp);
        DateTime::from_timestamp(utc, 0)
            .map(|datetime| datetime.naive_utc())
            .ok_or_else(|| Error::data_format("dive timestamp out of range"))
    }

    fn field(&mut self, field: FieldType) -> Result<FieldValue> {
        let value = match field {
            FieldType::DiveTime => FieldValue::DiveTime(self.profile().divetime()),
            FieldType::MaxDepth => FieldValue::Depth(self.profile().max_depth()),
            FieldType::AvgDepth => FieldValue::Depth(self.profile().avg_depth()),
            FieldType::GasMixCount | FieldType::TankCount => FieldValue::Count(0),
            FieldType::GasMix(i) => return Err(Error::invalid_args(format!("no gas mix {i}"))),
            FieldType::Tank(i) => return Err(Error::invalid_args(format!("no tank {i}"))),
            FieldType::TemperatureSurface => FieldValue::Temperature(
                self.profile().temperature_surface().ok_or(Error::Unsupported)?,
            ),
            FieldType::TemperatureMinimum => FieldValue::Temperature(
                self.profile().temperature_minimum().ok_or(Error::Unsupported)?,
            ),
            FieldType::TemperatureMaximum => FieldValue::Temperature(
                self.profile().temperature_maximum().ok_or(Error::Unsupported)?,
            ),
            FieldType::DiveMode => FieldValue::DiveMode(DiveMode::Gauge),
            FieldType::Salinity => FieldValue::Salinity {
                water: WaterType::Salt,
                density: WaterType::Salt.density(),
            },
        };
        Ok(value)
    }

    fn samples_foreach(&mut self, callback: &mut SampleCallback<'_>) -> Result<()> {
        let mut summary = ProfileSummary::new();
        self.decode(&mut |sample: &Sample| {
            summary.add(sample);
            callback(sample);
        });
        self.summary = Some(summary);
        Ok(())
    }
}
