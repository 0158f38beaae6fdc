//! Uwatec Smart, Aladin and Galileo dive records.
//!
//! A record is a fixed header followed by a prefix-coded sample stream.
//! Every opcode updates one channel, either to an absolute value or by a
//! signed delta; depth and time opcodes close a sample point, which is then
//! emitted with the current value of every channel seen so far.

pub mod tables;

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime};

use super::bitstream::{sign_extend, BitReader};
use super::{
    depth_from_pressure, DiveMode, EventKind, FieldType, FieldValue, GasMix, Parser,
    ProfileSummary, Sample, SampleCallback, Tank, WaterType, MAX_GASMIXES, MAX_TANKS,
};
use crate::array::{u16_le, u32_le};
use crate::context::Context;
use crate::ctx_warning;
use crate::device::Family;
use crate::error::{Error, Result};
use tables::{model_info, AlarmKind, ModelInfo, SampleKind, APNEA_BYTES};

/// Record timestamps count half seconds from 2000-01-01T00:00:00Z.
const EPOCH: i64 = 946_684_800;
const TIMESTAMP_OFFSET: usize = 8;

/// Bar per raw depth step.
pub const DEPTH_UNIT: f64 = 0.002;
const TEMPERATURE_DIVISOR: f64 = 2.5;
const SAMPLE_PRESSURE_DIVISOR: f64 = 4.0;
const HEADER_PRESSURE_DIVISOR: f64 = 128.0;

const INTERVAL: u32 = 4;
const FREEDIVE_INTERVAL: u32 = 1;

/// Misc records of these subtypes carry a gas mix and its tank.
const MISC_GASMIX: std::ops::RangeInclusive<u8> = 32..=41;
const SZ_MISC_GASMIX: usize = 9;
const UNUSED_PRESSURE: u16 = 0xFFFF;

#[derive(Debug, Clone, Copy)]
struct MixEntry {
    id: u32,
    mix: GasMix,
}

#[derive(Debug, Clone, Copy)]
struct TankEntry {
    id: u32,
    tank: Tank,
}

/// Running value of every sample channel.
#[derive(Debug, Default)]
struct Channels {
    time: u32,
    depth: i32,
    calibration: Option<i32>,
    have_depth: bool,
    temperature: i32,
    have_temperature: bool,
    pressure: i32,
    tank: u32,
    have_pressure: bool,
    rbt: i32,
    have_rbt: bool,
    heartrate: i32,
    have_heartrate: bool,
    bearing: u32,
    have_bearing: bool,
    bookmark: Option<u32>,
    gasmix: Option<u32>,
    previous_gasmix: Option<u32>,
}

/// Absolute values replace the channel, deltas add to it.
fn apply(channel: &mut i32, absolute: bool, value: u32, svalue: i32) {
    if absolute {
        *channel = value as i32;
    } else {
        *channel = channel.wrapping_add(svalue);
    }
}

pub struct UwatecSmartParser<'d> {
    ctx: Arc<Context>,
    model: u32,
    info: ModelInfo,
    data: &'d [u8],
    clock: Option<(u32, i64)>,
    mixes: Vec<MixEntry>,
    tanks: Vec<TankEntry>,
    divemode: DiveMode,
    water: WaterType,
    /// Filled by the first full pass over the samples.
    summary: Option<ProfileSummary>,
}

impl<'d> UwatecSmartParser<'d> {
    pub fn new(ctx: Arc<Context>, model: u32, data: &'d [u8]) -> Result<Self> {
        let Some(info) = model_info(model) else {
            tracing::debug!(model, "unknown Smart model");
            return Err(Error::Unsupported);
        };
        if data.len() < info.header_size {
            return Err(Error::data_format(format!(
                "{} byte record, the {} header alone is {}",
                data.len(),
                info.name,
                info.header_size
            )));
        }

        let mut parser = UwatecSmartParser {
            ctx,
            model,
            info,
            data,
            clock: None,
            mixes: Vec::new(),
            tanks: Vec::new(),
            divemode: DiveMode::OpenCircuit,
            water: WaterType::Salt,
            summary: None,
        };
        parser.read_header();
        Ok(parser)
    }

    pub fn model(&self) -> u32 {
        self.model
    }

    fn read_header(&mut self) {
        let layout = self.info.header;
        if let Some(offset) = layout.settings {
            let settings = self.data[offset];
            self.divemode = match settings & 0x03 {
                1 => DiveMode::Gauge,
                2 => DiveMode::Freedive,
                _ => DiveMode::OpenCircuit,
            };
            if settings & 0x04 != 0 {
                self.water = WaterType::Fresh;
            }
        }

        if let Some(offset) = layout.gasmix {
            for i in 0..layout.ngases {
                let oxygen = u16_le(self.data, offset + 2 * i);
                if oxygen == 0 {
                    continue;
                }
                self.mixes.push(MixEntry {
                    id: i as u32,
                    mix: GasMix {
                        oxygen: f64::from(oxygen) / 100.0,
                        helium: 0.0,
                    },
                });
            }
        }

        if let Some(offset) = layout.tankpressure {
            for i in 0..layout.ngases {
                let begin = u16_le(self.data, offset + 4 * i);
                let end = u16_le(self.data, offset + 4 * i + 2);
                if begin == UNUSED_PRESSURE && end == UNUSED_PRESSURE {
                    continue;
                }
                let id = i as u32;
                self.tanks.push(TankEntry {
                    id,
                    tank: Tank {
                        gasmix: self.mix_index(id),
                        begin_pressure: f64::from(begin) / HEADER_PRESSURE_DIVISOR,
                        end_pressure: f64::from(end) / HEADER_PRESSURE_DIVISOR,
                    },
                });
            }
        }
    }

    fn mix_index(&self, id: u32) -> Option<usize> {
        self.mixes.iter().position(|entry| entry.id == id)
    }

    fn interval(&self) -> u32 {
        match self.divemode {
            DiveMode::Freedive => FREEDIVE_INTERVAL,
            _ => INTERVAL,
        }
    }

    fn depth(&self, raw: i32) -> f64 {
        depth_from_pressure(f64::from(raw) * DEPTH_UNIT, self.water)
    }

    fn header_temperature(&self, offset: usize) -> f64 {
        f64::from(u16_le(self.data, offset) as i16) / 10.0
    }

    /// Index of the tank with `id`, registering it on first sight.
    fn tank_index(&mut self, id: u32, bar: f64) -> Result<usize> {
        if let Some(index) = self.tanks.iter().position(|entry| entry.id == id) {
            return Ok(index);
        }
        if self.tanks.len() >= MAX_TANKS {
            return Err(Error::data_format("too many tanks"));
        }
        self.tanks.push(TankEntry {
            id,
            tank: Tank {
                gasmix: self.mix_index(id),
                begin_pressure: bar,
                end_pressure: bar,
            },
        });
        Ok(self.tanks.len() - 1)
    }

    /// Gas mix and tank record embedded in the sample stream.
    fn misc_gasmix(&mut self, record: &[u8]) -> Result<()> {
        if record.len() < SZ_MISC_GASMIX {
            return Err(Error::data_format(format!("{} byte gas mix record", record.len())));
        }
        let id = u32::from(record[0] - MISC_GASMIX.start());
        let oxygen = u16_le(record, 1);
        let helium = u16_le(record, 3);
        let begin = u16_le(record, 5);
        let end = u16_le(record, 7);

        if self.mix_index(id).is_none() {
            if self.mixes.len() >= MAX_GASMIXES {
                return Err(Error::data_format("too many gas mixes"));
            }
            self.mixes.push(MixEntry {
                id,
                mix: GasMix {
                    oxygen: f64::from(oxygen) / 100.0,
                    helium: f64::from(helium) / 100.0,
                },
            });
        }

        let known = self.tanks.iter().any(|entry| entry.id == id);
        let unused = begin == UNUSED_PRESSURE && end == UNUSED_PRESSURE;
        if !known && !unused {
            if self.tanks.len() >= MAX_TANKS {
                return Err(Error::data_format("too many tanks"));
            }
            self.tanks.push(TankEntry {
                id,
                tank: Tank {
                    gasmix: self.mix_index(id),
                    begin_pressure: f64::from(begin) / HEADER_PRESSURE_DIVISOR,
                    end_pressure: f64::from(end) / HEADER_PRESSURE_DIVISOR,
                },
            });
        }
        Ok(())
    }

    fn emit(&mut self, ch: &mut Channels, callback: &mut SampleCallback<'_>) -> Result<()> {
        callback(&Sample::Time(ch.time));

        if let Some(id) = ch.gasmix {
            if ch.previous_gasmix != Some(id) {
                let index = self
                    .mix_index(id)
                    .ok_or_else(|| Error::data_format(format!("switch to unknown gas mix {id}")))?;
                callback(&Sample::Gasmix(index));
                ch.previous_gasmix = Some(id);
            }
        }
        if ch.have_temperature {
            callback(&Sample::Temperature(f64::from(ch.temperature) / TEMPERATURE_DIVISOR));
        }
        if let Some(value) = ch.bookmark.take() {
            callback(&Sample::Event {
                kind: EventKind::Bookmark,
                value,
            });
        }
        if ch.have_rbt {
            callback(&Sample::Rbt(ch.rbt.max(0) as u32));
        }
        if ch.have_pressure {
            let bar = f64::from(ch.pressure) / SAMPLE_PRESSURE_DIVISOR;
            let tank = self.tank_index(ch.tank, bar)?;
            callback(&Sample::Pressure { tank, bar });
        }
        if ch.have_heartrate {
            callback(&Sample::Heartbeat(ch.heartrate.max(0) as u32));
        }
        if ch.have_bearing {
            callback(&Sample::Bearing(ch.bearing));
            ch.have_bearing = false;
        }
        if ch.have_depth {
            let raw = ch.depth - ch.calibration.unwrap_or(0);
            callback(&Sample::Depth(self.depth(raw)));
        }

        ch.time += self.interval();
        Ok(())
    }

    fn decode(&mut self, callback: &mut SampleCallback<'_>) -> Result<()> {
        let info = self.info;
        let data = self.data;
        let mut reader = BitReader::new(&data[info.header_size..]);
        let mut ch = Channels {
            gasmix: self.mixes.first().map(|entry| entry.id),
            ..Channels::default()
        };

        while !reader.is_empty() {
            let opcode = reader.read_opcode(info.scheme);
            let Some(entry) = info.samples.get(opcode).copied() else {
                return Err(Error::data_format(format!(
                    "invalid type bits at sample offset {}",
                    reader.offset()
                )));
            };
            let (value, nbits) =
                reader.read_payload(entry.type_bits, entry.ignore_type_lowbits, entry.extra_bytes)?;
            let svalue = sign_extend(value, nbits);

            let mut complete = 0;
            match entry.kind {
                SampleKind::PressureDepth => {
                    ch.pressure += i32::from(((svalue >> 8) & 0xFF) as u8 as i8);
                    ch.depth += i32::from((svalue & 0xFF) as u8 as i8);
                    complete = 1;
                }
                SampleKind::Rbt => {
                    apply(&mut ch.rbt, entry.absolute, value, svalue);
                    ch.have_rbt |= entry.absolute;
                }
                SampleKind::Temperature => {
                    apply(&mut ch.temperature, entry.absolute, value, svalue);
                    ch.have_temperature |= entry.absolute;
                }
                SampleKind::Pressure => {
                    if entry.absolute {
                        if info.trimix {
                            ch.tank = (value & 0xF000) >> 12;
                            ch.pressure = (value & 0x0FFF) as i32;
                        } else {
                            ch.tank = entry.index as u32;
                            ch.pressure = value as i32;
                        }
                        ch.have_pressure = true;
                    } else {
                        ch.pressure += svalue;
                    }
                }
                SampleKind::Depth => {
                    apply(&mut ch.depth, entry.absolute, value, svalue);
                    if entry.absolute {
                        ch.calibration.get_or_insert(ch.depth);
                        ch.have_depth = true;
                    }
                    complete = 1;
                }
                SampleKind::HeartRate => {
                    apply(&mut ch.heartrate, entry.absolute, value, svalue);
                    ch.have_heartrate |= entry.absolute;
                }
                SampleKind::Bearing => {
                    ch.bearing = value;
                    ch.have_bearing = true;
                }
                SampleKind::Alarms => match info.alarms.get(entry.index) {
                    Some(fields) => {
                        for field in fields.iter() {
                            let v = (value & field.mask) >> field.shift;
                            match field.kind {
                                AlarmKind::Bookmark if v != 0 => ch.bookmark = Some(v),
                                AlarmKind::Bookmark => {}
                                AlarmKind::Gasmix => ch.gasmix = Some(v),
                            }
                        }
                    }
                    None => {
                        ctx_warning!(self.ctx, "unexpected alarm byte {}", entry.index);
                    }
                },
                SampleKind::Time => {
                    complete = value;
                }
                SampleKind::Apnea => {
                    reader.take(APNEA_BYTES)?;
                }
                SampleKind::Misc => {
                    if value < 1 {
                        return Err(Error::data_format("empty misc record"));
                    }
                    let record = reader.take(value as usize - 1)?;
                    if let Some(&subtype) = record.first() {
                        if MISC_GASMIX.contains(&subtype) {
                            self.misc_gasmix(record)?;
                        }
                    }
                }
            }

            for _ in 0..complete {
                self.emit(&mut ch, callback)?;
            }
        }
        Ok(())
    }

    fn profile(&mut self) -> Result<&ProfileSummary> {
        if self.summary.is_none() {
            self.samples_foreach(&mut |_: &Sample| {})?;
        }
        self.summary
            .as_ref()
            .ok_or_else(|| Error::data_format("no profile"))
    }
}

impl Parser for UwatecSmartParser<'_> {
    fn family(&self) -> Family {
        Family::UwatecSmart
    }

    fn set_clock(&mut self, devtime: u32, systime: i64) -> Result<()> {
        self.clock = Some((devtime, systime));
        Ok(())
    }

    fn datetime(&self) -> Result<NaiveDateTime> {
        let ticks = i64::from(u32_le(self.data, TIMESTAMP_OFFSET));
        let utc = match self.clock {
            Some((devtime, systime)) => systime - (i64::from(devtime) - ticks) / 2,
            None => EPOCH + ticks / 2,
        };
        let zone = self
            .info
            .header
            .timezone
            .map_or(0, |offset| i64::from(self.data[offset] as i8) * 900);
        DateTime::from_timestamp(utc + zone, 0)
            .map(|datetime| datetime.naive_utc())
            .ok_or_else(|| Error::data_format("dive timestamp out of range"))
    }

    fn field(&mut self, field: FieldType) -> Result<FieldValue> {
        let layout = self.info.header;
        let value = match field {
            FieldType::DiveTime => {
                FieldValue::DiveTime(u32::from(u16_le(self.data, layout.divetime)) * 60)
            }
            FieldType::MaxDepth => {
                FieldValue::Depth(self.depth(i32::from(u16_le(self.data, layout.maxdepth))))
            }
            FieldType::AvgDepth => FieldValue::Depth(self.profile()?.avg_depth()),
            FieldType::GasMixCount => {
                self.profile()?;
                FieldValue::Count(self.mixes.len())
            }
            FieldType::GasMix(i) => {
                self.profile()?;
                let entry = self
                    .mixes
                    .get(i)
                    .ok_or_else(|| Error::invalid_args(format!("no gas mix {i}")))?;
                FieldValue::GasMix(entry.mix)
            }
            FieldType::TankCount => {
                self.profile()?;
                FieldValue::Count(self.tanks.len())
            }
            FieldType::Tank(i) => {
                self.profile()?;
                let entry = self
                    .tanks
                    .get(i)
                    .ok_or_else(|| Error::invalid_args(format!("no tank {i}")))?;
                FieldValue::Tank(entry.tank)
            }
            FieldType::TemperatureMinimum => {
                FieldValue::Temperature(self.header_temperature(layout.temp_minimum))
            }
            FieldType::TemperatureMaximum => {
                let offset = layout.temp_maximum.ok_or(Error::Unsupported)?;
                FieldValue::Temperature(self.header_temperature(offset))
            }
            FieldType::TemperatureSurface => {
                let offset = layout.temp_surface.ok_or(Error::Unsupported)?;
                FieldValue::Temperature(self.header_temperature(offset))
            }
            FieldType::DiveMode => FieldValue::DiveMode(self.divemode),
            FieldType::Salinity => FieldValue::Salinity {
                water: self.water,
                density: self.water.density(),
            },
        };
        Ok(value)
    }

    fn samples_foreach(&mut self, callback: &mut SampleCallback<'_>) -> Result<()> {
        let mut summary = ProfileSummary::new();
        self.decode(&mut |sample: &Sample| {
            summary.add(sample);
            callback(sample);
        })?;
        self.summary = Some(summary);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use super::tables::{GALILEO, SMART_COM, SMART_PRO};
    use crate::parser::{BAR, GRAVITY};

    fn galileo_header() -> Vec<u8> {
        let mut header = vec![0u8; 152];
        header[..4].copy_from_slice(&[0xA5, 0xA5, 0x5A, 0x5A]);
        header[8..12].copy_from_slice(&7200u32.to_le_bytes());
        header[16] = 4;
        header[22..24].copy_from_slice(&4000u16.to_le_bytes());
        header[26..28].copy_from_slice(&42u16.to_le_bytes());
        header[28..30].copy_from_slice(&250u16.to_le_bytes());
        header[30..32].copy_from_slice(&(-15i16).to_le_bytes());
        header[32..34].copy_from_slice(&200u16.to_le_bytes());
        header[44..46].copy_from_slice(&21u16.to_le_bytes());
        header[46..48].copy_from_slice(&50u16.to_le_bytes());
        header[50..52].copy_from_slice(&(200u16 * 128).to_le_bytes());
        header[52..54].copy_from_slice(&(50u16 * 128).to_le_bytes());
        header[54..62].fill(0xFF);
        header
    }

    fn record(header: Vec<u8>, samples: &[u8]) -> Vec<u8> {
        let mut data = header;
        data.extend_from_slice(samples);
        let length = data.len() as u32;
        data[4..8].copy_from_slice(&length.to_le_bytes());
        data
    }

    fn decode(model: u32, data: &[u8]) -> Result<Vec<Sample>> {
        let ctx = Context::new().into_shared();
        let mut parser = UwatecSmartParser::new(ctx, model, data)?;
        let mut samples = Vec::new();
        parser.samples_foreach(&mut |sample: &Sample| samples.push(*sample))?;
        Ok(samples)
    }

    fn salt(raw: i32) -> f64 {
        depth_from_pressure(f64::from(raw) * DEPTH_UNIT, WaterType::Salt)
    }

    #[test]
    fn test_emit_order() {
        let data = record(
            galileo_header(),
            &[
                0xF3, 0x00, 0x3C, // temperature 60
                0xF4, 0x03, 0x20, // tank 0 at 800
                0xF2, 0x3C, // rbt 60
                0xF7, 0x50, // heart rate 80
                0xF8, 0x00, 0x5A, // bearing 90
                0xE4, // bookmark
                0xF1, 0x00, 0x00, // depth 0, closes the first point
                0x19, // depth +25
                0xF0, 0x10, // switch to mix 1
                0xC2, // two points without a change
                0x7F, // depth -1
            ],
        );
        let samples = decode(GALILEO, &data).unwrap();

        let repeated = |time: u32, gasmix: Option<usize>, depth: i32| {
            let mut point = vec![Sample::Time(time)];
            point.extend(gasmix.map(Sample::Gasmix));
            point.extend([
                Sample::Temperature(24.0),
                Sample::Rbt(60),
                Sample::Pressure { tank: 0, bar: 200.0 },
                Sample::Heartbeat(80),
                Sample::Depth(salt(depth)),
            ]);
            point
        };

        let mut expected = vec![
            Sample::Time(0),
            Sample::Gasmix(0),
            Sample::Temperature(24.0),
            Sample::Event {
                kind: EventKind::Bookmark,
                value: 1,
            },
            Sample::Rbt(60),
            Sample::Pressure { tank: 0, bar: 200.0 },
            Sample::Heartbeat(80),
            Sample::Bearing(90),
            Sample::Depth(0.0),
        ];
        expected.extend(repeated(4, None, 25));
        expected.extend(repeated(8, Some(1), 25));
        expected.extend(repeated(12, None, 25));
        expected.extend(repeated(16, None, 24));
        assert_eq!(samples, expected);
    }

    #[test]
    fn test_smart_prefix_and_composite_delta() {
        let mut samples = vec![0xFF, 0x00, 0x01, 0x00]; // absolute depth 256
        samples.extend([0x00, 0x19]); // depth +25, pressure +0
        samples.extend([0x7F, 0xFF]); // depth -1, pressure -1
        let data = record(vec![0u8; 100], &samples);
        assert_eq!(
            decode(SMART_COM, &data).unwrap(),
            vec![
                Sample::Time(0),
                Sample::Depth(0.0),
                Sample::Time(4),
                Sample::Depth(salt(25)),
                Sample::Time(8),
                Sample::Depth(salt(24)),
            ]
        );
    }

    #[test]
    fn test_header_fields() {
        let data = record(galileo_header(), &[0xF1, 0x00, 0x00]);
        let ctx = Context::new().into_shared();
        let mut parser = UwatecSmartParser::new(ctx, GALILEO, &data).unwrap();

        assert_eq!(parser.field(FieldType::DiveTime).unwrap(), FieldValue::DiveTime(2520));
        assert_eq!(parser.field(FieldType::MaxDepth).unwrap(), FieldValue::Depth(salt(4000)));
        assert_eq!(
            parser.field(FieldType::TemperatureMaximum).unwrap(),
            FieldValue::Temperature(25.0)
        );
        assert_eq!(
            parser.field(FieldType::TemperatureMinimum).unwrap(),
            FieldValue::Temperature(-1.5)
        );
        assert_eq!(
            parser.field(FieldType::TemperatureSurface).unwrap(),
            FieldValue::Temperature(20.0)
        );
        assert_eq!(parser.field(FieldType::GasMixCount).unwrap(), FieldValue::Count(2));
        assert_eq!(
            parser.field(FieldType::GasMix(1)).unwrap(),
            FieldValue::GasMix(GasMix {
                oxygen: 0.5,
                helium: 0.0
            })
        );
        assert_eq!(parser.field(FieldType::TankCount).unwrap(), FieldValue::Count(1));
        assert_eq!(
            parser.field(FieldType::Tank(0)).unwrap(),
            FieldValue::Tank(Tank {
                gasmix: Some(0),
                begin_pressure: 200.0,
                end_pressure: 50.0
            })
        );
        assert_eq!(
            parser.field(FieldType::DiveMode).unwrap(),
            FieldValue::DiveMode(DiveMode::OpenCircuit)
        );
        assert!(matches!(
            parser.field(FieldType::Tank(3)),
            Err(Error::InvalidArgs(_))
        ));
    }

    #[test]
    fn test_inline_gas_mix_inserted_once() {
        let misc = [
            0xFB, 0x0A, 0x22, 32, 0, 10, 0, 0xFF, 0xFF, 0xFF, 0xFF,
        ];
        let mut samples = misc.to_vec();
        samples.extend(misc);
        samples.extend([0xF1, 0x00, 0x00]);
        let data = record(galileo_header(), &samples);
        let ctx = Context::new().into_shared();
        let mut parser = UwatecSmartParser::new(ctx, GALILEO, &data).unwrap();

        assert_eq!(parser.field(FieldType::GasMixCount).unwrap(), FieldValue::Count(3));
        assert_eq!(
            parser.field(FieldType::GasMix(2)).unwrap(),
            FieldValue::GasMix(GasMix {
                oxygen: 0.32,
                helium: 0.10
            })
        );
        // Both pressures unset: no tank.
        assert_eq!(parser.field(FieldType::TankCount).unwrap(), FieldValue::Count(1));
    }

    #[test]
    fn test_apnea_bytes_are_skipped() {
        let mut samples = vec![0xFA];
        samples.extend([0xF1; APNEA_BYTES]);
        samples.extend([0xF1, 0x00, 0x00]);
        let data = record(galileo_header(), &samples);
        let found = decode(GALILEO, &data).unwrap();
        assert_eq!(found.iter().filter(|s| matches!(s, Sample::Time(_))).count(), 1);
    }

    #[test]
    fn test_freedive_interval() {
        let mut header = galileo_header();
        header[43] = 0x02;
        let data = record(header, &[0xF1, 0x00, 0x00, 0x01]);
        let found = decode(GALILEO, &data).unwrap();
        let times: Vec<u32> = found
            .iter()
            .filter_map(|s| match s {
                Sample::Time(t) => Some(*t),
                _ => None,
            })
            .collect();
        assert_eq!(times, vec![0, 1]);
    }

    #[test]
    fn test_invalid_type_bits() {
        let data = record(vec![0u8; 92], &[0xFF, 0xFF]);
        assert!(matches!(decode(SMART_PRO, &data), Err(Error::DataFormat(_))));
    }

    #[test]
    fn test_truncated_sample() {
        let data = record(galileo_header(), &[0xF1, 0x00]);
        assert!(matches!(decode(GALILEO, &data), Err(Error::DataFormat(_))));
    }

    #[test]
    fn test_switch_to_unknown_mix() {
        let data = record(galileo_header(), &[0xF0, 0x30, 0xF1, 0x00, 0x00]);
        assert!(matches!(decode(GALILEO, &data), Err(Error::DataFormat(_))));
    }

    #[test]
    fn test_datetime() {
        let data = record(galileo_header(), &[]);
        let ctx = Context::new().into_shared();
        let mut parser = UwatecSmartParser::new(ctx, GALILEO, &data).unwrap();
        let expected = NaiveDate::from_ymd_opt(2000, 1, 1)
            .unwrap()
            .and_hms_opt(2, 0, 0)
            .unwrap();
        assert_eq!(parser.datetime().unwrap(), expected);

        parser.set_clock(10_000, 1_700_000_000).unwrap();
        let shifted = DateTime::from_timestamp(1_700_000_000 - 1400 + 3600, 0)
            .unwrap()
            .naive_utc();
        assert_eq!(parser.datetime().unwrap(), shifted);
    }

    #[test]
    fn test_rejects_unknown_model_and_short_record() {
        let ctx = Context::new().into_shared();
        assert!(matches!(
            UwatecSmartParser::new(Arc::clone(&ctx), 0x99, &[0u8; 200]),
            Err(Error::Unsupported)
        ));
        assert!(matches!(
            UwatecSmartParser::new(ctx, GALILEO, &[0u8; 100]),
            Err(Error::DataFormat(_))
        ));
    }

    /// Galileo stream for `(depth, temperature)` raw points, choosing the
    /// one-byte delta opcodes whenever the change fits.
    fn encode_galileo(points: &[(i32, i32)]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut previous: Option<(i32, i32)> = None;
        for &(depth, temperature) in points {
            match previous {
                Some((_, t)) if t == temperature => {}
                Some((_, t)) if (-8..=7).contains(&(temperature - t)) => {
                    out.push(0xB0 | ((temperature - t) as u8 & 0x0F));
                }
                _ => {
                    out.push(0xF3);
                    out.extend_from_slice(&(temperature as u16).to_be_bytes());
                }
            }
            match previous {
                Some((d, _)) if (-64..=63).contains(&(depth - d)) => {
                    out.push((depth - d) as u8 & 0x7F);
                }
                _ => {
                    out.push(0xF1);
                    out.extend_from_slice(&(depth as u16).to_be_bytes());
                }
            }
            previous = Some((depth, temperature));
        }
        out
    }

    /// Raw points back from decoded samples.
    fn raw_points(samples: &[Sample]) -> Vec<(i32, i32)> {
        let mut points = Vec::new();
        let mut temperature = 0;
        for sample in samples {
            match *sample {
                Sample::Temperature(t) => temperature = (t * TEMPERATURE_DIVISOR).round() as i32,
                Sample::Depth(depth) => {
                    let bar = depth * WaterType::Salt.density() * GRAVITY / BAR;
                    points.push(((bar / DEPTH_UNIT).round() as i32, temperature));
                }
                _ => {}
            }
        }
        points
    }

    #[test]
    fn test_encoded_profile_decodes_and_reencodes() {
        let points = [
            (0, 60),
            (30, 60),
            (95, 58),
            (300, 50),
            (290, 49),
            (290, 49),
            (120, 55),
            (0, 58),
        ];
        let stream = encode_galileo(&points);
        let data = record(vec![0u8; 152], &stream);
        let samples = decode(GALILEO, &data).unwrap();

        let mut expected = Vec::new();
        for (i, &(depth, temperature)) in points.iter().enumerate() {
            expected.push(Sample::Time(4 * i as u32));
            expected.push(Sample::Temperature(f64::from(temperature) / TEMPERATURE_DIVISOR));
            expected.push(Sample::Depth(salt(depth)));
        }
        assert_eq!(samples, expected);

        let decoded = raw_points(&samples);
        assert_eq!(decoded, points);
        assert_eq!(encode_galileo(&decoded), stream);
    }
}
