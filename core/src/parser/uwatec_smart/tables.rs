//! Per-model opcode, alarm and header tables for the Uwatec Smart family.

use crate::parser::bitstream::OpcodeScheme;

use SampleKind::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    PressureDepth,
    Rbt,
    Temperature,
    Pressure,
    Depth,
    HeartRate,
    Bearing,
    Alarms,
    Time,
    Apnea,
    Misc,
}

/// One opcode of a model's sample table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleInfo {
    pub kind: SampleKind,
    pub absolute: bool,
    /// Tank number for `Pressure`, alarm byte for `Alarms`.
    pub index: usize,
    pub type_bits: u32,
    pub ignore_type_lowbits: bool,
    pub extra_bytes: usize,
}

const fn op(
    kind: SampleKind,
    absolute: bool,
    index: usize,
    type_bits: u32,
    ignore_type_lowbits: bool,
    extra_bytes: usize,
) -> SampleInfo {
    SampleInfo {
        kind,
        absolute,
        index,
        type_bits,
        ignore_type_lowbits,
        extra_bytes,
    }
}

pub static SMART_PRO_SAMPLES: [SampleInfo; 8] = [
    op(Depth, false, 0, 1, false, 0),       // 0ddddddd
    op(Temperature, false, 0, 2, false, 0), // 10dddddd
    op(Time, true, 0, 3, false, 0),         // 110ddddd
    op(Alarms, true, 0, 4, false, 0),       // 1110dddd
    op(Depth, false, 0, 5, false, 1),       // 11110ddd dddddddd
    op(Temperature, false, 0, 6, false, 1), // 111110dd dddddddd
    op(Depth, true, 0, 7, true, 2),         // 1111110d dddddddd dddddddd
    op(Temperature, true, 0, 8, false, 2),  // 11111110 dddddddd dddddddd
];

pub static ALADIN_SAMPLES: [SampleInfo; 9] = [
    op(Depth, false, 0, 1, false, 0),       // 0ddddddd
    op(Temperature, false, 0, 2, false, 0), // 10dddddd
    op(Time, true, 0, 3, false, 0),         // 110ddddd
    op(Alarms, true, 0, 4, false, 0),       // 1110dddd
    op(Depth, false, 0, 5, false, 1),       // 11110ddd dddddddd
    op(Temperature, false, 0, 6, false, 1), // 111110dd dddddddd
    op(Depth, true, 0, 7, true, 2),         // 1111110d dddddddd dddddddd
    op(Temperature, true, 0, 8, false, 2),  // 11111110 dddddddd dddddddd
    op(Alarms, true, 1, 9, false, 0),       // 11111111 0ddddddd
];

pub static SMART_COM_SAMPLES: [SampleInfo; 12] = [
    op(PressureDepth, false, 0, 1, false, 1), // 0ddddddd dddddddd
    op(Rbt, false, 0, 2, false, 0),           // 10dddddd
    op(Temperature, false, 0, 3, false, 0),   // 110ddddd
    op(Pressure, false, 0, 4, false, 1),      // 1110dddd dddddddd
    op(Depth, false, 0, 5, false, 1),         // 11110ddd dddddddd
    op(Temperature, false, 0, 6, false, 1),   // 111110dd dddddddd
    op(Alarms, true, 0, 7, true, 1),          // 1111110d dddddddd
    op(Time, true, 0, 8, false, 1),           // 11111110 dddddddd
    op(Depth, true, 0, 9, true, 2),           // 11111111 0ddddddd dddddddd dddddddd
    op(Pressure, true, 0, 10, true, 2),       // 11111111 10dddddd dddddddd dddddddd
    op(Temperature, true, 0, 11, true, 2),    // 11111111 110ddddd dddddddd dddddddd
    op(Rbt, true, 0, 12, true, 1),            // 11111111 1110dddd dddddddd
];

pub static SMART_TEC_SAMPLES: [SampleInfo; 14] = [
    op(PressureDepth, false, 0, 1, false, 1), // 0ddddddd dddddddd
    op(Rbt, false, 0, 2, false, 0),           // 10dddddd
    op(Temperature, false, 0, 3, false, 0),   // 110ddddd
    op(Pressure, false, 0, 4, false, 1),      // 1110dddd dddddddd
    op(Depth, false, 0, 5, false, 1),         // 11110ddd dddddddd
    op(Temperature, false, 0, 6, false, 1),   // 111110dd dddddddd
    op(Alarms, true, 0, 7, true, 1),          // 1111110d dddddddd
    op(Time, true, 0, 8, false, 1),           // 11111110 dddddddd
    op(Depth, true, 0, 9, true, 2),           // 11111111 0ddddddd dddddddd dddddddd
    op(Temperature, true, 0, 10, true, 2),    // 11111111 10dddddd dddddddd dddddddd
    op(Pressure, true, 0, 11, true, 2),       // 11111111 110ddddd dddddddd dddddddd
    op(Pressure, true, 1, 12, true, 2),       // 11111111 1110dddd dddddddd dddddddd
    op(Pressure, true, 2, 13, true, 2),       // 11111111 11110ddd dddddddd dddddddd
    op(Rbt, true, 0, 14, true, 1),            // 11111111 111110dd dddddddd
];

pub static GALILEO_SAMPLES: [SampleInfo; 23] = [
    op(Depth, false, 0, 1, false, 0),        // 0ddd dddd
    op(Rbt, false, 0, 3, false, 0),          // 100d dddd
    op(Pressure, false, 0, 4, false, 0),     // 1010 dddd
    op(Temperature, false, 0, 4, false, 0),  // 1011 dddd
    op(Time, true, 0, 4, false, 0),          // 1100 dddd
    op(HeartRate, false, 0, 4, false, 0),    // 1101 dddd
    op(Alarms, true, 0, 4, false, 0),        // 1110 dddd
    op(Alarms, true, 1, 8, false, 1),        // 1111 0000 dddddddd
    op(Depth, true, 0, 8, false, 2),         // 1111 0001 dddddddd dddddddd
    op(Rbt, true, 0, 8, false, 1),           // 1111 0010 dddddddd
    op(Temperature, true, 0, 8, false, 2),   // 1111 0011 dddddddd dddddddd
    op(Pressure, true, 0, 8, false, 2),      // 1111 0100 dddddddd dddddddd
    op(Pressure, true, 1, 8, false, 2),      // 1111 0101 dddddddd dddddddd
    op(Pressure, true, 2, 8, false, 2),      // 1111 0110 dddddddd dddddddd
    op(HeartRate, true, 0, 8, false, 1),     // 1111 0111 dddddddd
    op(Bearing, true, 0, 8, false, 2),       // 1111 1000 dddddddd dddddddd
    op(Alarms, true, 2, 8, false, 1),        // 1111 1001 dddddddd
    op(Apnea, true, 0, 8, false, 0),         // 1111 1010 (8 bytes)
    op(Misc, true, 0, 8, false, 1),          // 1111 1011 dddddddd (n-1 bytes)
    op(Alarms, true, 3, 8, false, 1),        // 1111 1100 dddddddd
    op(Alarms, true, 4, 8, false, 1),        // 1111 1101 dddddddd
    op(Misc, true, 0, 8, false, 1),          // 1111 1110 dddddddd (n-1 bytes)
    op(Misc, true, 0, 8, false, 1),          // 1111 1111 dddddddd (n-1 bytes)
];

/// Raw bytes carried by an `Apnea` record.
pub const APNEA_BYTES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmKind {
    Bookmark,
    /// Field holds the id of the active gas mix.
    Gasmix,
}

/// One field packed into an alarm byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmInfo {
    pub kind: AlarmKind,
    pub mask: u32,
    pub shift: u32,
}

const fn alarm(kind: AlarmKind, mask: u32, shift: u32) -> AlarmInfo {
    AlarmInfo { kind, mask, shift }
}

pub static NO_ALARMS: [&[AlarmInfo]; 0] = [];

pub static SMART_TEC_ALARMS: [&[AlarmInfo]; 1] = [&[
    alarm(AlarmKind::Bookmark, 0x80, 7),
    alarm(AlarmKind::Gasmix, 0x30, 4),
]];

pub static GALILEO_ALARMS: [&[AlarmInfo]; 5] = [
    &[alarm(AlarmKind::Bookmark, 0x04, 2)],
    &[alarm(AlarmKind::Gasmix, 0x30, 4)],
    &[],
    &[],
    &[],
];

/// Byte offsets of the summary fields in a dive header. Temperatures are
/// signed tenths of a degree, tank pressures 1/128 bar, the dive time
/// minutes; the maximum depth uses the sample depth unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLayout {
    pub maxdepth: usize,
    pub divetime: usize,
    /// Oxygen percentages, 16 bits each.
    pub gasmix: Option<usize>,
    pub ngases: usize,
    pub temp_minimum: usize,
    pub temp_maximum: Option<usize>,
    pub temp_surface: Option<usize>,
    /// Begin and end pressure per tank, 16 bits each.
    pub tankpressure: Option<usize>,
    /// Signed quarter hours east of UTC.
    pub timezone: Option<usize>,
    /// Dive mode in bits 0-1, fresh water in bit 2.
    pub settings: Option<usize>,
}

static SMART_PRO_HEADER: HeaderLayout = HeaderLayout {
    maxdepth: 18,
    divetime: 20,
    gasmix: Some(24),
    ngases: 1,
    temp_minimum: 22,
    temp_maximum: None,
    temp_surface: None,
    tankpressure: None,
    timezone: None,
    settings: None,
};

static ALADIN_HEADER: HeaderLayout = HeaderLayout {
    maxdepth: 22,
    divetime: 24,
    gasmix: Some(30),
    ngases: 1,
    temp_minimum: 26,
    temp_maximum: Some(28),
    temp_surface: None,
    tankpressure: None,
    timezone: None,
    settings: None,
};

static SMART_COM_HEADER: HeaderLayout = HeaderLayout {
    maxdepth: 18,
    divetime: 20,
    gasmix: Some(24),
    ngases: 1,
    temp_minimum: 22,
    temp_maximum: None,
    temp_surface: None,
    tankpressure: Some(30),
    timezone: None,
    settings: None,
};

static SMART_TEC_HEADER: HeaderLayout = HeaderLayout {
    maxdepth: 18,
    divetime: 20,
    gasmix: Some(28),
    ngases: 3,
    temp_minimum: 22,
    temp_maximum: None,
    temp_surface: None,
    tankpressure: Some(34),
    timezone: None,
    settings: None,
};

static GALILEO_HEADER: HeaderLayout = HeaderLayout {
    maxdepth: 22,
    divetime: 26,
    gasmix: Some(44),
    ngases: 3,
    temp_minimum: 30,
    temp_maximum: Some(28),
    temp_surface: Some(32),
    tankpressure: Some(50),
    timezone: Some(16),
    settings: Some(43),
};

/// Everything the parser needs to know about one model.
#[derive(Debug, Clone, Copy)]
pub struct ModelInfo {
    pub name: &'static str,
    pub header_size: usize,
    pub scheme: OpcodeScheme,
    pub samples: &'static [SampleInfo],
    pub alarms: &'static [&'static [AlarmInfo]],
    pub header: &'static HeaderLayout,
    /// Absolute pressures carry the tank number in their top nibble.
    pub trimix: bool,
}

pub const SMART_PRO: u32 = 0x10;
pub const GALILEO: u32 = 0x11;
pub const ALADIN_TEC: u32 = 0x12;
pub const ALADIN_TEC_2G: u32 = 0x13;
pub const SMART_COM: u32 = 0x14;
pub const ALADIN_2G: u32 = 0x15;
pub const SMART_TEC: u32 = 0x18;
pub const GALILEO_TRIMIX: u32 = 0x19;
pub const SMART_Z: u32 = 0x1C;
pub const MERIDIAN: u32 = 0x20;
pub const ALADIN_SQUARE: u32 = 0x22;
pub const CHROMIS: u32 = 0x24;
pub const G2: u32 = 0x32;

fn galileo(name: &'static str, trimix: bool) -> ModelInfo {
    ModelInfo {
        name,
        header_size: 152,
        scheme: OpcodeScheme::Galileo,
        samples: &GALILEO_SAMPLES,
        alarms: &GALILEO_ALARMS,
        header: &GALILEO_HEADER,
        trimix,
    }
}

fn aladin(name: &'static str) -> ModelInfo {
    ModelInfo {
        name,
        header_size: 108,
        scheme: OpcodeScheme::Smart,
        samples: &ALADIN_SAMPLES,
        alarms: &NO_ALARMS,
        header: &ALADIN_HEADER,
        trimix: false,
    }
}

pub fn model_info(model: u32) -> Option<ModelInfo> {
    let info = match model {
        SMART_PRO => ModelInfo {
            name: "Smart Pro",
            header_size: 92,
            scheme: OpcodeScheme::Smart,
            samples: &SMART_PRO_SAMPLES,
            alarms: &NO_ALARMS,
            header: &SMART_PRO_HEADER,
            trimix: false,
        },
        SMART_COM => ModelInfo {
            name: "Smart Com",
            header_size: 100,
            scheme: OpcodeScheme::Smart,
            samples: &SMART_COM_SAMPLES,
            alarms: &NO_ALARMS,
            header: &SMART_COM_HEADER,
            trimix: false,
        },
        SMART_TEC => ModelInfo {
            name: "Smart Tec",
            header_size: 132,
            scheme: OpcodeScheme::Smart,
            samples: &SMART_TEC_SAMPLES,
            alarms: &SMART_TEC_ALARMS,
            header: &SMART_TEC_HEADER,
            trimix: false,
        },
        ALADIN_TEC => aladin("Aladin Tec"),
        ALADIN_TEC_2G => aladin("Aladin Tec 2G"),
        ALADIN_2G => aladin("Aladin 2G"),
        GALILEO => galileo("Galileo Sol", false),
        GALILEO_TRIMIX => galileo("Galileo Trimix", true),
        SMART_Z => galileo("Smart Z", false),
        MERIDIAN => galileo("Meridian", false),
        ALADIN_SQUARE => galileo("Aladin Square", false),
        CHROMIS => galileo("Chromis", false),
        G2 => galileo("G2", false),
        _ => return None,
    };
    Some(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::bitstream::BitReader;

    /// Opcode `i` of a Smart table is `i` one bits and a zero; the entry
    /// must describe exactly that many type bits.
    #[test]
    fn test_smart_tables_match_prefix_lengths() {
        for table in [
            &SMART_PRO_SAMPLES[..],
            &ALADIN_SAMPLES[..],
            &SMART_COM_SAMPLES[..],
            &SMART_TEC_SAMPLES[..],
        ] {
            for (i, info) in table.iter().enumerate() {
                assert_eq!(info.type_bits as usize, i + 1);
            }
        }
    }

    #[test]
    fn test_galileo_table_covers_every_opcode() {
        for byte in 0..=255u8 {
            let opcode = BitReader::new(&[byte]).read_opcode(OpcodeScheme::Galileo);
            assert!(opcode < GALILEO_SAMPLES.len(), "byte {byte:#04x}");
        }
    }

    #[test]
    fn test_gas_and_tank_fields_fit_in_header() {
        for model in [SMART_PRO, ALADIN_TEC, SMART_COM, SMART_TEC, GALILEO] {
            let info = model_info(model).unwrap();
            let layout = info.header;
            if let Some(gasmix) = layout.gasmix {
                assert!(gasmix + 2 * layout.ngases <= info.header_size);
            }
            if let Some(tanks) = layout.tankpressure {
                assert!(tanks + 4 * layout.ngases <= info.header_size);
            }
        }
    }

    #[test]
    fn test_unknown_model() {
        assert!(model_info(0x99).is_none());
    }
}
