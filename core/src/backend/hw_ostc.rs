//! Heinrichs Weikamp OSTC (original through 2C). A single `'a'` command
//! streams the whole memory; the profile area is already in chronological
//! order, so dives are found by their start and end markers.

use std::ops::ControlFlow;
use std::sync::Arc;

use chrono::{Datelike, NaiveDateTime, Timelike};

use crate::array::{search_backward, search_forward, u16_be, u16_le};
use crate::context::Context;
use crate::device::{DevInfo, DeviceBackend, DeviceBase, DiveCallback, Family};
use crate::error::{Error, Result};
use crate::extract::deliver;
use crate::iostream::{Direction, IoStreamExt, Port, SerialSettings};

/// Image length including the preamble.
pub const SZ_MEMORY: usize = 33792;
pub const FINGERPRINT_SIZE: usize = 5;

const PREAMBLE: [u8; 5] = [0xAA, 0xAA, 0xAA, 0xAA, 0x55];
const PROFILE_BEGIN: usize = 266;
const DIVE_START: [u8; 2] = [0xFA, 0xFA];
const DIVE_END: [u8; 2] = [0xFD, 0xFD];
const CHUNK: usize = 1024;
const TIMEOUT_MS: i32 = 4000;

/// Model and firmware from the EEPROM copy at the front of the image.
pub fn devinfo(image: &[u8]) -> Result<DevInfo> {
    if image.len() < PROFILE_BEGIN {
        return Err(Error::data_format("memory image too short for its header"));
    }
    let serial = u32::from(u16_le(image, 6));
    let model = match serial {
        s if s > 7000 => 3,
        s if s > 2048 => 2,
        s if s > 300 => 1,
        _ => 0,
    };
    Ok(DevInfo {
        model,
        firmware: u32::from(u16_be(image, 264)),
        serial,
    })
}

pub fn extract_dives(image: &[u8], fingerprint: &[u8], callback: &mut DiveCallback<'_>) -> Result<()> {
    if image.len() < PROFILE_BEGIN || image[..PREAMBLE.len()] != PREAMBLE {
        return Err(Error::data_format("not an OSTC memory image"));
    }

    let mut limit = image.len();
    while let Some(start) = search_backward(&image[PROFILE_BEGIN..limit], &DIVE_START) {
        let start = PROFILE_BEGIN + start;
        let body = start + DIVE_START.len();

        // The end marker must come before the next dive starts.
        let Some(end) = search_forward(&image[body..limit], &DIVE_END) else {
            return Err(Error::data_format(format!("dive at {start:#x} has no end marker")));
        };
        limit = start;
        let end = body + end + DIVE_END.len();
        let dive = &image[start..end];
        if dive.len() < 3 + FINGERPRINT_SIZE {
            return Err(Error::data_format(format!("dive at {start:#x} is too short")));
        }
        if let ControlFlow::Break(()) = deliver(fingerprint, callback, dive, &dive[3..3 + FINGERPRINT_SIZE]) {
            break;
        }
    }
    Ok(())
}

pub struct HwOstc<'a> {
    pub(crate) base: DeviceBase<'a>,
}

impl<'a> HwOstc<'a> {
    pub fn open(ctx: Arc<Context>, port: Port<'a>) -> Result<Self> {
        let mut base = DeviceBase::new(ctx, port, FINGERPRINT_SIZE);
        match base.port.configure(&SerialSettings::n81(115200)) {
            Err(Error::Unsupported) => {}
            other => other?,
        }
        let timeout = base.timeout_ms(TIMEOUT_MS);
        base.port.set_timeout(timeout)?;
        base.port.purge_lenient(Direction::All)?;
        Ok(HwOstc { base })
    }
}

impl<'a> DeviceBackend<'a> for HwOstc<'a> {
    fn family(&self) -> Family {
        Family::HwOstc
    }

    fn base(&self) -> &DeviceBase<'a> {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DeviceBase<'a> {
        &mut self.base
    }

    fn dump(&mut self) -> Result<Vec<u8>> {
        self.base.begin_operation(SZ_MEMORY as u32);
        self.base.check_cancelled()?;
        self.base.port.write_all(b"a")?;

        let preamble = self.base.port.read_vec(PREAMBLE.len())?;
        if preamble != PREAMBLE {
            return Err(Error::protocol("unexpected dump preamble"));
        }
        let mut image = preamble;
        self.base.advance_progress(PREAMBLE.len() as u32);

        while image.len() < SZ_MEMORY {
            self.base.check_cancelled()?;
            let len = CHUNK.min(SZ_MEMORY - image.len());
            let chunk = self.base.port.read_vec(len)?;
            image.extend_from_slice(&chunk);
            self.base.advance_progress(len as u32);
        }

        let info = devinfo(&image)?;
        self.base.emit_devinfo(info);
        Ok(image)
    }

    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        let image = self.dump()?;
        extract_dives(&image, self.base.fingerprint(), callback)
    }

    fn timesync(&mut self, datetime: &NaiveDateTime) -> Result<()> {
        let year = datetime.year() - 2000;
        if !(0..=255).contains(&year) {
            return Err(Error::invalid_args(format!("year {} out of range", datetime.year())));
        }
        self.base.check_cancelled()?;
        self.base.port.write_all(b"b")?;
        if self.base.port.read_byte()? != b'b' {
            return Err(Error::protocol("clock command not echoed"));
        }
        let packet = [
            datetime.hour() as u8,
            datetime.minute() as u8,
            datetime.second() as u8,
            datetime.month() as u8,
            datetime.day() as u8,
            year as u8,
        ];
        self.base.port.write_all(&packet)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::iostream::mock::MockStream;
    use crate::iostream::Transport;

    fn dive(stamp: u8, samples: usize) -> Vec<u8> {
        let mut dive = vec![0xFA, 0xFA, 0x20, stamp, 1, 2, 3, 4];
        dive.resize(47, 0x00);
        dive.extend(std::iter::repeat(0x33).take(samples));
        dive.extend_from_slice(&DIVE_END);
        dive
    }

    fn image() -> Vec<u8> {
        let mut image = vec![0u8; SZ_MEMORY];
        image[..5].copy_from_slice(&PREAMBLE);
        image[6..8].copy_from_slice(&2500u16.to_le_bytes());
        image[264..266].copy_from_slice(&0x0195u16.to_be_bytes());
        let mut at = PROFILE_BEGIN;
        for (stamp, samples) in [(1u8, 10usize), (2, 20), (3, 30)] {
            let d = dive(stamp, samples);
            image[at..at + d.len()].copy_from_slice(&d);
            at += d.len();
        }
        image
    }

    fn stamps(image: &[u8], fingerprint: &[u8]) -> Vec<u8> {
        let mut found = Vec::new();
        extract_dives(image, fingerprint, &mut |_dive: &[u8], fp: &[u8]| {
            found.push(fp[0]);
            true
        })
        .unwrap();
        found
    }

    #[test]
    fn test_dives_newest_first() {
        assert_eq!(stamps(&image(), &[]), vec![3, 2, 1]);
    }

    #[test]
    fn test_fingerprint_stop() {
        assert_eq!(stamps(&image(), &[2, 1, 2, 3, 4]), vec![3]);
    }

    #[test]
    fn test_unterminated_newest_dive() {
        let mut image = image();
        let d = dive(4, 5);
        let at = SZ_MEMORY - 40;
        image[at..at + 40].copy_from_slice(&d[..40]);
        let err = extract_dives(&image, &[], &mut |_: &[u8], _: &[u8]| true).unwrap_err();
        assert!(matches!(err, Error::DataFormat(_)));
    }

    #[test]
    fn test_missing_end_marker_does_not_reach_next_dive() {
        let mut image = vec![0u8; SZ_MEMORY];
        image[..5].copy_from_slice(&PREAMBLE);
        let mut older = dive(1, 10);
        older.truncate(older.len() - DIVE_END.len());
        let newer = dive(2, 22);
        let at = PROFILE_BEGIN + older.len();
        image[PROFILE_BEGIN..at].copy_from_slice(&older);
        image[at..at + newer.len()].copy_from_slice(&newer);

        let mut found = Vec::new();
        let result = extract_dives(&image, &[], &mut |dive: &[u8], fp: &[u8]| {
            found.push((fp[0], dive.len()));
            true
        });
        assert!(matches!(result, Err(Error::DataFormat(_))));
        assert_eq!(found, vec![(2, newer.len())]);
    }

    #[test]
    fn test_devinfo_model_from_serial() {
        let info = devinfo(&image()).unwrap();
        assert_eq!(info.model, 2);
        assert_eq!(info.serial, 2500);
        assert_eq!(info.firmware, 0x0195);
    }

    #[test]
    fn test_dump_over_link() {
        let memory = image();
        let mut stream = MockStream::with_responder(Transport::Serial, move |data| match data {
            b"a" => memory.clone(),
            _ => Vec::new(),
        });
        let ctx = Context::new().into_shared();
        let mut device = HwOstc::open(ctx, Port::Borrowed(&mut stream)).unwrap();
        let dumped = device.dump().unwrap();
        assert_eq!(dumped, image());
        assert_eq!(device.base.progress().current, SZ_MEMORY as u32);
    }

    #[test]
    fn test_bad_preamble_is_protocol() {
        let mut stream = MockStream::with_responder(Transport::Serial, |_| vec![0u8; 16]);
        let ctx = Context::new().into_shared();
        let mut device = HwOstc::open(ctx, Port::Borrowed(&mut stream)).unwrap();
        assert!(matches!(device.dump(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_timesync_packet() {
        let mut stream = MockStream::with_responder(Transport::Serial, |data| match data {
            b"b" => b"b".to_vec(),
            _ => Vec::new(),
        });
        let ctx = Context::new().into_shared();
        let mut device = HwOstc::open(ctx, Port::Borrowed(&mut stream)).unwrap();
        let when = NaiveDate::from_ymd_opt(2024, 7, 14)
            .unwrap()
            .and_hms_opt(9, 30, 5)
            .unwrap();
        device.timesync(&when).unwrap();
        drop(device);
        assert_eq!(stream.writes()[1], vec![9, 30, 5, 7, 14, 24]);
    }
}
