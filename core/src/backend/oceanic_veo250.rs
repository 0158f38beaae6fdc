//! Oceanic Veo 250 over serial 9600-8N1.
//!
//! The link opens with `0x55 0x00` and a `PPS--OK_V<major>.<minor>` banner.
//! Memory is read in 16-byte pages, each acknowledged with `0x5A` and closed
//! by an additive checksum. Dives are tracked by a logbook ring whose
//! entries point into a separate profile ring.

use std::ops::ControlFlow;
use std::sync::Arc;

use nom::bytes::complete::tag;
use nom::character::complete::{char, u8 as decimal};
use nom::combinator::eof;
use nom::{IResult, Parser};

use crate::array::{bcd2dec, is_filled, u16_be, u16_le};
use crate::checksum::add8;
use crate::context::Context;
use crate::device::{DevInfo, DeviceBackend, DeviceBase, DiveCallback, Family, RetryPolicy};
use crate::error::{Error, Result};
use crate::iostream::{Direction, IoStreamExt, Port, SerialSettings};
use crate::ringbuffer::{Ring, RingMode};

pub const PAGESIZE: u32 = 16;
pub const SZ_MEMORY: u32 = 0x8000;
pub const CF_DEVINFO: u32 = 0x0000;
pub const CF_POINTERS: u32 = 0x0040;
pub const RB_LOGBOOK_BEGIN: u32 = 0x0400;
pub const RB_LOGBOOK_END: u32 = 0x0600;
pub const SZ_LOGBOOK: u32 = 8;
pub const RB_PROFILE_BEGIN: u32 = 0x0600;
pub const RB_PROFILE_END: u32 = SZ_MEMORY;
/// The whole logbook entry identifies a dive.
pub const FINGERPRINT_SIZE: usize = SZ_LOGBOOK as usize;

const CMD_INIT: [u8; 2] = [0x55, 0x00];
const CMD_VERSION: [u8; 2] = [0x90, 0x00];
const CMD_READ: u8 = 0x20;
const CMD_QUIT: [u8; 2] = [0x98, 0x00];
const ACK: u8 = 0x5A;
const NAK: u8 = 0xA5;
const SZ_BANNER: usize = 13;
const TIMEOUT_MS: i32 = 3000;
const DEFAULT_RETRY: RetryPolicy = RetryPolicy::new(2, 100);

/// Firmware version announced in the init banner.
pub fn banner(input: &str) -> IResult<&str, (u8, u8)> {
    let (input, (_, major, _, minor, _)) =
        (tag("PPS--OK_V"), decimal, char('.'), decimal, eof).parse(input)?;
    Ok((input, (major, minor)))
}

/// Profile ring span recorded in a logbook entry: `[begin, end)`.
fn profile_span(entry: &[u8]) -> (u32, u32) {
    (u32::from(u16_le(entry, 4)), u32::from(u16_le(entry, 6)))
}

pub struct OceanicVeo250<'a> {
    pub(crate) base: DeviceBase<'a>,
    retry: RetryPolicy,
    firmware: (u8, u8),
    quit_sent: bool,
}

impl<'a> OceanicVeo250<'a> {
    pub fn open(ctx: Arc<Context>, port: Port<'a>) -> Result<Self> {
        let mut base = DeviceBase::new(ctx, port, FINGERPRINT_SIZE);
        match base.port.configure(&SerialSettings::n81(9600)) {
            Err(Error::Unsupported) => {}
            other => other?,
        }
        let timeout = base.timeout_ms(TIMEOUT_MS);
        base.port.set_timeout(timeout)?;
        base.port.set_dtr(true)?;
        base.port.set_rts(true)?;
        base.port.sleep(100)?;
        base.port.purge_lenient(Direction::All)?;
        let retry = base.retry_policy(DEFAULT_RETRY);

        let mut device = OceanicVeo250 {
            base,
            retry,
            firmware: (0, 0),
            quit_sent: false,
        };
        device.firmware = device.init()?;
        tracing::debug!(major = device.firmware.0, minor = device.firmware.1, "link up");
        Ok(device)
    }

    fn init(&mut self) -> Result<(u8, u8)> {
        self.base.port.write_all(&CMD_INIT)?;
        let answer = self.base.port.read_vec(SZ_BANNER)?;
        let text = std::str::from_utf8(&answer)
            .map_err(|_| Error::protocol("init banner is not text"))?;
        banner(text)
            .map(|(_, version)| version)
            .map_err(|_| Error::protocol(format!("unexpected init banner {text:?}")))
    }

    fn send(&mut self, command: &[u8]) -> Result<()> {
        self.base.check_cancelled()?;
        self.base.port.write_all(command)?;
        match self.base.port.read_byte()? {
            ACK => Ok(()),
            NAK => Err(Error::protocol(format!("command {:#04x} refused", command[0]))),
            other => Err(Error::protocol(format!("unexpected answer {other:#04x}"))),
        }
    }

    /// One acknowledged command answered by a checksummed page.
    fn transfer(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        let retry = self.retry;
        retry.run(|attempt| {
            if attempt > 0 {
                self.base.prepare_retry(retry.delay_ms)?;
            }
            self.send(command)?;
            let mut page = self.base.port.read_vec(PAGESIZE as usize + 1)?;
            let crc = page.pop().unwrap_or_default();
            if add8(&page, 0) != crc {
                return Err(Error::protocol("page checksum mismatch"));
            }
            Ok(page)
        })
    }

    /// Version string, padded to one page.
    pub fn version(&mut self) -> Result<Vec<u8>> {
        self.transfer(&CMD_VERSION)
    }

    pub fn firmware(&self) -> (u8, u8) {
        self.firmware
    }

    fn read_page(&mut self, number: u32) -> Result<Vec<u8>> {
        let [lo, hi, ..] = number.to_le_bytes();
        self.transfer(&[CMD_READ, lo, hi, 0x00])
    }

    /// Read `len` bytes of the ring starting at `from`, following the wrap.
    fn read_ring(&mut self, ring: &Ring, from: u32, len: u32) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(len as usize);
        let mut at = from;
        while (data.len() as u32) < len {
            let chunk = (ring.end() - at).min(len - data.len() as u32);
            data.extend(self.read(at, chunk as usize)?);
            at = ring.increment(at, chunk)?;
        }
        Ok(data)
    }
}

impl<'a> DeviceBackend<'a> for OceanicVeo250<'a> {
    fn family(&self) -> Family {
        Family::OceanicVeo250
    }

    fn base(&self) -> &DeviceBase<'a> {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DeviceBase<'a> {
        &mut self.base
    }

    fn read(&mut self, address: u32, size: usize) -> Result<Vec<u8>> {
        let size = size as u32;
        if address % PAGESIZE != 0 || size % PAGESIZE != 0 {
            return Err(Error::invalid_args(format!(
                "{size} bytes at {address:#x} not aligned to {PAGESIZE} byte pages"
            )));
        }
        if address.checked_add(size).map_or(true, |end| end > SZ_MEMORY) {
            return Err(Error::invalid_args(format!("{size} bytes at {address:#x} out of range")));
        }

        let mut data = Vec::with_capacity(size as usize);
        for number in address / PAGESIZE..(address + size) / PAGESIZE {
            data.extend(self.read_page(number)?);
            self.base.advance_progress(PAGESIZE);
        }
        Ok(data)
    }

    fn dump(&mut self) -> Result<Vec<u8>> {
        self.base.begin_operation(SZ_MEMORY);
        let version = self.version()?;
        self.base.emit_vendor(&version);
        let image = self.read(0, SZ_MEMORY as usize)?;
        self.base.finish_progress();
        Ok(image)
    }

    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        let logbook_ring = Ring::new(RB_LOGBOOK_BEGIN, RB_LOGBOOK_END)?;
        let profile_ring = Ring::new(RB_PROFILE_BEGIN, RB_PROFILE_END)?;
        self.base.begin_operation(PAGESIZE * 3 + logbook_ring.size());

        let version = self.version()?;
        self.base.advance_progress(PAGESIZE);
        self.base.emit_vendor(&version);

        let devinfo = self.read(CF_DEVINFO, PAGESIZE as usize)?;
        let serial = devinfo[..3]
            .iter()
            .fold(0u32, |acc, &b| acc * 100 + u32::from(bcd2dec(b)));
        self.base.emit_devinfo(DevInfo {
            model: u32::from(u16_be(&devinfo, 8)),
            firmware: (u32::from(self.firmware.0) << 8) | u32::from(self.firmware.1),
            serial,
        });

        let pointers = self.read(CF_POINTERS, PAGESIZE as usize)?;
        let first = u32::from(u16_le(&pointers, 4));
        let last = u32::from(u16_le(&pointers, 6));
        if is_filled(&pointers[4..8], 0xFF) {
            tracing::debug!("logbook is empty");
            self.base.finish_progress();
            return Ok(());
        }
        if !logbook_ring.contains(first)
            || !logbook_ring.contains(last)
            || (first - RB_LOGBOOK_BEGIN) % SZ_LOGBOOK != 0
            || (last - RB_LOGBOOK_BEGIN) % SZ_LOGBOOK != 0
        {
            return Err(Error::data_format(format!(
                "logbook pointers {first:#x}..{last:#x} outside the ring"
            )));
        }

        let logbook = self.read(RB_LOGBOOK_BEGIN, logbook_ring.size() as usize)?;
        let past_last = logbook_ring.increment(last, SZ_LOGBOOK)?;
        let count = logbook_ring.distance(first, past_last, RingMode::Full)? / SZ_LOGBOOK;

        // Newest first, stopping at the stored fingerprint.
        let mut work = Vec::new();
        let mut profile_bytes = 0;
        let mut at = last;
        for _ in 0..count {
            let offset = (at - RB_LOGBOOK_BEGIN) as usize;
            let entry = &logbook[offset..offset + SZ_LOGBOOK as usize];
            at = logbook_ring.decrement(at, SZ_LOGBOOK)?;
            if is_filled(entry, 0xFF) {
                continue;
            }
            if self.base.matches_fingerprint(entry) {
                break;
            }
            let (begin, end) = profile_span(entry);
            if !profile_ring.contains(begin)
                || !profile_ring.contains(end)
                || begin % PAGESIZE != 0
                || end % PAGESIZE != 0
            {
                return Err(Error::data_format(format!(
                    "profile {begin:#x}..{end:#x} outside the ring"
                )));
            }
            let length = profile_ring.distance(begin, end, RingMode::Empty)?;
            profile_bytes += length;
            work.push((entry.to_vec(), begin, length));
        }
        let done = self.base.progress().current;
        self.base.set_progress_maximum(done + profile_bytes);
        tracing::debug!(dives = work.len(), profile_bytes, "download planned");

        for (entry, begin, length) in work {
            let profile = self.read_ring(&profile_ring, begin, length)?;
            let mut dive = entry.clone();
            dive.extend(profile);
            if let ControlFlow::Break(()) = self.base.deliver(callback, &dive, &entry) {
                break;
            }
        }
        self.base.finish_progress();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.quit_sent && !self.base.is_closed() {
            self.quit_sent = true;
            if let Err(e) = self.base.port.write_all(&CMD_QUIT) {
                tracing::warn!(error = %e, "failed to end the session");
            }
        }
        self.base.close()
    }
}
