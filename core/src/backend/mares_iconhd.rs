//! Mares Icon HD family over serial 115200-8E1.
//!
//! A command is `[cmd, 0x42]`; the device acknowledges with `0xAA`, takes
//! the parameters, sends the payload and closes with `0xEA`. Memory is read
//! at arbitrary addresses. Dives sit in a ring, each stored as a length word,
//! the samples, then the dive header.

use std::ops::ControlFlow;
use std::sync::Arc;

use crate::array::{u16_le, u32_le};
use crate::context::Context;
use crate::device::{DevInfo, DeviceBackend, DeviceBase, DiveCallback, Family, RetryPolicy};
use crate::error::{Error, Result};
use crate::extract::deliver;
use crate::iostream::{Direction, IoStreamExt, Parity, Port, SerialSettings};
use crate::ringbuffer::Ring;

pub const SZ_MEMORY: u32 = 0x10_0000;
pub const RB_PROFILE_BEGIN: u32 = 0xA000;
pub const RB_PROFILE_END: u32 = SZ_MEMORY;
/// Dive header stored behind the samples.
pub const SZ_HEADER: usize = 0x5C;
pub const SZ_SAMPLE: usize = 8;
pub const FINGERPRINT_SIZE: usize = 4;
/// Within the dive header.
pub const FINGERPRINT_OFFSET: usize = 6;
/// Within the dive header.
pub const NSAMPLES_OFFSET: usize = 2;
/// Copies of the end-of-profile pointer, tried in order.
pub const EOP_POINTERS: [usize; 2] = [0x2001, 0x3001];
pub const SERIAL_OFFSET: usize = 0x0C;

const CMD_VERSION: u8 = 0xC2;
const CMD_READ: u8 = 0xE7;
const CMD_SUFFIX: u8 = 0x42;
const ACK: u8 = 0xAA;
const END: u8 = 0xEA;
const SZ_VERSION: usize = 140;
const SZ_PACKET: u32 = 256;
const TIMEOUT_MS: i32 = 1000;
const DEFAULT_RETRY: RetryPolicy = RetryPolicy::new(2, 100);

/// Walk the profile ring back from the end-of-profile pointer.
pub fn extract_dives(image: &[u8], fingerprint: &[u8], callback: &mut DiveCallback<'_>) -> Result<()> {
    if image.len() < SZ_MEMORY as usize {
        return Err(Error::data_format(format!(
            "memory image of {} bytes, expected {SZ_MEMORY}",
            image.len()
        )));
    }

    let Some(eop) = EOP_POINTERS
        .iter()
        .map(|&at| u32_le(image, at))
        .find(|&eop| eop != 0xFFFF_FFFF)
    else {
        tracing::debug!("no dives recorded");
        return Ok(());
    };
    let ring = Ring::new(RB_PROFILE_BEGIN, RB_PROFILE_END)?;
    if !ring.contains(eop) {
        return Err(Error::data_format(format!("end of profile {eop:#x} outside the ring")));
    }

    let linear = ring.linearize(image, eop)?;
    let mut offset = linear.len();
    while offset >= SZ_HEADER + 4 {
        let header = &linear[offset - SZ_HEADER..offset];
        let nsamples = u16_le(header, NSAMPLES_OFFSET);
        if nsamples == 0xFFFF {
            break;
        }
        let nbytes = 4 + SZ_HEADER + usize::from(nsamples) * SZ_SAMPLE;
        if nbytes > offset {
            return Err(Error::data_format(format!(
                "dive of {nbytes} bytes overruns the ring at {offset:#x}"
            )));
        }
        let dive = &linear[offset - nbytes..offset];
        let length = u32_le(dive, 0) as usize;
        if length != nbytes {
            return Err(Error::data_format(format!(
                "dive length {length} disagrees with {nsamples} samples"
            )));
        }

        let fp = &header[FINGERPRINT_OFFSET..FINGERPRINT_OFFSET + FINGERPRINT_SIZE];
        if let ControlFlow::Break(()) = deliver(fingerprint, callback, dive, fp) {
            break;
        }
        offset -= nbytes;
    }
    Ok(())
}

pub struct MaresIconHd<'a> {
    pub(crate) base: DeviceBase<'a>,
    retry: RetryPolicy,
    model: u32,
    version: Vec<u8>,
}

impl<'a> MaresIconHd<'a> {
    pub fn open(ctx: Arc<Context>, port: Port<'a>, model: u32) -> Result<Self> {
        let mut base = DeviceBase::new(ctx, port, FINGERPRINT_SIZE);
        let mut settings = SerialSettings::n81(115200);
        settings.parity = Parity::Even;
        match base.port.configure(&settings) {
            Err(Error::Unsupported) => {}
            other => other?,
        }
        let timeout = base.timeout_ms(TIMEOUT_MS);
        base.port.set_timeout(timeout)?;
        base.port.set_dtr(false)?;
        base.port.set_rts(false)?;
        base.port.sleep(100)?;
        base.port.purge_lenient(Direction::All)?;
        let retry = base.retry_policy(DEFAULT_RETRY);

        let mut device = MaresIconHd {
            base,
            retry,
            model,
            version: Vec::new(),
        };
        device.version = device.transfer(CMD_VERSION, &[], SZ_VERSION)?;
        Ok(device)
    }

    fn exchange(&mut self, cmd: u8, params: &[u8], size: usize) -> Result<Vec<u8>> {
        self.base.check_cancelled()?;
        self.base.port.write_all(&[cmd, CMD_SUFFIX])?;
        let header = self.base.port.read_byte()?;
        if header != ACK {
            return Err(Error::protocol(format!(
                "command {cmd:#04x} answered with {header:#04x}"
            )));
        }
        if !params.is_empty() {
            self.base.port.write_all(params)?;
        }
        let answer = self.base.port.read_vec(size)?;
        let trailer = self.base.port.read_byte()?;
        if trailer != END {
            return Err(Error::protocol(format!("packet ends with {trailer:#04x}")));
        }
        Ok(answer)
    }

    fn transfer(&mut self, cmd: u8, params: &[u8], size: usize) -> Result<Vec<u8>> {
        let retry = self.retry;
        retry.run(|attempt| {
            if attempt > 0 {
                self.base.prepare_retry(retry.delay_ms)?;
            }
            self.exchange(cmd, params, size)
        })
    }

    /// Model name reported by the version packet.
    pub fn product(&self) -> String {
        let name = self.version.get(0x46..0x56).unwrap_or_default();
        String::from_utf8_lossy(name)
            .trim_end_matches(['\0', ' '])
            .to_string()
    }
}

impl<'a> DeviceBackend<'a> for MaresIconHd<'a> {
    fn family(&self) -> Family {
        Family::MaresIconHd
    }

    fn base(&self) -> &DeviceBase<'a> {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DeviceBase<'a> {
        &mut self.base
    }

    fn read(&mut self, address: u32, size: usize) -> Result<Vec<u8>> {
        let end = address
            .checked_add(size as u32)
            .filter(|&end| end <= SZ_MEMORY)
            .ok_or_else(|| Error::invalid_args(format!("{size} bytes at {address:#x} out of range")))?;

        let mut data = Vec::with_capacity(size);
        let mut at = address;
        while at < end {
            let len = SZ_PACKET.min(end - at);
            let mut params = at.to_le_bytes().to_vec();
            params.extend_from_slice(&len.to_le_bytes());
            let packet = self.transfer(CMD_READ, &params, len as usize)?;
            data.extend_from_slice(&packet);
            self.base.advance_progress(len);
            at += len;
        }
        Ok(data)
    }

    fn dump(&mut self) -> Result<Vec<u8>> {
        self.base.begin_operation(SZ_MEMORY);
        self.base.emit_vendor(&self.version);
        let image = self.read(0, SZ_MEMORY as usize)?;
        self.base.emit_devinfo(DevInfo {
            model: self.model,
            firmware: 0,
            serial: u32_le(&image, SERIAL_OFFSET),
        });
        self.base.finish_progress();
        Ok(image)
    }

    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        let image = self.dump()?;
        extract_dives(&image, self.base.fingerprint(), callback)
    }
}
