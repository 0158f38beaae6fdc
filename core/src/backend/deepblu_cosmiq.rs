//! Deepblu Cosmiq+ over BLE. Binary packets travel as hex text: the host
//! sends `'#' hex(cmd csum len payload) '\n'` and the device answers with
//! the same layout behind a `'$'`. `len` counts hex digits, so it is twice
//! the payload size.

use std::ops::ControlFlow;
use std::sync::Arc;

use chrono::{Datelike, NaiveDateTime, Timelike};
use nom::combinator::rest;
use nom::number::complete::be_u8;
use nom::{IResult, Parser};

use crate::array::u16_le;
use crate::checksum::{hex_decode, hex_encode, negated_add8};
use crate::context::Context;
use crate::device::{DeviceBackend, DeviceBase, DiveCallback, Family, RetryPolicy};
use crate::error::{Error, Result};
use crate::iostream::{Direction, IoStreamExt, Port};

pub const FINGERPRINT_SIZE: usize = 6;
pub const FINGERPRINT_OFFSET: usize = 6;
pub const SZ_HEADER: usize = 36;
pub const SZ_SAMPLE: usize = 4;
/// Sample count inside the dive header.
pub const NSAMPLES_OFFSET: usize = 34;

const CMD_SET_DATETIME: u8 = 0x20;
const CMD_DIVE_COUNT: u8 = 0x40;
const CMD_DIVE_HEADER: u8 = 0x41;
const CMD_DIVE_PROFILE: u8 = 0x42;

/// Largest payload whose doubled length still fits the length byte.
const MAX_PAYLOAD: usize = 127;
const NSTEPS: u32 = 1000;
const TIMEOUT_MS: i32 = 3000;

/// Hex-armoured request line for `cmd` with `payload`.
pub fn encode_packet(cmd: u8, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD {
        return Err(Error::invalid_args(format!("{} byte payload", payload.len())));
    }
    let length = (payload.len() * 2) as u8;
    let mut summed = vec![cmd, length];
    summed.extend_from_slice(payload);

    let mut raw = vec![cmd, negated_add8(&summed), length];
    raw.extend_from_slice(payload);

    let mut packet = Vec::with_capacity(raw.len() * 2 + 2);
    packet.push(b'#');
    packet.extend_from_slice(hex_encode(&raw).as_bytes());
    packet.push(b'\n');
    Ok(packet)
}

fn fields(input: &[u8]) -> IResult<&[u8], (u8, u8, u8, &[u8])> {
    (be_u8, be_u8, be_u8, rest).parse(input)
}

/// Decode one `'$'` reply line (without its newline) into command and
/// payload, verifying length and checksum.
pub fn decode_packet(line: &[u8]) -> Result<(u8, Vec<u8>)> {
    let Some((&b'$', hex)) = line.split_first() else {
        return Err(Error::protocol("reply does not start with '$'"));
    };
    let raw = hex_decode(hex)?;
    let (_, (cmd, csum, length, payload)) =
        fields(&raw).map_err(|_| Error::protocol("reply shorter than its header"))?;
    if usize::from(length) != payload.len() * 2 {
        return Err(Error::protocol(format!(
            "reply declares {length} digits but carries {}",
            payload.len() * 2
        )));
    }
    let mut summed = vec![cmd, length];
    summed.extend_from_slice(payload);
    if negated_add8(&summed) != csum {
        return Err(Error::protocol("reply checksum mismatch"));
    }
    Ok((cmd, payload.to_vec()))
}

pub struct DeepbluCosmiq<'a> {
    pub(crate) base: DeviceBase<'a>,
    retry: RetryPolicy,
}

impl<'a> DeepbluCosmiq<'a> {
    pub fn open(ctx: Arc<Context>, port: Port<'a>) -> Result<Self> {
        let mut base = DeviceBase::new(ctx, port, FINGERPRINT_SIZE);
        let timeout = base.timeout_ms(TIMEOUT_MS);
        base.port.set_timeout(timeout)?;
        base.port.purge_lenient(Direction::All)?;
        let retry = base.retry_policy(RetryPolicy::none());
        Ok(DeepbluCosmiq { base, retry })
    }

    fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        loop {
            match self.base.port.read_byte()? {
                b'\n' => return Ok(line),
                b'\r' => {}
                byte => line.push(byte),
            }
            if line.len() > 1 + 2 * (3 + MAX_PAYLOAD) {
                return Err(Error::protocol("reply line too long"));
            }
        }
    }

    fn receive(&mut self, cmd: u8) -> Result<Vec<u8>> {
        let line = self.read_line()?;
        let (echo, payload) = decode_packet(&line)?;
        if echo != cmd {
            return Err(Error::protocol(format!(
                "reply to {echo:#04x} while waiting for {cmd:#04x}"
            )));
        }
        Ok(payload)
    }

    /// Send one request and collect `size` payload bytes, which may be split
    /// over several reply packets.
    fn transfer(&mut self, cmd: u8, payload: &[u8], size: usize) -> Result<Vec<u8>> {
        let packet = encode_packet(cmd, payload)?;
        let retry = self.retry;
        retry.run(|attempt| {
            if attempt > 0 {
                self.base.prepare_retry(retry.delay_ms)?;
            }
            self.base.check_cancelled()?;
            self.base.port.write_all(&packet)?;

            let mut answer = Vec::with_capacity(size);
            loop {
                let part = self.receive(cmd)?;
                answer.extend_from_slice(&part);
                if answer.len() >= size || part.is_empty() {
                    break;
                }
            }
            if answer.len() != size {
                return Err(Error::protocol(format!(
                    "received {} bytes, expected {size}",
                    answer.len()
                )));
            }
            Ok(answer)
        })
    }
}

impl<'a> DeviceBackend<'a> for DeepbluCosmiq<'a> {
    fn family(&self) -> Family {
        Family::DeepbluCosmiq
    }

    fn base(&self) -> &DeviceBase<'a> {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DeviceBase<'a> {
        &mut self.base
    }

    /// Dive 1 is the most recent.
    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        self.base.begin_operation(NSTEPS);

        let count = self.transfer(CMD_DIVE_COUNT, &[], 1)?;
        let ndives = u32::from(count[0]);
        self.base.set_progress(NSTEPS);
        self.base.set_progress_maximum(NSTEPS * (ndives + 1));
        tracing::debug!(dives = ndives, "dive count");

        for number in 1..=ndives {
            let id = [number as u8];
            let header = self.transfer(CMD_DIVE_HEADER, &id, SZ_HEADER)?;
            let fingerprint = &header[FINGERPRINT_OFFSET..FINGERPRINT_OFFSET + FINGERPRINT_SIZE];
            if self.base.matches_fingerprint(fingerprint) {
                break;
            }
            let fingerprint = fingerprint.to_vec();

            let length = usize::from(u16_le(&header, NSAMPLES_OFFSET)) * SZ_SAMPLE;
            let profile = if length == 0 {
                Vec::new()
            } else {
                self.transfer(CMD_DIVE_PROFILE, &id, length)?
            };
            self.base.set_progress(NSTEPS * (number + 1));

            let dive = [header, profile].concat();
            if let ControlFlow::Break(()) = self.base.deliver(callback, &dive, &fingerprint) {
                break;
            }
        }
        self.base.finish_progress();
        Ok(())
    }

    fn timesync(&mut self, datetime: &NaiveDateTime) -> Result<()> {
        let year = u16::try_from(datetime.year())
            .map_err(|_| Error::invalid_args(format!("year {}", datetime.year())))?;
        let [lo, hi] = year.to_le_bytes();
        let payload = [
            lo,
            hi,
            datetime.month() as u8,
            datetime.day() as u8,
            datetime.hour() as u8,
            datetime.minute() as u8,
            datetime.second() as u8,
        ];
        self.transfer(CMD_SET_DATETIME, &payload, 0).map(|_| ())
    }
}
