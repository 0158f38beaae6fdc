//! DiveSystem iDive and iX3M. Every exchange is a `0x55`-framed packet with
//! a CCITT CRC; the reply echoes the command and ends in ACK or NAK. Dives
//! are addressed by number and fetched as a header plus sample pages.

use std::ops::ControlFlow;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use crate::array::{u16_be, u16_le, u32_le};
use crate::checksum::crc16_ccitt;
use crate::context::Context;
use crate::device::{DevInfo, DeviceBackend, DeviceBase, DiveCallback, Family, RetryPolicy};
use crate::error::{Error, Result};
use crate::iostream::{Direction, IoStreamExt, Port, SerialSettings};

pub const FINGERPRINT_SIZE: usize = 4;
pub const FINGERPRINT_OFFSET: usize = 7;

/// Models from this number on speak the iX3M command set.
pub const IX3M_FIRST_MODEL: u32 = 0x22;

const START: u8 = 0x55;
const ACK: u8 = 0x06;
const NAK: u8 = 0x15;
const MAX_PACKET: usize = 0xFF;

const SZ_ID: usize = 26;
const SZ_RANGE: usize = 4;
const NSTEPS: u32 = 1000;
const TIMEOUT_MS: i32 = 1000;
const DEFAULT_RETRY: RetryPolicy = RetryPolicy::new(9, 100);

/// Command bytes and record sizes for one generation of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSet {
    pub id: [u8; 2],
    pub range: [u8; 2],
    pub header: u8,
    pub sample: u8,
    pub header_size: usize,
    pub sample_size: usize,
    pub samples_per_page: usize,
}

pub const IDIVE: CommandSet = CommandSet {
    id: [0x10, 0xED],
    range: [0x98, 0x8D],
    header: 0xA0,
    sample: 0xA8,
    header_size: 32,
    sample_size: 42,
    samples_per_page: 1,
};

pub const IX3M: CommandSet = CommandSet {
    id: [0x11, 0xED],
    range: [0x78, 0x8D],
    header: 0x79,
    sample: 0x7A,
    header_size: 54,
    sample_size: 42,
    samples_per_page: 3,
};

impl CommandSet {
    pub fn for_model(model: u32) -> &'static CommandSet {
        if model >= IX3M_FIRST_MODEL {
            &IX3M
        } else {
            &IDIVE
        }
    }
}

pub struct DivesystemIdive<'a> {
    pub(crate) base: DeviceBase<'a>,
    retry: RetryPolicy,
    commands: &'static CommandSet,
}

impl<'a> DivesystemIdive<'a> {
    pub fn open(ctx: Arc<Context>, port: Port<'a>, model: u32) -> Result<Self> {
        let mut base = DeviceBase::new(ctx, port, FINGERPRINT_SIZE);
        match base.port.configure(&SerialSettings::n81(115200)) {
            Err(Error::Unsupported) => {}
            other => other?,
        }
        let timeout = base.timeout_ms(TIMEOUT_MS);
        base.port.set_timeout(timeout)?;
        base.port.sleep(300)?;
        base.port.purge_lenient(Direction::All)?;
        let retry = base.retry_policy(DEFAULT_RETRY);
        Ok(DivesystemIdive {
            base,
            retry,
            commands: CommandSet::for_model(model),
        })
    }

    fn send(&mut self, command: &[u8]) -> Result<()> {
        let length = u8::try_from(command.len())
            .map_err(|_| Error::invalid_args("command too long for one packet"))?;
        let mut packet = BytesMut::with_capacity(command.len() + 4);
        packet.put_u8(START);
        packet.put_u8(length);
        packet.put_slice(command);
        let crc = crc16_ccitt(&packet);
        packet.put_u16(crc);
        self.base.port.write_all(&packet)
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        while self.base.port.read_byte()? != START {}
        let length = self.base.port.read_byte()?;
        if length < 2 {
            return Err(Error::protocol(format!("reply of {length} bytes")));
        }
        let body = self.base.port.read_vec(usize::from(length) + 2)?;

        let mut framed = Vec::with_capacity(body.len() + 2);
        framed.extend_from_slice(&[START, length]);
        framed.extend_from_slice(&body[..usize::from(length)]);
        let crc = u16_be(&body, usize::from(length));
        if crc16_ccitt(&framed) != crc {
            return Err(Error::protocol("reply checksum mismatch"));
        }
        Ok(framed.split_off(2))
    }

    fn exchange(&mut self, command: &[u8], size: usize) -> Result<Vec<u8>> {
        self.base.check_cancelled()?;
        self.send(command)?;
        let reply = self.receive()?;

        let Some((&status, rest)) = reply.split_last() else {
            return Err(Error::protocol("empty reply"));
        };
        if rest.first() != command.first() {
            return Err(Error::protocol("reply does not echo the command"));
        }
        match status {
            ACK => {}
            NAK => return Err(Error::protocol(format!("command {:#04x} refused", command[0]))),
            other => return Err(Error::protocol(format!("unexpected status {other:#04x}"))),
        }
        let data = &rest[1..];
        if data.len() != size {
            return Err(Error::protocol(format!(
                "reply carries {} bytes, expected {size}",
                data.len()
            )));
        }
        Ok(data.to_vec())
    }

    fn transfer(&mut self, command: &[u8], size: usize) -> Result<Vec<u8>> {
        let retry = self.retry;
        retry.run(|attempt| {
            if attempt > 0 {
                self.base.prepare_retry(retry.delay_ms)?;
            }
            self.exchange(command, size)
        })
    }

    fn download_dive(&mut self, header: Vec<u8>, step: u32) -> Result<Vec<u8>> {
        let commands = self.commands;
        let nsamples = usize::from(u16_le(&header, 1));
        let mut dive = Vec::with_capacity(commands.header_size + nsamples * commands.sample_size);
        dive.extend_from_slice(&header);

        let page = commands.samples_per_page * commands.sample_size;
        let mut done = 0;
        while done < nsamples {
            let index = u16::try_from(done + 1)
                .map_err(|_| Error::data_format("sample index out of range"))?;
            let [lo, hi] = index.to_le_bytes();
            let packet = self.transfer(&[commands.sample, lo, hi], page)?;

            // The tail of a short final page is garbage.
            let n = commands.samples_per_page.min(nsamples - done);
            dive.extend_from_slice(&packet[..n * commands.sample_size]);
            done += n;
            self.base
                .set_progress(step + (done as u32 * NSTEPS) / nsamples as u32);
        }
        Ok(dive)
    }
}

impl<'a> DeviceBackend<'a> for DivesystemIdive<'a> {
    fn family(&self) -> Family {
        Family::DivesystemIdive
    }

    fn base(&self) -> &DeviceBase<'a> {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DeviceBase<'a> {
        &mut self.base
    }

    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        let commands = self.commands;
        self.base.begin_operation(NSTEPS);

        let id = self.transfer(&commands.id, SZ_ID)?;
        self.base.emit_devinfo(DevInfo {
            model: u32::from(u16_le(&id, 0)),
            firmware: u32_le(&id, 2),
            serial: u32_le(&id, 6),
        });
        self.base.emit_vendor(&id);

        let range = self.transfer(&commands.range, SZ_RANGE)?;
        let first = u32::from(u16_le(&range, 0));
        let last = u32::from(u16_le(&range, 2));
        if first > last {
            return Err(Error::data_format(format!("dive range {first}..{last} is reversed")));
        }
        let ndives = last - first + 1;
        self.base.set_progress(NSTEPS);
        self.base.set_progress_maximum(NSTEPS * (ndives + 1));
        tracing::debug!(first, last, "dive range");

        for i in 0..ndives {
            let number = last - i;
            let [lo, hi, ..] = number.to_le_bytes();
            let header = self.transfer(&[commands.header, lo, hi], commands.header_size)?;
            let fingerprint = &header[FINGERPRINT_OFFSET..FINGERPRINT_OFFSET + FINGERPRINT_SIZE];
            if self.base.matches_fingerprint(fingerprint) {
                break;
            }
            let fingerprint = fingerprint.to_vec();

            let step = NSTEPS * (i + 1);
            let dive = self.download_dive(header, step)?;
            self.base.set_progress(step + NSTEPS);
            if let ControlFlow::Break(()) = self.base.deliver(callback, &dive, &fingerprint) {
                break;
            }
        }
        self.base.finish_progress();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::iostream::mock::MockStream;
    use crate::iostream::Transport;

    fn packet(payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![START, payload.len() as u8];
        packet.extend_from_slice(payload);
        let crc = crc16_ccitt(&packet);
        packet.extend_from_slice(&crc.to_be_bytes());
        packet
    }

    fn reply(command: u8, data: &[u8]) -> Vec<u8> {
        let mut payload = vec![command];
        payload.extend_from_slice(data);
        payload.push(ACK);
        packet(&payload)
    }

    struct Dive {
        header: Vec<u8>,
        samples: Vec<Vec<u8>>,
    }

    fn dive(commands: &CommandSet, stamp: u32, nsamples: u16) -> Dive {
        let mut header = vec![0u8; commands.header_size];
        header[1..3].copy_from_slice(&nsamples.to_le_bytes());
        header[FINGERPRINT_OFFSET..FINGERPRINT_OFFSET + 4].copy_from_slice(&stamp.to_le_bytes());
        let samples = (0..nsamples)
            .map(|i| vec![i as u8; commands.sample_size])
            .collect();
        Dive { header, samples }
    }

    fn computer(commands: CommandSet, dives: BTreeMap<u16, Dive>, busy: usize) -> MockStream {
        let mut busy = busy;
        let mut current: Option<u16> = None;
        MockStream::with_responder(Transport::Serial, move |raw| {
            let payload = &raw[2..raw.len() - 2];
            if busy > 0 {
                busy -= 1;
                return packet(&[payload[0], NAK]);
            }
            match payload {
                p if p == commands.id => {
                    let mut id = vec![0u8; SZ_ID];
                    id[..2].copy_from_slice(&0x0010u16.to_le_bytes());
                    id[2..6].copy_from_slice(&0x0102_0304u32.to_le_bytes());
                    id[6..10].copy_from_slice(&4711u32.to_le_bytes());
                    reply(p[0], &id)
                }
                p if p == commands.range => {
                    let first = *dives.keys().next().unwrap_or(&1);
                    let last = *dives.keys().last().unwrap_or(&0);
                    let mut range = first.to_le_bytes().to_vec();
                    range.extend_from_slice(&last.to_le_bytes());
                    reply(p[0], &range)
                }
                [cmd, lo, hi] if *cmd == commands.header => {
                    let number = u16::from_le_bytes([*lo, *hi]);
                    current = Some(number);
                    reply(*cmd, &dives[&number].header)
                }
                [cmd, lo, hi] if *cmd == commands.sample => {
                    let first = usize::from(u16::from_le_bytes([*lo, *hi])) - 1;
                    let samples = &dives[&current.unwrap()].samples;
                    let mut page = Vec::new();
                    for i in first..first + commands.samples_per_page {
                        page.extend(samples.get(i).cloned().unwrap_or(vec![0xEE; commands.sample_size]));
                    }
                    reply(*cmd, &page)
                }
                _ => Vec::new(),
            }
        })
    }

    fn download(commands: CommandSet, model: u32, fingerprint: &[u8], busy: usize) -> (Vec<Vec<u8>>, MockStream) {
        let mut dives = BTreeMap::new();
        dives.insert(3, dive(&commands, 300, 4));
        dives.insert(4, dive(&commands, 400, 0));
        dives.insert(5, dive(&commands, 500, 7));
        let mut stream = computer(commands, dives, busy);
        let ctx = Context::new().into_shared();
        let mut device = DivesystemIdive::open(ctx, Port::Borrowed(&mut stream), model).unwrap();
        device.base.set_fingerprint(fingerprint).unwrap();
        let mut found = Vec::new();
        device
            .foreach(&mut |dive: &[u8], _: &[u8]| {
                found.push(dive.to_vec());
                true
            })
            .unwrap();
        let progress = device.base.progress();
        assert_eq!(progress.current, progress.maximum);
        drop(device);
        (found, stream)
    }

    #[test]
    fn test_newest_number_first() {
        let (found, _) = download(IDIVE, 0x10, &[], 0);
        let stamps: Vec<u32> = found.iter().map(|d| u32_le(d, FINGERPRINT_OFFSET)).collect();
        assert_eq!(stamps, vec![500, 400, 300]);
        assert_eq!(found[0].len(), IDIVE.header_size + 7 * IDIVE.sample_size);
        assert_eq!(found[1].len(), IDIVE.header_size);
    }

    #[test]
    fn test_short_last_page_is_trimmed() {
        let (found, _) = download(IX3M, IX3M_FIRST_MODEL, &[], 0);
        let newest = &found[0];
        assert_eq!(newest.len(), IX3M.header_size + 7 * IX3M.sample_size);
        assert!(!newest.contains(&0xEE));
    }

    #[test]
    fn test_fingerprint_stop() {
        let (found, _) = download(IDIVE, 0x10, &400u32.to_le_bytes(), 0);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_refused_command_is_retried() {
        let (found, stream) = download(IDIVE, 0x10, &[], 2);
        assert_eq!(found.len(), 3);
        assert_eq!(stream.slept_ms(), 300 + 2 * 100);
    }

    #[test]
    fn test_command_framing() {
        let mut stream = MockStream::new(Transport::Serial);
        let ctx = Context::new().into_shared();
        let mut device = DivesystemIdive::open(ctx, Port::Borrowed(&mut stream), 0).unwrap();
        device.send(&[0x10, 0xED]).unwrap();
        drop(device);
        let sent = stream.written();
        assert_eq!(&sent[..4], &[START, 2, 0x10, 0xED]);
        assert_eq!(u16_be(sent, 4), crc16_ccitt(&sent[..4]));
    }
}
