//! Uwatec Smart, Aladin Tec and Galileo over IrDA. One-byte commands with
//! fixed-size replies; dives newer than a timestamp are fetched in a single
//! bulk transfer.

use std::ops::ControlFlow;
use std::sync::Arc;

use crate::array::{search_backward, u32_le};
use crate::context::Context;
use crate::device::{ClockInfo, DevInfo, DeviceBackend, DeviceBase, DiveCallback, Family, RetryPolicy};
use crate::error::{Error, Result};
use crate::extract::deliver;
use crate::iostream::{Direction, IoStreamExt, Port};

pub const FINGERPRINT_SIZE: usize = 4;

const CMD_HANDSHAKE1: u8 = 0x1B;
const CMD_HANDSHAKE2: u8 = 0x1C;
const CMD_MODEL: u8 = 0x10;
const CMD_SERIAL: u8 = 0x14;
const CMD_CLOCK: u8 = 0x1A;
const CMD_LENGTH: u8 = 0xC6;
const CMD_DATA: u8 = 0xC4;
const PARAMS: [u8; 4] = [0x10, 0x27, 0x00, 0x00];

const DIVE_MARKER: [u8; 4] = [0xA5, 0xA5, 0x5A, 0x5A];
/// Marker, length and timestamp.
const DIVE_PREFIX: usize = 12;
const CHUNK: usize = 32;
/// Largest logbook any model in the family can hold.
const MAX_LENGTH: u32 = 0x0020_0000;
const TIMEOUT_MS: i32 = 1000;
const DEFAULT_RETRY: RetryPolicy = RetryPolicy::new(2, 100);

/// Split downloaded data into dives, newest (last) first. Each dive starts
/// with a marker followed by its total length.
pub fn extract_dives(data: &[u8], fingerprint: &[u8], callback: &mut DiveCallback<'_>) -> Result<()> {
    let mut previous = data.len();
    while let Some(current) = search_backward(&data[..previous], &DIVE_MARKER) {
        if current + 8 > previous {
            return Err(Error::data_format(format!("dive at {current:#x} is truncated")));
        }
        let length = u32_le(data, current + 4) as usize;
        if length < DIVE_PREFIX || current + length > previous {
            return Err(Error::data_format(format!(
                "dive at {current:#x} claims {length} bytes"
            )));
        }
        let dive = &data[current..current + length];
        if let ControlFlow::Break(()) = deliver(fingerprint, callback, dive, &dive[8..DIVE_PREFIX]) {
            break;
        }
        previous = current;
    }
    Ok(())
}

pub struct UwatecSmart<'a> {
    pub(crate) base: DeviceBase<'a>,
    retry: RetryPolicy,
}

impl<'a> UwatecSmart<'a> {
    pub fn open(ctx: Arc<Context>, port: Port<'a>) -> Result<Self> {
        let mut base = DeviceBase::new(ctx, port, FINGERPRINT_SIZE);
        let timeout = base.timeout_ms(TIMEOUT_MS);
        base.port.set_timeout(timeout)?;
        let retry = base.retry_policy(DEFAULT_RETRY);

        let mut device = UwatecSmart { base, retry };
        device.handshake()?;
        Ok(device)
    }

    fn exchange(&mut self, command: &[u8], answer_len: usize) -> Result<Vec<u8>> {
        let retry = self.retry;
        retry.run(|attempt| {
            if attempt > 0 {
                self.base.prepare_retry(retry.delay_ms)?;
            }
            self.base.check_cancelled()?;
            self.base.port.write_all(command)?;
            self.base.port.read_vec(answer_len)
        })
    }

    fn handshake(&mut self) -> Result<()> {
        let answer = self.exchange(&[CMD_HANDSHAKE1], 1)?;
        if answer[0] != 0x01 {
            return Err(Error::protocol("first handshake stage rejected"));
        }
        let mut command = vec![CMD_HANDSHAKE2];
        command.extend_from_slice(&PARAMS);
        let answer = self.exchange(&command, 1)?;
        if answer[0] != 0x01 {
            return Err(Error::protocol("second handshake stage rejected"));
        }
        Ok(())
    }

    fn bulk_command(&self, cmd: u8) -> Vec<u8> {
        let mut command = Vec::with_capacity(9);
        command.push(cmd);
        match self.base.fingerprint() {
            [] => command.extend_from_slice(&[0; 4]),
            timestamp => command.extend_from_slice(timestamp),
        }
        command.extend_from_slice(&PARAMS);
        command
    }
}

impl<'a> DeviceBackend<'a> for UwatecSmart<'a> {
    fn family(&self) -> Family {
        Family::UwatecSmart
    }

    fn base(&self) -> &DeviceBase<'a> {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DeviceBase<'a> {
        &mut self.base
    }

    /// Everything recorded after the stored fingerprint.
    fn dump(&mut self) -> Result<Vec<u8>> {
        self.base.begin_operation(9 + 8);

        let model = self.exchange(&[CMD_MODEL], 1)?;
        let serial = self.exchange(&[CMD_SERIAL], 4)?;
        let devtime = self.exchange(&[CMD_CLOCK], 4)?;
        let systime = chrono::Utc::now().timestamp();
        self.base.advance_progress(9);

        self.base.emit_clock(ClockInfo {
            devtime: u32_le(&devtime, 0),
            systime,
        });
        self.base.emit_devinfo(DevInfo {
            model: u32::from(model[0]),
            firmware: 0,
            serial: u32_le(&serial, 0),
        });
        self.base.emit_vendor(&[model, serial, devtime].concat());

        let command = self.bulk_command(CMD_LENGTH);
        let length = u32_le(&self.exchange(&command, 4)?, 0);
        self.base.advance_progress(4);
        if length == 0 {
            self.base.finish_progress();
            return Ok(Vec::new());
        }
        if length > MAX_LENGTH {
            return Err(Error::protocol(format!(
                "device announces {length} bytes, more than any model stores"
            )));
        }
        let expected = length + 4;
        let done = self.base.progress().current;
        let maximum = done
            .checked_add(expected)
            .ok_or_else(|| Error::protocol("transfer size overflows"))?;
        self.base.set_progress_maximum(maximum);

        let command = self.bulk_command(CMD_DATA);
        let total = u32_le(&self.exchange(&command, 4)?, 0);
        self.base.advance_progress(4);
        if total != expected {
            return Err(Error::protocol(format!(
                "data transfer announces {total} bytes, expected {expected}"
            )));
        }

        let mut data = Vec::with_capacity(length as usize);
        while data.len() < length as usize {
            self.base.check_cancelled()?;
            let len = CHUNK.min(length as usize - data.len());
            let chunk = self.base.port.read_vec(len)?;
            data.extend_from_slice(&chunk);
            self.base.advance_progress(len as u32);
        }
        Ok(data)
    }

    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        let data = self.dump()?;
        extract_dives(&data, self.base.fingerprint(), callback)
    }

    fn close(&mut self) -> Result<()> {
        self.base.port.purge_lenient(Direction::All)?;
        self.base.close()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::device::{Event, EventMask};
    use crate::iostream::mock::MockStream;
    use crate::iostream::Transport;

    fn dive(timestamp: u32, body: usize) -> Vec<u8> {
        let mut dive = DIVE_MARKER.to_vec();
        dive.extend_from_slice(&((DIVE_PREFIX + body) as u32).to_le_bytes());
        dive.extend_from_slice(&timestamp.to_le_bytes());
        dive.extend(std::iter::repeat(0x00).take(body));
        dive
    }

    fn memory() -> Vec<u8> {
        [dive(1000, 20), dive(2000, 30), dive(3000, 40)].concat()
    }

    fn device_stream(memory: Vec<u8>) -> MockStream {
        MockStream::with_responder(Transport::Irda, move |command| match command {
            [CMD_HANDSHAKE1] | [CMD_HANDSHAKE2, 0x10, 0x27, 0x00, 0x00] => vec![0x01],
            [CMD_MODEL] => vec![0x11],
            [CMD_SERIAL] => 0x0102_0304u32.to_le_bytes().to_vec(),
            [CMD_CLOCK] => 0x00AB_CDEFu32.to_le_bytes().to_vec(),
            [CMD_LENGTH, ..] => (memory.len() as u32).to_le_bytes().to_vec(),
            [CMD_DATA, ..] => {
                let mut reply = (memory.len() as u32 + 4).to_le_bytes().to_vec();
                reply.extend_from_slice(&memory);
                reply
            }
            _ => Vec::new(),
        })
    }

    #[test]
    fn test_extract_newest_first() {
        let mut stamps = Vec::new();
        extract_dives(&memory(), &[], &mut |dive: &[u8], fp: &[u8]| {
            stamps.push((u32_le(fp, 0), dive.len()));
            true
        })
        .unwrap();
        assert_eq!(stamps, vec![(3000, 52), (2000, 42), (1000, 32)]);
    }

    #[test]
    fn test_overlong_dive_is_data_format() {
        let mut data = memory();
        data[4] = 0xFF;
        let err = extract_dives(&data, &[], &mut |_: &[u8], _: &[u8]| true).unwrap_err();
        assert!(matches!(err, Error::DataFormat(_)));
    }

    #[test]
    fn test_download_with_clock_and_devinfo() {
        let mut stream = device_stream(memory());
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);

        let ctx = Context::new().into_shared();
        let mut device = UwatecSmart::open(ctx, Port::Borrowed(&mut stream)).unwrap();
        device.base.set_fingerprint(&500u32.to_le_bytes()).unwrap();
        device.base.set_events(
            EventMask::CLOCK | EventMask::DEVINFO,
            Some(Box::new(move |event: &Event| sink.borrow_mut().push(event.clone()))),
        );
        let mut count = 0;
        device
            .foreach(&mut |_: &[u8], _: &[u8]| {
                count += 1;
                true
            })
            .unwrap();
        drop(device);

        assert_eq!(count, 3);
        let events = events.borrow();
        assert!(matches!(events[0], Event::Clock(ClockInfo { devtime: 0x00AB_CDEF, .. })));
        assert_eq!(
            events[1],
            Event::DevInfo(DevInfo {
                model: 0x11,
                firmware: 0,
                serial: 0x0102_0304
            })
        );
        let length_command = stream
            .writes()
            .iter()
            .find(|w| w[0] == CMD_LENGTH)
            .unwrap()
            .clone();
        assert_eq!(&length_command[1..5], &500u32.to_le_bytes());
    }

    #[test]
    fn test_failed_handshake() {
        let mut stream = MockStream::with_responder(Transport::Irda, |_| vec![0x00]);
        let ctx = Context::new().into_shared();
        assert!(matches!(
            UwatecSmart::open(ctx, Port::Borrowed(&mut stream)),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_implausible_length_is_protocol() {
        let mut stream = MockStream::with_responder(Transport::Irda, |command| match command {
            [CMD_HANDSHAKE1] | [CMD_HANDSHAKE2, 0x10, 0x27, 0x00, 0x00] => vec![0x01],
            [CMD_MODEL] => vec![0x11],
            [CMD_SERIAL] | [CMD_CLOCK] => vec![0; 4],
            [CMD_LENGTH, ..] => 0xFFFF_FFFEu32.to_le_bytes().to_vec(),
            _ => Vec::new(),
        });
        let ctx = Context::new().into_shared();
        let mut device = UwatecSmart::open(ctx, Port::Borrowed(&mut stream)).unwrap();
        assert!(matches!(device.dump(), Err(Error::Protocol(_))));
        drop(device);
        assert!(stream.writes().iter().all(|w| w[0] != CMD_DATA));
    }

    #[test]
    fn test_nothing_new() {
        let mut stream = device_stream(Vec::new());
        let ctx = Context::new().into_shared();
        let mut device = UwatecSmart::open(ctx, Port::Borrowed(&mut stream)).unwrap();
        assert!(device.dump().unwrap().is_empty());
        drop(device);
        assert!(stream.writes().iter().all(|w| w[0] != CMD_DATA));
    }
}
