//! Uwatec Aladin computers read through the Memomouse cradle.
//!
//! Every byte on the wire is bit-reversed. Outer packets are
//! `[len] [data; len] [xor]` and each one is acknowledged. Outer packets
//! carry an inner packet `[len16_le] [payload] [xor]`. The cradle sends the
//! whole logbook twice, oldest to newest and then back again.

use std::ops::ControlFlow;
use std::sync::Arc;

use crate::array::{bcd2dec, u16_le, u32_le};
use crate::checksum::{reverse_bits, xor8};
use crate::context::Context;
use crate::device::{ClockInfo, DevInfo, DeviceBackend, DeviceBase, DiveCallback, Family, RetryPolicy};
use crate::error::{Error, Result};
use crate::extract::deliver;
use crate::iostream::{Direction, IoStreamExt, Port, SerialSettings};

pub const FINGERPRINT_SIZE: usize = 4;

/// Acknowledge and reject bytes, already in wire (reversed) order.
const ACK: u8 = 0x60;
const NAK: u8 = 0xA8;
const CMD_DOWNLOAD: u8 = 0x55;

/// Device byte and clock ahead of the first dive.
const DATA_HEADER: usize = 5;
const DIVE_HEADER: usize = 18;
const FINGERPRINT_OFFSET: usize = 11;

const TIMEOUT_MS: i32 = 1000;
const DEFAULT_RETRY: RetryPolicy = RetryPolicy::new(2, 0);
const GREETING_POLLS: u32 = 40;
const DATA_POLLS: u32 = 600;

/// Walk the first (chronological) pass until its newest dive is repeated,
/// then deliver that pass newest first.
pub fn extract_dives(data: &[u8], fingerprint: &[u8], callback: &mut DiveCallback<'_>) -> Result<()> {
    if data.len() < DATA_HEADER {
        return Err(Error::data_format("download shorter than its header"));
    }

    let mut offsets = Vec::new();
    let mut previous: Option<usize> = None;
    let mut current = DATA_HEADER;
    while current + DIVE_HEADER <= data.len() {
        if let Some(previous) = previous {
            if data[current..current + DIVE_HEADER] == data[previous..previous + DIVE_HEADER] {
                break;
            }
        }
        let length = DIVE_HEADER + usize::from(u16_le(data, current + 16));
        if current + length > data.len() {
            return Err(Error::data_format(format!(
                "dive at {current:#x} runs past the end of the download"
            )));
        }
        offsets.push((current, length));
        previous = Some(current);
        current += length;
    }

    for &(offset, length) in offsets.iter().rev() {
        let dive = &data[offset..offset + length];
        let fp = &dive[FINGERPRINT_OFFSET..FINGERPRINT_OFFSET + FINGERPRINT_SIZE];
        if let ControlFlow::Break(()) = deliver(fingerprint, callback, dive, fp) {
            break;
        }
    }
    Ok(())
}

pub struct UwatecMemomouse<'a> {
    pub(crate) base: DeviceBase<'a>,
    retry: RetryPolicy,
}

impl<'a> UwatecMemomouse<'a> {
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
        let retry = base.retry_policy(DEFAULT_RETRY);
        Ok(UwatecMemomouse { base, retry })
    }

    fn read_outer(&mut self) -> Result<Vec<u8>> {
        let mut length = [self.base.port.read_byte()?];
        reverse_bits(&mut length);
        let mut packet = self.base.port.read_vec(usize::from(length[0]) + 1)?;
        reverse_bits(&mut packet);

        let Some((&crc, data)) = packet.split_last() else {
            return Err(Error::protocol("empty packet"));
        };
        if xor8(data, length[0]) != crc {
            return Err(Error::protocol("packet checksum mismatch"));
        }
        Ok(data.to_vec())
    }

    /// One outer packet, rejected and re-read on a bad checksum or a timeout.
    fn receive_outer(&mut self) -> Result<Vec<u8>> {
        let retry = self.retry;
        retry.run(|attempt| {
            if attempt > 0 {
                self.base.prepare_retry(retry.delay_ms)?;
                self.base.port.write_all(&[NAK])?;
            }
            self.base.check_cancelled()?;
            self.read_outer()
        })
    }

    fn read_inner(&mut self, track_progress: bool) -> Result<Vec<u8>> {
        let mut packet = Vec::new();
        let mut total: Option<usize> = None;
        loop {
            let chunk = self.receive_outer()?;
            self.base.port.write_all(&[ACK])?;
            packet.extend_from_slice(&chunk);

            if total.is_none() && packet.len() >= 2 {
                let length = usize::from(u16_le(&packet, 0)) + 3;
                if track_progress {
                    self.base.set_progress_maximum(length as u32);
                }
                total = Some(length);
            }
            if track_progress {
                self.base.advance_progress(chunk.len() as u32);
            }
            if let Some(total) = total {
                if packet.len() >= total {
                    packet.truncate(total);
                    break;
                }
            }
        }

        let Some((&crc, rest)) = packet.split_last() else {
            return Err(Error::protocol("empty inner packet"));
        };
        let payload = &rest[2..];
        if xor8(payload, 0) != crc {
            return Err(Error::protocol("inner packet checksum mismatch"));
        }
        Ok(payload.to_vec())
    }

    /// Toggle DTR until the cradle starts talking.
    fn wait_for_greeting(&mut self) -> Result<()> {
        for _ in 0..GREETING_POLLS {
            if self.base.port.get_available()? > 0 {
                return Ok(());
            }
            self.base.check_cancelled()?;
            self.base.port.purge_lenient(Direction::Input)?;
            self.base.port.set_dtr(false)?;
            self.base.port.sleep(300)?;
            self.base.port.set_dtr(true)?;
        }
        Err(Error::Timeout {
            actual: 0,
            expected: 1,
        })
    }

    fn wait_for_data(&mut self) -> Result<()> {
        for _ in 0..DATA_POLLS {
            if self.base.port.get_available()? > 0 {
                return Ok(());
            }
            self.base.check_cancelled()?;
            self.base.port.sleep(100)?;
        }
        Err(Error::Timeout {
            actual: 0,
            expected: 1,
        })
    }

    fn download_command(&self) -> [u8; 9] {
        let timestamp = match self.base.fingerprint() {
            [] => 0,
            fp => u32_le(fp, 0),
        };
        let t = timestamp.to_le_bytes();
        let mut command = [0x07, 0x05, 0x00, CMD_DOWNLOAD, t[0], t[1], t[2], t[3], 0x00];
        command[8] = xor8(&command[..8], 0);
        reverse_bits(&mut command);
        command
    }
}

impl<'a> DeviceBackend<'a> for UwatecMemomouse<'a> {
    fn family(&self) -> Family {
        Family::UwatecMemomouse
    }

    fn base(&self) -> &DeviceBase<'a> {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DeviceBase<'a> {
        &mut self.base
    }

    fn dump(&mut self) -> Result<Vec<u8>> {
        self.base.begin_operation(0);

        self.wait_for_greeting()?;
        let id = self.read_inner(false)?;
        tracing::debug!(id = %String::from_utf8_lossy(&id), "cradle greeting");

        self.base.port.sleep(500)?;
        let command = self.download_command();
        self.base.port.write_all(&command)?;
        let answer = self.read_outer()?;
        if answer.first() != Some(&ACK) {
            return Err(Error::protocol("download command rejected"));
        }

        self.wait_for_data()?;
        let systime = chrono::Utc::now().timestamp();
        let data = self.read_inner(true)?;
        if data.len() < DATA_HEADER {
            return Err(Error::data_format("download shorter than its header"));
        }

        self.base.emit_clock(ClockInfo {
            devtime: u32_le(&data, 1),
            systime,
        });
        self.base.emit_devinfo(DevInfo {
            model: u32::from(data[0]),
            firmware: 0,
            serial: id_serial(&id),
        });
        self.base.emit_vendor(&id);
        self.base.finish_progress();
        Ok(data)
    }

    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        let data = self.dump()?;
        extract_dives(&data, self.base.fingerprint(), callback)
    }
}

/// Serial number from the three BCD bytes ending the greeting, if present.
fn id_serial(id: &[u8]) -> u32 {
    match id {
        [.., a, b, c] => {
            u32::from(bcd2dec(*a)) * 10000 + u32::from(bcd2dec(*b)) * 100 + u32::from(bcd2dec(*c))
        }
        _ => 0,
    }
}
