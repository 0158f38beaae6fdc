//! Reefnet Sensus depth logger. A handshake returns the identity and clock,
//! then a single request dumps the whole memory. Dives carry no header
//! beyond a short start signature; the end is found from the depths.

use std::ops::ControlFlow;
use std::sync::Arc;

use crate::array::{u16_le, u32_le};
use crate::checksum::add16;
use crate::context::Context;
use crate::device::{ClockInfo, DevInfo, DeviceBackend, DeviceBase, DiveCallback, Family};
use crate::error::{Error, Result};
use crate::extract::deliver;
use crate::iostream::{Direction, IoStreamExt, Port, SerialSettings};

pub const SZ_MEMORY: usize = 32768;
pub const FINGERPRINT_SIZE: usize = 4;

/// Start signature length: `FF`, interval, timestamp, `FE`.
pub const SIGNATURE: usize = 7;
/// Depths below this (adjusted feet) count towards the end of a dive.
pub const SURFACE_DEPTH: u8 = 16;
/// Consecutive surface samples that close a dive.
pub const SURFACE_SAMPLES: u32 = 17;
/// Every sixth sample is followed by a temperature byte.
pub const TEMPERATURE_EVERY: u32 = 6;

const CMD_HANDSHAKE: u8 = 0x0A;
const CMD_DUMP: u8 = 0x40;
const CMD_CANCEL: u8 = 0x00;
const SZ_HANDSHAKE: usize = 10;
const CHUNK: usize = 128;
const TIMEOUT_MS: i32 = 3000;

fn is_dive_start(data: &[u8], offset: usize) -> bool {
    data[offset] == 0xFF && data[offset + SIGNATURE - 1] == 0xFE
}

/// Length of the dive starting at `start`, from its signature through the
/// sample that completes the surface interval. Samples past `limit` are
/// never considered.
pub fn dive_length(data: &[u8], start: usize, limit: usize) -> Option<usize> {
    let limit = limit.min(data.len());
    let mut offset = start + SIGNATURE;
    let mut nsamples = 0u32;
    let mut surface = 0u32;
    while offset < limit {
        let depth = data[offset];
        offset += 1;
        if nsamples % TEMPERATURE_EVERY == 0 {
            if offset >= limit {
                break;
            }
            offset += 1;
        }
        nsamples += 1;

        if depth < SURFACE_DEPTH {
            surface += 1;
            if surface == SURFACE_SAMPLES {
                return Some(offset - start);
            }
        } else {
            surface = 0;
        }
    }
    None
}

/// Scan backwards from the end of memory. Each dive bounds the search for
/// the end of the one before it.
pub fn extract_dives(data: &[u8], fingerprint: &[u8], callback: &mut DiveCallback<'_>) -> Result<()> {
    let mut previous = data.len();
    let mut bound = data.len().saturating_sub(SIGNATURE);
    while bound > 0 {
        bound -= 1;
        let current = bound;
        if !is_dive_start(data, current) {
            continue;
        }

        let Some(length) = dive_length(data, current, previous) else {
            return Err(Error::data_format(format!("dive at {current:#x} never surfaces")));
        };
        let dive = &data[current..current + length];
        if let ControlFlow::Break(()) = deliver(fingerprint, callback, dive, &dive[2..2 + FINGERPRINT_SIZE]) {
            break;
        }
        previous = current;
        bound = current.saturating_sub(SIGNATURE);
    }
    Ok(())
}

pub struct ReefnetSensus<'a> {
    pub(crate) base: DeviceBase<'a>,
    /// A handshake was answered and no dump request has followed yet.
    waiting: bool,
}

impl<'a> ReefnetSensus<'a> {
    pub fn open(ctx: Arc<Context>, port: Port<'a>) -> Result<Self> {
        let mut base = DeviceBase::new(ctx, port, FINGERPRINT_SIZE);
        match base.port.configure(&SerialSettings::n81(19200)) {
            Err(Error::Unsupported) => {}
            other => other?,
        }
        let timeout = base.timeout_ms(TIMEOUT_MS);
        base.port.set_timeout(timeout)?;
        base.port.purge_lenient(Direction::All)?;
        Ok(ReefnetSensus {
            base,
            waiting: false,
        })
    }

    fn handshake(&mut self) -> Result<()> {
        self.base.check_cancelled()?;
        self.base.port.write_all(&[CMD_HANDSHAKE])?;
        let reply = self.base.port.read_vec(2 + SZ_HANDSHAKE)?;
        if &reply[..2] != b"OK" {
            return Err(Error::protocol("handshake not acknowledged"));
        }
        self.waiting = true;

        let systime = chrono::Utc::now().timestamp();
        self.base.emit_clock(ClockInfo {
            devtime: u32_le(&reply, 8),
            systime,
        });
        self.base.emit_devinfo(DevInfo {
            model: u32::from(reply[2]),
            firmware: u32::from(reply[3]),
            serial: u32::from(u16_le(&reply, 6)),
        });
        self.base.emit_vendor(&reply[2..]);

        // The line must be quiet before the host transmits again.
        self.base.port.sleep(10)
    }
}

impl<'a> DeviceBackend<'a> for ReefnetSensus<'a> {
    fn family(&self) -> Family {
        Family::ReefnetSensus
    }

    fn base(&self) -> &DeviceBase<'a> {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DeviceBase<'a> {
        &mut self.base
    }

    fn dump(&mut self) -> Result<Vec<u8>> {
        const PACKET: usize = 4 + SZ_MEMORY + 2 + 3;

        self.base.begin_operation(PACKET as u32);
        self.handshake()?;

        self.base.check_cancelled()?;
        self.base.port.write_all(&[CMD_DUMP])?;
        self.waiting = false;

        let mut packet = Vec::with_capacity(PACKET);
        while packet.len() < PACKET {
            self.base.check_cancelled()?;
            let len = CHUNK.min(PACKET - packet.len());
            let chunk = self.base.port.read_vec(len)?;
            packet.extend_from_slice(&chunk);
            self.base.advance_progress(len as u32);
        }

        if &packet[..4] != b"DATA" || &packet[PACKET - 3..] != b"END" {
            return Err(Error::protocol("memory dump is not framed by DATA and END"));
        }
        let memory = &packet[4..4 + SZ_MEMORY];
        let crc = u16_le(&packet, 4 + SZ_MEMORY);
        let computed = add16(memory, 0);
        if crc != computed {
            return Err(Error::protocol(format!(
                "memory checksum {crc:#06x}, computed {computed:#06x}"
            )));
        }
        Ok(memory.to_vec())
    }

    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        let memory = self.dump()?;
        extract_dives(&memory, self.base.fingerprint(), callback)
    }

    fn close(&mut self) -> Result<()> {
        if self.waiting && !self.base.is_closed() {
            self.waiting = false;
            if let Err(e) = self.base.port.write_all(&[CMD_CANCEL]) {
                tracing::warn!(error = %e, "failed to release the pending handshake");
            }
        }
        self.base.close()
    }
}
