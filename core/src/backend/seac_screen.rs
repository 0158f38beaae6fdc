//! Seac Screen and Action. Packets are `0x55 len16 cmd16 payload crc16`,
//! all big endian, with `len` counting everything after itself. Memory can
//! be read at any address; dives are also served one per request, newest
//! first, until an empty reply.

use std::ops::ControlFlow;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use crate::array::{u16_be, u32_be};
use crate::checksum::crc16_ccitt;
use crate::context::Context;
use crate::device::{DevInfo, DeviceBackend, DeviceBase, DiveCallback, Family, RetryPolicy};
use crate::error::{Error, Result};
use crate::iostream::{Direction, IoStreamExt, Port, SerialSettings};

pub const SZ_MEMORY: u32 = 0x40000;
pub const FINGERPRINT_SIZE: usize = 4;
pub const FINGERPRINT_OFFSET: usize = 0x0A;

const START: u8 = 0x55;
const CMD_HWINFO: u16 = 0x1833;
const CMD_SOFTWARE: u16 = 0x1834;
const CMD_READ: u16 = 0x1835;
const CMD_DIVE_FIRST: u16 = 0x1850;
const CMD_DIVE_NEXT: u16 = 0x1851;

const SZ_HWINFO: usize = 32;
const SZ_SOFTWARE: usize = 8;
const SZ_PAGE: u32 = 0x800;
const TIMEOUT_MS: i32 = 1000;
const DEFAULT_RETRY: RetryPolicy = RetryPolicy::new(2, 100);

/// Frame `cmd` and `payload` for the wire.
pub fn encode_packet(cmd: u16, payload: &[u8]) -> Result<BytesMut> {
    let length = u16::try_from(payload.len() + 4)
        .map_err(|_| Error::invalid_args("payload too long for one packet"))?;
    let mut packet = BytesMut::with_capacity(payload.len() + 7);
    packet.put_u8(START);
    packet.put_u16(length);
    packet.put_u16(cmd);
    packet.put_slice(payload);
    let crc = crc16_ccitt(&packet);
    packet.put_u16(crc);
    Ok(packet)
}

pub struct SeacScreen<'a> {
    pub(crate) base: DeviceBase<'a>,
    retry: RetryPolicy,
}

impl<'a> SeacScreen<'a> {
    pub fn open(ctx: Arc<Context>, port: Port<'a>) -> Result<Self> {
        let mut base = DeviceBase::new(ctx, port, FINGERPRINT_SIZE);
        match base.port.configure(&SerialSettings::n81(115200)) {
            Err(Error::Unsupported) => {}
            other => other?,
        }
        let timeout = base.timeout_ms(TIMEOUT_MS);
        base.port.set_timeout(timeout)?;
        base.port.set_dtr(true)?;
        base.port.set_rts(true)?;
        base.port.purge_lenient(Direction::All)?;
        let retry = base.retry_policy(DEFAULT_RETRY);
        Ok(SeacScreen { base, retry })
    }

    fn receive(&mut self, cmd: u16) -> Result<Vec<u8>> {
        let head = self.base.port.read_vec(5)?;
        if head[0] != START {
            return Err(Error::protocol(format!("unexpected start byte {:#04x}", head[0])));
        }
        let length = usize::from(u16_be(&head, 1));
        if length < 4 {
            return Err(Error::protocol(format!("packet length {length}")));
        }
        if u16_be(&head, 3) != cmd {
            return Err(Error::protocol(format!(
                "reply to {:#06x} while waiting for {cmd:#06x}",
                u16_be(&head, 3)
            )));
        }
        let tail = self.base.port.read_vec(length - 2)?;
        let (payload, crc) = tail.split_at(length - 4);

        let mut framed = head;
        framed.extend_from_slice(payload);
        if crc16_ccitt(&framed) != u16_be(crc, 0) {
            return Err(Error::protocol("reply checksum mismatch"));
        }
        Ok(payload.to_vec())
    }

    fn transfer(&mut self, cmd: u16, payload: &[u8]) -> Result<Vec<u8>> {
        let packet = encode_packet(cmd, payload)?;
        let retry = self.retry;
        retry.run(|attempt| {
            if attempt > 0 {
                self.base.prepare_retry(retry.delay_ms)?;
            }
            self.base.check_cancelled()?;
            self.base.port.write_all(&packet)?;
            self.receive(cmd)
        })
    }

    fn transfer_sized(&mut self, cmd: u16, payload: &[u8], size: usize) -> Result<Vec<u8>> {
        let reply = self.transfer(cmd, payload)?;
        if reply.len() != size {
            return Err(Error::protocol(format!(
                "reply to {cmd:#06x} carries {} bytes, expected {size}",
                reply.len()
            )));
        }
        Ok(reply)
    }

    fn identify(&mut self) -> Result<()> {
        let hardware = self.transfer_sized(CMD_HWINFO, &[], SZ_HWINFO)?;
        let software = self.transfer_sized(CMD_SOFTWARE, &[], SZ_SOFTWARE)?;
        self.base.emit_devinfo(DevInfo {
            model: u32::from(hardware[1]),
            firmware: u32_be(&software, 0),
            serial: u32_be(&hardware, 4),
        });
        self.base.emit_vendor(&[hardware, software].concat());
        Ok(())
    }
}

impl<'a> DeviceBackend<'a> for SeacScreen<'a> {
    fn family(&self) -> Family {
        Family::SeacScreen
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
            let len = SZ_PAGE.min(end - at);
            let mut request = at.to_be_bytes().to_vec();
            request.extend_from_slice(&(len as u16).to_be_bytes());
            let page = self.transfer_sized(CMD_READ, &request, len as usize)?;
            data.extend_from_slice(&page);
            self.base.advance_progress(len);
            at += len;
        }
        Ok(data)
    }

    fn dump(&mut self) -> Result<Vec<u8>> {
        self.base.begin_operation(SZ_MEMORY);
        self.identify()?;
        let image = self.read(0, SZ_MEMORY as usize)?;
        self.base.finish_progress();
        Ok(image)
    }

    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        self.base.begin_operation(0);
        self.identify()?;

        let mut cmd = CMD_DIVE_FIRST;
        loop {
            let dive = self.transfer(cmd, &[])?;
            cmd = CMD_DIVE_NEXT;
            if dive.is_empty() {
                break;
            }
            if dive.len() < FINGERPRINT_OFFSET + FINGERPRINT_SIZE {
                return Err(Error::data_format(format!("{} byte dive record", dive.len())));
            }
            self.base.advance_progress(dive.len() as u32);
            let fingerprint = &dive[FINGERPRINT_OFFSET..FINGERPRINT_OFFSET + FINGERPRINT_SIZE];
            if let ControlFlow::Break(()) = self.base.deliver(callback, &dive, fingerprint) {
                break;
            }
        }
        self.base.finish_progress();
        Ok(())
    }
}
