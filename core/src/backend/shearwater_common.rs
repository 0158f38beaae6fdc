//! Packet layer shared by the Shearwater computers: SLIP-framed requests
//! with a four byte envelope, "read data by identifier" queries and block
//! downloads from flash.

use bytes::{BufMut, BytesMut};

use crate::array::u16_be;
use crate::device::{DevInfo, DeviceBase, RetryPolicy};
use crate::error::{Error, Result};
use crate::iostream::{Direction, IoStreamExt, SerialSettings};
use crate::protocol::slip;

pub const RDBI_SERIAL: u16 = 0x8010;
pub const RDBI_FIRMWARE: u16 = 0x8011;
pub const RDBI_HARDWARE: u16 = 0x8050;

const MAX_FRAME: usize = 260;
pub(crate) const DEFAULT_RETRY: RetryPolicy = RetryPolicy::new(2, 100);
const TIMEOUT_MS: i32 = 1000;

pub(crate) fn setup(base: &mut DeviceBase<'_>) -> Result<()> {
    let timeout = base.timeout_ms(TIMEOUT_MS);
    match base.port.configure(&SerialSettings::n81(115200)) {
        Err(Error::Unsupported) => {}
        other => other?,
    }
    base.port.set_timeout(timeout)?;
    base.port.sleep(300)?;
    base.port.purge_lenient(Direction::All)
}

fn exchange(base: &mut DeviceBase<'_>, request: &[u8]) -> Result<Vec<u8>> {
    base.check_cancelled()?;

    let length = u8::try_from(request.len() + 1)
        .map_err(|_| Error::invalid_args("request too long for one packet"))?;
    let mut packet = BytesMut::with_capacity(request.len() + 4);
    packet.put_slice(&[0xFF, 0x01, length, 0x00]);
    packet.put_slice(request);
    base.port.write_all(&slip::encode(&packet))?;

    let frame = slip::read_frame(&mut *base.port, MAX_FRAME)?;
    if frame.len() < 4 || frame[0] != 0x01 || frame[1] != 0xFF || frame[3] != 0x00 {
        return Err(Error::protocol("unexpected packet header"));
    }
    let payload = usize::from(frame[2]).saturating_sub(1);
    if payload != frame.len() - 4 {
        return Err(Error::protocol(format!(
            "packet declares {payload} bytes but carries {}",
            frame.len() - 4
        )));
    }
    Ok(frame[4..].to_vec())
}

/// One request/response with retries.
pub(crate) fn transfer(
    base: &mut DeviceBase<'_>,
    retry: RetryPolicy,
    request: &[u8],
) -> Result<Vec<u8>> {
    retry.run(|attempt| {
        if attempt > 0 {
            base.prepare_retry(retry.delay_ms)?;
        }
        exchange(base, request)
    })
}

/// Read data by identifier.
pub(crate) fn rdbi(base: &mut DeviceBase<'_>, retry: RetryPolicy, id: u16) -> Result<Vec<u8>> {
    let [hi, lo] = id.to_be_bytes();
    let reply = transfer(base, retry, &[0x22, hi, lo])?;
    if reply.len() < 3 || reply[0] != 0x62 || u16_be(&reply, 1) != id {
        return Err(Error::protocol(format!("bad reply to identifier {id:#06x}")));
    }
    Ok(reply[3..].to_vec())
}

/// Download `size` bytes from `address`. The device may end the transfer
/// early with an empty block.
pub(crate) fn download(
    base: &mut DeviceBase<'_>,
    retry: RetryPolicy,
    address: u32,
    size: u32,
) -> Result<Vec<u8>> {
    let a = address.to_be_bytes();
    let s = size.to_be_bytes();
    let init = [0x35, 0x00, 0x34, a[0], a[1], a[2], a[3], s[1], s[2], s[3]];
    let reply = transfer(base, retry, &init)?;
    if reply.len() < 2 || reply[0] != 0x75 || reply[1] != 0x10 {
        return Err(Error::protocol("download request rejected"));
    }

    let mut data = Vec::with_capacity(size as usize);
    let mut block: u8 = 1;
    while data.len() < size as usize {
        let reply = transfer(base, retry, &[0x36, block])?;
        if reply.len() < 2 || reply[0] != 0x76 || reply[1] != block {
            return Err(Error::protocol(format!("bad reply to block {block}")));
        }
        let chunk = &reply[2..];
        if chunk.is_empty() {
            break;
        }
        let room = size as usize - data.len();
        data.extend_from_slice(&chunk[..chunk.len().min(room)]);
        base.advance_progress(chunk.len().min(room) as u32);
        block = block.wrapping_add(1);
    }

    let reply = transfer(base, retry, &[0x37])?;
    if reply.first() != Some(&0x77) {
        return Err(Error::protocol("download not acknowledged"));
    }
    Ok(data)
}

/// Serial number from its eight character hexadecimal form.
pub(crate) fn parse_serial(raw: &[u8]) -> Result<u32> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|text| u32::from_str_radix(text.trim_end_matches('\0'), 16).ok())
        .ok_or_else(|| Error::protocol("serial number is not hexadecimal"))
}

/// Firmware version from strings such as `"V71"` or `"Ver 88"`.
pub(crate) fn parse_firmware(raw: &[u8]) -> u32 {
    raw.iter()
        .skip_while(|b| !b.is_ascii_digit())
        .take_while(|b| b.is_ascii_digit())
        .fold(0u32, |acc, b| acc.saturating_mul(10).saturating_add(u32::from(b - b'0')))
}

/// Query serial, firmware and hardware identifiers.
pub(crate) fn identify(base: &mut DeviceBase<'_>, retry: RetryPolicy) -> Result<(DevInfo, Vec<u8>)> {
    let serial = rdbi(base, retry, RDBI_SERIAL)?;
    let firmware = rdbi(base, retry, RDBI_FIRMWARE)?;
    let hardware = rdbi(base, retry, RDBI_HARDWARE)?;
    let model = match hardware.as_slice() {
        [hi, lo, ..] => u32::from(u16::from_be_bytes([*hi, *lo])),
        _ => return Err(Error::protocol("hardware identifier too short")),
    };

    let info = DevInfo {
        model,
        firmware: parse_firmware(&firmware),
        serial: parse_serial(&serial)?,
    };
    let vendor = [serial, firmware, hardware].concat();
    Ok((info, vendor))
}
