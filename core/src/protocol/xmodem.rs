//! XMODEM-CRC receiver: `SOH seq ~seq payload[512] crc16_be`, one ACK per
//! block, `EOT` to finish.

use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u8};
use nom::{IResult, Parser};

use crate::checksum::crc16_xmodem;
use crate::device::DeviceBase;
use crate::error::{Error, Result};
use crate::iostream::{Direction, IoStreamExt};

pub const SOH: u8 = 0x01;
pub const EOT: u8 = 0x04;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
pub const CAN: u8 = 0x18;
/// Receiver request for CRC mode.
pub const CRC_MODE: u8 = b'C';

pub const PAYLOAD_SIZE: usize = 512;
/// Block length after the leading `SOH`.
const BLOCK_TAIL: usize = 2 + PAYLOAD_SIZE + 2;
const MAX_NAKS: u32 = 4;

struct Block<'i> {
    seq: u8,
    inverse: u8,
    payload: &'i [u8],
    crc: u16,
}

fn block(input: &[u8]) -> IResult<&[u8], Block<'_>> {
    let (rest, (seq, inverse, payload, crc)) =
        (be_u8, be_u8, take(PAYLOAD_SIZE), be_u16).parse(input)?;
    Ok((
        rest,
        Block {
            seq,
            inverse,
            payload,
            crc,
        },
    ))
}

/// Receive a complete transfer. Each block counts as one progress step of
/// [`PAYLOAD_SIZE`] bytes. Trailing newlines used as padding are removed.
pub fn receive(base: &mut DeviceBase<'_>) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut expected: u8 = 1;
    let mut naks = 0;

    base.check_cancelled()?;
    base.port.write_all(&[CRC_MODE])?;

    loop {
        base.check_cancelled()?;
        match base.port.read_byte()? {
            EOT => {
                base.port.write_all(&[ACK])?;
                break;
            }
            CAN => return Err(Error::protocol("transfer cancelled by the device")),
            SOH => {}
            other => {
                return Err(Error::protocol(format!(
                    "unexpected XMODEM start byte {other:#04x}"
                )))
            }
        }

        let raw = base.port.read_vec(BLOCK_TAIL)?;
        let (_, block) = block(&raw)
            .map_err(|e| Error::protocol(format!("malformed XMODEM block: {e}")))?;

        if block.seq != !block.inverse || block.seq != expected {
            return Err(Error::protocol(format!(
                "XMODEM sequence {:#04x}/{:#04x}, expected {expected:#04x}",
                block.seq, block.inverse
            )));
        }

        if crc16_xmodem(block.payload) != block.crc {
            naks += 1;
            if naks > MAX_NAKS {
                return Err(Error::protocol("XMODEM block checksum keeps failing"));
            }
            tracing::debug!(seq = block.seq, "XMODEM checksum mismatch, requesting resend");
            base.port.purge_lenient(Direction::Input)?;
            base.port.write_all(&[NAK])?;
            continue;
        }

        naks = 0;
        data.extend_from_slice(block.payload);
        expected = expected.wrapping_add(1);
        base.advance_progress(PAYLOAD_SIZE as u32);
        base.port.write_all(&[ACK])?;
    }

    while matches!(data.last().copied(), Some(b'\n' | b'\r')) {
        data.pop();
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::iostream::mock::MockStream;
    use crate::iostream::{Port, Transport};

    fn frame(seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![SOH, seq, !seq];
        out.extend_from_slice(payload);
        out.extend_from_slice(&crc16_xmodem(payload).to_be_bytes());
        out
    }

    fn sender(blocks: Vec<Vec<u8>>) -> MockStream {
        let mut queue = blocks.into_iter();
        let mut done = false;
        MockStream::with_responder(Transport::Serial, move |data| {
            match data {
                [CRC_MODE] | [ACK] if !done => match queue.next() {
                    Some(block) => block,
                    None => {
                        done = true;
                        vec![EOT]
                    }
                },
                _ => Vec::new(),
            }
        })
    }

    fn run(stream: &mut MockStream) -> Result<Vec<u8>> {
        let mut base = DeviceBase::new(Context::new().into_shared(), Port::Borrowed(stream), 0);
        receive(&mut base)
    }

    #[test]
    fn test_two_block_transfer() {
        let a = vec![0x41u8; PAYLOAD_SIZE];
        let mut b = vec![0x42u8; PAYLOAD_SIZE];
        b[PAYLOAD_SIZE - 2..].copy_from_slice(b"\n\n");

        let mut stream = sender(vec![frame(1, &a), frame(2, &b)]);
        let data = run(&mut stream).unwrap();

        assert_eq!(data.len(), 2 * PAYLOAD_SIZE - 2);
        assert_eq!(&data[..PAYLOAD_SIZE], &a[..]);
        assert!(data[PAYLOAD_SIZE..].iter().all(|&x| x == 0x42));
        assert_eq!(stream.written(), &[CRC_MODE, ACK, ACK, ACK]);
    }

    #[test]
    fn test_bad_sequence_is_protocol_error() {
        let payload = vec![0u8; PAYLOAD_SIZE];
        let mut bad = frame(2, &payload);
        bad[2] = 0x00;
        let mut stream = sender(vec![frame(1, &payload), bad]);
        assert!(matches!(run(&mut stream), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_checksum_mismatch_is_nakked_and_resent() {
        let payload = vec![0x33u8; PAYLOAD_SIZE];
        let good = frame(1, &payload);
        let mut corrupt = good.clone();
        corrupt[10] ^= 0xFF;

        let mut sent_corrupt = false;
        let mut finished = false;
        let mut stream = MockStream::with_responder(Transport::Serial, move |data| match data {
            [CRC_MODE] => {
                sent_corrupt = true;
                corrupt.clone()
            }
            [NAK] => good.clone(),
            [ACK] if sent_corrupt && !finished => {
                finished = true;
                vec![EOT]
            }
            _ => Vec::new(),
        });

        let data = run(&mut stream).unwrap();
        assert_eq!(data, payload);
        assert_eq!(stream.written(), &[CRC_MODE, NAK, ACK, ACK]);
    }
}
