//! SLIP (RFC 1055) byte stuffing.

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::iostream::{IoStream, IoStreamExt};

pub const END: u8 = 0xC0;
pub const ESC: u8 = 0xDB;
pub const ESC_END: u8 = 0xDC;
pub const ESC_ESC: u8 = 0xDD;

/// Escape `data` and terminate it with `END`.
pub fn encode(data: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(data.len() * 2 + 1);
    for &byte in data {
        match byte {
            END => out.put_slice(&[ESC, ESC_END]),
            ESC => out.put_slice(&[ESC, ESC_ESC]),
            _ => out.put_u8(byte),
        }
    }
    out.put_u8(END);
    out
}

/// Read one frame from `stream`. Empty frames (back-to-back `END`s) are
/// skipped; a frame longer than `max_len` is a protocol error.
pub fn read_frame<S: IoStream + ?Sized>(stream: &mut S, max_len: usize) -> Result<Vec<u8>> {
    let mut frame = Vec::new();
    let mut escaped = false;
    loop {
        let byte = stream.read_byte()?;
        if escaped {
            escaped = false;
            let unescaped = match byte {
                ESC_END => END,
                ESC_ESC => ESC,
                other => {
                    return Err(Error::protocol(format!(
                        "invalid SLIP escape sequence {ESC:#04x} {other:#04x}"
                    )))
                }
            };
            frame.push(unescaped);
        } else {
            match byte {
                END if frame.is_empty() => continue,
                END => return Ok(frame),
                ESC => escaped = true,
                _ => frame.push(byte),
            }
        }
        if frame.len() > max_len {
            return Err(Error::protocol(format!(
                "SLIP frame exceeds {max_len} bytes"
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iostream::mock::MockStream;
    use crate::iostream::Transport;

    #[test]
    fn test_escapes_special_bytes() {
        let encoded = encode(&[0x01, END, 0x02, ESC]);
        assert_eq!(
            &encoded[..],
            &[0x01, ESC, ESC_END, 0x02, ESC, ESC_ESC, END]
        );
    }

    #[test]
    fn test_read_frame_skips_empty_frames() {
        let mut stream = MockStream::new(Transport::Serial);
        stream.push_input(&[END, END, 0x10, ESC, ESC_END, 0x20, END]);
        assert_eq!(read_frame(&mut stream, 16).unwrap(), vec![0x10, END, 0x20]);
    }

    #[test]
    fn test_read_frame_rejects_bad_escape() {
        let mut stream = MockStream::new(Transport::Serial);
        stream.push_input(&[0x10, ESC, 0x00, END]);
        assert!(matches!(
            read_frame(&mut stream, 16),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_read_frame_times_out_without_end() {
        let mut stream = MockStream::new(Transport::Serial);
        stream.push_input(&[0x10, 0x20]);
        assert!(matches!(
            read_frame(&mut stream, 16),
            Err(Error::Timeout { .. })
        ));
    }
}
