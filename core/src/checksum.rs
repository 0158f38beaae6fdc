//! Checksums and byte transforms shared by the wire protocols.

use crc::{Crc, CRC_16_IBM_3740, CRC_16_XMODEM};

use crate::error::{Error, Result};

/// CRC-16-CCITT, poly 0x1021, init 0xFFFF, no final xor.
const CRC_CCITT: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// CRC-16 as used by XMODEM-CRC blocks (init 0x0000).
const CRC_XMODEM: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

pub fn crc16_ccitt(data: &[u8]) -> u16 {
    CRC_CCITT.checksum(data)
}

pub fn crc16_xmodem(data: &[u8]) -> u16 {
    CRC_XMODEM.checksum(data)
}

pub fn xor8(data: &[u8], init: u8) -> u8 {
    data.iter().fold(init, |acc, b| acc ^ b)
}

pub fn add8(data: &[u8], init: u8) -> u8 {
    data.iter().fold(init, |acc, b| acc.wrapping_add(*b))
}

pub fn add16(data: &[u8], init: u16) -> u16 {
    data.iter()
        .fold(init, |acc, b| acc.wrapping_add(u16::from(*b)))
}

/// Two's-complement of the additive sum: appending it makes the total zero.
pub fn negated_add8(data: &[u8]) -> u8 {
    add8(data, 0).wrapping_neg()
}

pub fn reverse_bits(data: &mut [u8]) {
    for b in data.iter_mut() {
        *b = b.reverse_bits();
    }
}

pub fn hex_encode(data: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(data.len() * 2);
    for b in data {
        out.push(DIGITS[usize::from(b >> 4)] as char);
        out.push(DIGITS[usize::from(b & 0x0F)] as char);
    }
    out
}

pub fn hex_decode(text: &[u8]) -> Result<Vec<u8>> {
    if text.len() % 2 != 0 {
        return Err(Error::protocol("odd number of hex digits"));
    }

    fn nibble(c: u8) -> Result<u8> {
        match c {
            b'0'..=b'9' => Ok(c - b'0'),
            b'a'..=b'f' => Ok(c - b'a' + 10),
            b'A'..=b'F' => Ok(c - b'A' + 10),
            _ => Err(Error::protocol(format!("invalid hex digit {c:#04x}"))),
        }
    }

    text.chunks_exact(2)
        .map(|pair| Ok((nibble(pair[0])? << 4) | nibble(pair[1])?))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_crc16_ccitt_check_value() {
        assert_eq!(crc16_ccitt(b"123456789"), 0x29B1);
    }

    #[test]
    fn test_crc16_xmodem_check_value() {
        assert_eq!(crc16_xmodem(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_simple_sums() {
        assert_eq!(xor8(&[0x01, 0x02, 0x04], 0x00), 0x07);
        assert_eq!(add8(&[0xFF, 0x02], 0x00), 0x01);
        assert_eq!(add16(&[0xFF, 0xFF, 0x02], 0x0000), 0x0200);
        assert_eq!(negated_add8(&[0x40]), 0xC0);
    }

    #[test]
    fn test_reverse_bits() {
        let mut data = [0x01, 0x80, 0xF0];
        reverse_bits(&mut data);
        assert_eq!(data, [0x80, 0x01, 0x0F]);
    }

    #[test]
    fn test_hex() {
        assert_eq!(hex_encode(&[0x40, 0xC0, 0x0A]), "40C00A");
        assert_eq!(hex_decode(b"40c00A").unwrap(), vec![0x40, 0xC0, 0x0A]);
        assert!(hex_decode(b"4").is_err());
        assert!(hex_decode(b"4G").is_err());
    }

    proptest! {
        #[test]
        fn prop_negated_sum_cancels(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            let csum = negated_add8(&data);
            prop_assert_eq!(add8(&data, csum), 0);
        }

        #[test]
        fn prop_hex_inverse(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            let text = hex_encode(&data);
            prop_assert_eq!(hex_decode(text.as_bytes()).unwrap(), data);
        }
    }
}
