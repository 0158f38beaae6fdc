//! Cursor over a prefix-coded sample stream.
//!
//! Each sample starts with an opcode made of type bits, read MSB first.
//! Bits of the last type byte that the opcode does not use carry the start
//! of the payload; whole extra bytes follow it.

use crate::error::{Error, Result};

/// How the type bits are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcodeScheme {
    /// Run of leading one bits, possibly spanning bytes.
    Smart,
    /// Fixed patterns within the first byte.
    Galileo,
}

/// Two's-complement value of the low `nbits` of `value`.
pub fn sign_extend(value: u32, nbits: u32) -> i32 {
    if nbits == 0 {
        return 0;
    }
    if nbits >= 32 {
        return value as i32;
    }
    let mask = (1u32 << nbits) - 1;
    let value = value & mask;
    if value & (1 << (nbits - 1)) != 0 {
        (value | !mask) as i32
    } else {
        value as i32
    }
}

fn smart_opcode(data: &[u8]) -> usize {
    let mut count = 0;
    for &byte in data {
        let ones = byte.leading_ones() as usize;
        count += ones;
        if ones < 8 {
            break;
        }
    }
    count
}

fn galileo_opcode(byte: u8) -> usize {
    match byte {
        b if b & 0x80 == 0 => 0,
        b if b & 0xE0 == 0x80 => 1,
        b if b & 0xF0 != 0xF0 => usize::from((b & 0x70) >> 4),
        b => usize::from(b & 0x0F) + 7,
    }
}

#[derive(Debug, Clone)]
pub struct BitReader<'d> {
    data: &'d [u8],
    offset: usize,
}

impl<'d> BitReader<'d> {
    pub fn new(data: &'d [u8]) -> Self {
        BitReader { data, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    /// Identify the opcode at the cursor. The cursor stays put, since the
    /// payload may begin inside the last type byte.
    pub fn read_opcode(&self, scheme: OpcodeScheme) -> usize {
        let rest = &self.data[self.offset.min(self.data.len())..];
        match scheme {
            OpcodeScheme::Smart => smart_opcode(rest),
            OpcodeScheme::Galileo => rest.first().map_or(0, |&b| galileo_opcode(b)),
        }
    }

    /// Consume the type bits of an opcode and its payload. Returns the
    /// payload, MSB first, and its width in bits.
    pub fn read_payload(
        &mut self,
        type_bits: u32,
        ignore_type_lowbits: bool,
        extra_bytes: usize,
    ) -> Result<(u32, u32)> {
        self.offset += (type_bits / 8) as usize;

        let mut nbits = 0;
        let mut value = 0u32;
        let n = type_bits % 8;
        if n > 0 {
            let Some(&byte) = self.data.get(self.offset) else {
                return Err(Error::data_format("sample type runs past the end"));
            };
            if !ignore_type_lowbits {
                nbits = 8 - n;
                value = u32::from(byte & (0xFF >> n));
            }
            self.offset += 1;
        }

        for &byte in self.take(extra_bytes)? {
            nbits += 8;
            value = (value << 8) | u32::from(byte);
        }
        Ok((value, nbits))
    }

    /// Consume `n` raw bytes.
    pub fn take(&mut self, n: usize) -> Result<&'d [u8]> {
        let end = self
            .offset
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| Error::data_format("incomplete sample data"))?;
        let bytes = &self.data[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    /// Next byte without consuming it.
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.offset).copied()
    }
}
