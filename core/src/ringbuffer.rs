//! Modular arithmetic over wrap-around storage regions.
//!
//! A ringbuffer is the half-open region `[begin, end)`. Positions are
//! absolute addresses inside that region; every helper keeps them there.

use crate::error::{Error, Result};

/// How to interpret `a == b` when measuring a distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingMode {
    /// Equal positions mean nothing lies between them.
    Empty,
    /// Equal positions mean the whole ring lies between them.
    Full,
}

/// A ringbuffer region `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ring {
    begin: u32,
    end: u32,
}

impl Ring {
    pub fn new(begin: u32, end: u32) -> Result<Self> {
        if end <= begin {
            return Err(Error::invalid_args(format!(
                "empty ringbuffer [{begin:#x}, {end:#x})"
            )));
        }
        Ok(Ring { begin, end })
    }

    pub fn begin(&self) -> u32 {
        self.begin
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn size(&self) -> u32 {
        self.end - self.begin
    }

    pub fn contains(&self, a: u32) -> bool {
        a >= self.begin && a < self.end
    }

    fn check(&self, a: u32) -> Result<()> {
        if self.contains(a) {
            Ok(())
        } else {
            Err(Error::invalid_args(format!(
                "position {a:#x} outside ringbuffer [{:#x}, {:#x})",
                self.begin, self.end
            )))
        }
    }

    /// Fold any address into the ring.
    pub fn normalize(&self, a: u32) -> u32 {
        let size = u64::from(self.size());
        let offset = (i64::from(a) - i64::from(self.begin)).rem_euclid(size as i64);
        self.begin + offset as u32
    }

    /// Forward distance from `a` to `b`, in `[0, size]`.
    pub fn distance(&self, a: u32, b: u32, mode: RingMode) -> Result<u32> {
        self.check(a)?;
        self.check(b)?;

        if a == b {
            return Ok(match mode {
                RingMode::Empty => 0,
                RingMode::Full => self.size(),
            });
        }

        if b > a {
            Ok(b - a)
        } else {
            Ok(self.size() - (a - b))
        }
    }

    pub fn increment(&self, a: u32, delta: u32) -> Result<u32> {
        self.check(a)?;
        let size = u64::from(self.size());
        let offset = (u64::from(a - self.begin) + u64::from(delta)) % size;
        Ok(self.begin + offset as u32)
    }

    pub fn decrement(&self, a: u32, delta: u32) -> Result<u32> {
        self.check(a)?;
        let size = u64::from(self.size());
        let delta = u64::from(delta) % size;
        let offset = (u64::from(a - self.begin) + size - delta) % size;
        Ok(self.begin + offset as u32)
    }

    /// Copy `len` bytes starting at ring position `from` out of `memory`,
    /// following the wrap at `end` back to `begin`.
    ///
    /// `memory` is indexed by absolute address.
    pub fn read_wrapped(&self, memory: &[u8], from: u32, len: u32) -> Result<Vec<u8>> {
        self.check(from)?;
        if len > self.size() {
            return Err(Error::invalid_args(format!(
                "cannot read {len} bytes from a {} byte ringbuffer",
                self.size()
            )));
        }
        if memory.len() < self.end as usize {
            return Err(Error::data_format(format!(
                "memory image of {} bytes does not cover ringbuffer end {:#x}",
                memory.len(),
                self.end
            )));
        }

        let mut out = Vec::with_capacity(len as usize);
        let head = (self.end - from).min(len);
        out.extend_from_slice(&memory[from as usize..(from + head) as usize]);
        let tail = len - head;
        if tail > 0 {
            out.extend_from_slice(&memory[self.begin as usize..(self.begin + tail) as usize]);
        }
        Ok(out)
    }

    /// Rotate the ring so that `pivot` becomes the first byte and the byte
    /// before it the last. All further work on the result is wrap-free.
    pub fn linearize(&self, memory: &[u8], pivot: u32) -> Result<Vec<u8>> {
        self.read_wrapped(memory, pivot, self.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_small_ring_scenario() {
        let ring = Ring::new(0, 8).unwrap();
        assert_eq!(ring.distance(6, 2, RingMode::Full).unwrap(), 4);
        assert_eq!(ring.increment(6, 5).unwrap(), 3);
        assert_eq!(ring.decrement(2, 5).unwrap(), 5);
    }

    #[test]
    fn test_distance_modes() {
        let ring = Ring::new(0x100, 0x200).unwrap();
        assert_eq!(ring.distance(0x150, 0x150, RingMode::Empty).unwrap(), 0);
        assert_eq!(ring.distance(0x150, 0x150, RingMode::Full).unwrap(), 0x100);
        assert_eq!(ring.distance(0x1F0, 0x110, RingMode::Empty).unwrap(), 0x20);
    }

    #[test]
    fn test_out_of_range() {
        let ring = Ring::new(0x100, 0x200).unwrap();
        assert!(matches!(ring.increment(0x200, 1), Err(Error::InvalidArgs(_))));
        assert!(matches!(
            ring.distance(0x00, 0x150, RingMode::Empty),
            Err(Error::InvalidArgs(_))
        ));
        assert!(Ring::new(5, 5).is_err());
    }

    #[test]
    fn test_normalize() {
        let ring = Ring::new(10, 20).unwrap();
        assert_eq!(ring.normalize(25), 15);
        assert_eq!(ring.normalize(9), 19);
        assert_eq!(ring.normalize(10), 10);
    }

    #[test]
    fn test_linearize() {
        let memory: Vec<u8> = (0..16).collect();
        let ring = Ring::new(4, 12).unwrap();
        let linear = ring.linearize(&memory, 9).unwrap();
        assert_eq!(linear, vec![9, 10, 11, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_read_wrapped_short_memory() {
        let memory = vec![0u8; 8];
        let ring = Ring::new(0, 16).unwrap();
        assert!(matches!(
            ring.read_wrapped(&memory, 0, 4),
            Err(Error::DataFormat(_))
        ));
    }

    fn ring_and_position() -> impl Strategy<Value = (u32, u32, u32, u32)> {
        (0u32..1000, 1u32..500).prop_flat_map(|(begin, size)| {
            (
                Just(begin),
                Just(begin + size),
                begin..begin + size,
                0u32..2000,
            )
        })
    }

    proptest! {
        #[test]
        fn prop_increment_then_decrement((begin, end, a, delta) in ring_and_position()) {
            let ring = Ring::new(begin, end).unwrap();
            let forward = ring.increment(a, delta).unwrap();
            prop_assert!(ring.contains(forward));
            prop_assert_eq!(ring.decrement(forward, delta).unwrap(), a);
        }

        #[test]
        fn prop_distance_matches_increment((begin, end, a, delta) in ring_and_position()) {
            let ring = Ring::new(begin, end).unwrap();
            let b = ring.increment(a, delta).unwrap();
            let size = ring.size();
            let expected = if delta % size == 0 { size } else { delta % size };
            prop_assert_eq!(ring.distance(a, b, RingMode::Full).unwrap(), expected);
        }
    }
}
