//! Dives framed by header and footer blocks inside a circular profile area.
//!
//! Each dive starts with a block whose first two bytes are the header mark
//! and ends with a block starting with the footer mark. Both carry the same
//! 16-bit sequence number. Blocks that are entirely `0xFF` are unused flash.

use std::ops::ControlFlow;

use crate::array::{is_filled, u16_be};
use crate::device::DiveCallback;
use crate::error::{Error, Result};
use crate::extract::deliver;
use crate::ringbuffer::Ring;

#[derive(Debug, Clone, Copy)]
pub struct MarkerLayout {
    pub ring: Ring,
    pub block: u32,
    pub header_mark: u16,
    pub footer_mark: u16,
    /// Offset of the big-endian sequence number inside header and footer.
    pub sequence_offset: usize,
    /// Offset of the fingerprint window inside the header block.
    pub fingerprint_offset: usize,
    pub fingerprint_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Empty,
    Header(u16),
    Footer(u16),
    Data,
}

impl MarkerLayout {
    fn classify(&self, block: &[u8]) -> BlockKind {
        if is_filled(block, 0xFF) {
            return BlockKind::Empty;
        }
        let mark = u16_be(block, 0);
        let sequence = u16_be(block, self.sequence_offset);
        if mark == self.header_mark {
            BlockKind::Header(sequence)
        } else if mark == self.footer_mark {
            BlockKind::Footer(sequence)
        } else {
            BlockKind::Data
        }
    }

    fn block_at<'m>(&self, memory: &'m [u8], offset: u32) -> &'m [u8] {
        &memory[offset as usize..(offset + self.block) as usize]
    }

    /// Position one block past the newest complete dive, or `None` when the
    /// ring holds no complete dive.
    pub fn end_of_profile(&self, memory: &[u8]) -> Result<Option<u32>> {
        let ring = self.ring;
        if memory.len() < ring.end() as usize {
            return Err(Error::data_format(format!(
                "memory image of {} bytes is shorter than the profile area",
                memory.len()
            )));
        }

        let nblocks = ring.size() / self.block;
        let mut offset = ring.end();
        let mut stop = ring.begin();
        let mut footer: Option<(u32, u16)> = None;
        let mut newest: Option<(u32, u16)> = None;

        // A dive straddling the wrap point is only complete once the scan has
        // come back around, so after the first hit the scan continues past
        // the start up to the end of that first dive.
        for _ in 0..2 * nblocks {
            offset = ring.decrement(ring.normalize(offset), self.block)?;
            match self.classify(self.block_at(memory, offset)) {
                BlockKind::Empty => {}
                BlockKind::Footer(sequence) => footer = Some((offset, sequence)),
                BlockKind::Header(sequence) => {
                    if let Some((position, expected)) = footer.take() {
                        if sequence != expected {
                            return Err(Error::data_format(format!(
                                "dive at {offset:#x} has header sequence {sequence} but footer sequence {expected}"
                            )));
                        }
                        let end = ring.increment(position, self.block)?;
                        if newest.is_none() {
                            stop = end;
                        }
                        if newest.is_none_or(|(_, max)| sequence > max) {
                            newest = Some((end, sequence));
                        }
                    }
                }
                BlockKind::Data => {}
            }
            if offset == stop {
                break;
            }
        }

        Ok(newest.map(|(end, _)| end))
    }

    /// Deliver every complete dive newest first.
    pub fn extract(
        &self,
        memory: &[u8],
        fingerprint: &[u8],
        callback: &mut DiveCallback<'_>,
    ) -> Result<()> {
        let Some(eop) = self.end_of_profile(memory)? else {
            tracing::debug!("no complete dive in profile area");
            return Ok(());
        };
        let linear = self.ring.linearize(memory, eop)?;

        let mut offset = linear.len() as u32;
        let mut footer: Option<(u32, u16)> = None;
        let mut previous: Option<u16> = None;
        while offset >= self.block {
            offset -= self.block;
            match self.classify(self.block_at(&linear, offset)) {
                BlockKind::Footer(sequence) => footer = Some((offset, sequence)),
                BlockKind::Header(sequence) => {
                    let Some((end, expected)) = footer.take() else {
                        continue;
                    };
                    if sequence != expected {
                        return Err(Error::data_format(format!(
                            "dive sequence mismatch: header {sequence}, footer {expected}"
                        )));
                    }
                    if previous.is_some_and(|p| sequence > p) {
                        tracing::warn!(sequence, "older dive carries a newer sequence number");
                    }
                    previous = Some(sequence);

                    let dive = &linear[offset as usize..(end + self.block) as usize];
                    let window = &dive
                        [self.fingerprint_offset..self.fingerprint_offset + self.fingerprint_size];
                    if let ControlFlow::Break(()) = deliver(fingerprint, callback, dive, window) {
                        return Ok(());
                    }
                }
                BlockKind::Empty | BlockKind::Data => {}
            }
        }
        Ok(())
    }
}
