//! Shearwater Petrel and later models. The device keeps a manifest of its
//! dives, newest first, and each dive is downloaded on its own.

use std::ops::ControlFlow;
use std::sync::Arc;

use crate::array::{u16_be, u32_be};
use crate::backend::shearwater_common::{self, DEFAULT_RETRY};
use crate::context::Context;
use crate::device::{DeviceBackend, DeviceBase, DiveCallback, Family, RetryPolicy};
use crate::error::Result;
use crate::iostream::Port;

pub const FINGERPRINT_SIZE: usize = 4;

pub(crate) const MANIFEST_ADDRESS: u32 = 0xE000_0000;
pub(crate) const MANIFEST_SIZE: u32 = 0x600;
pub(crate) const RECORD_SIZE: usize = 0x20;
pub(crate) const DIVE_ADDRESS: u32 = 0xC000_0000;
const RECORD_VALID: u16 = 0xA5C4;
const RECORD_DELETED: u16 = 0x5A23;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ManifestRecord {
    fingerprint: [u8; FINGERPRINT_SIZE],
    size: u32,
    address: u32,
}

enum Scan {
    /// The page was full; the next download returns the following page.
    More,
    Done,
}

pub struct ShearwaterPetrel<'a> {
    pub(crate) base: DeviceBase<'a>,
    retry: RetryPolicy,
}

impl<'a> ShearwaterPetrel<'a> {
    pub fn open(ctx: Arc<Context>, port: Port<'a>) -> Result<Self> {
        let mut base = DeviceBase::new(ctx, port, FINGERPRINT_SIZE);
        shearwater_common::setup(&mut base)?;
        let retry = base.retry_policy(DEFAULT_RETRY);
        Ok(ShearwaterPetrel { base, retry })
    }

    fn scan_manifest(&self, page: &[u8], records: &mut Vec<ManifestRecord>) -> Scan {
        for record in page.chunks_exact(RECORD_SIZE) {
            match u16_be(record, 0) {
                RECORD_DELETED => continue,
                RECORD_VALID => {}
                _ => return Scan::Done,
            }
            let mut fingerprint = [0u8; FINGERPRINT_SIZE];
            fingerprint.copy_from_slice(&record[4..4 + FINGERPRINT_SIZE]);
            if self.base.matches_fingerprint(&fingerprint) {
                return Scan::Done;
            }
            records.push(ManifestRecord {
                fingerprint,
                size: u32_be(record, 16),
                address: u32_be(record, 20),
            });
        }
        if page.len() < MANIFEST_SIZE as usize {
            Scan::Done
        } else {
            Scan::More
        }
    }
}

impl<'a> DeviceBackend<'a> for ShearwaterPetrel<'a> {
    fn family(&self) -> Family {
        Family::ShearwaterPetrel
    }

    fn base(&self) -> &DeviceBase<'a> {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DeviceBase<'a> {
        &mut self.base
    }

    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        self.base.begin_operation(MANIFEST_SIZE);

        let (info, vendor) = shearwater_common::identify(&mut self.base, self.retry)?;
        self.base.emit_devinfo(info);
        self.base.emit_vendor(&vendor);

        let mut records = Vec::new();
        loop {
            let page = shearwater_common::download(
                &mut self.base,
                self.retry,
                MANIFEST_ADDRESS,
                MANIFEST_SIZE,
            )?;
            if let Scan::Done = self.scan_manifest(&page, &mut records) {
                break;
            }
        }

        let total: u32 = records.iter().map(|r| r.size).sum();
        let done = self.base.progress().current;
        self.base.set_progress_maximum(done + total);
        tracing::debug!(dives = records.len(), bytes = total, "manifest read");

        for record in &records {
            let dive = shearwater_common::download(
                &mut self.base,
                self.retry,
                DIVE_ADDRESS.wrapping_add(record.address),
                record.size,
            )?;
            if let ControlFlow::Break(()) = self.base.deliver(callback, &dive, &record.fingerprint) {
                break;
            }
        }
        self.base.finish_progress();
        Ok(())
    }
}
