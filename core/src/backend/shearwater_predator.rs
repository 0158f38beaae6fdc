//! Shearwater Predator: the whole flash image is downloaded in one transfer
//! and the dives are cut out of its circular profile area.

use std::sync::Arc;

use crate::array::{bcd2dec, u32_be};
use crate::backend::shearwater_common::{self, DEFAULT_RETRY};
use crate::context::Context;
use crate::device::{DevInfo, DeviceBackend, DeviceBase, DiveCallback, Family, RetryPolicy};
use crate::error::{Error, Result};
use crate::extract::markers::MarkerLayout;
use crate::iostream::Port;
use crate::ringbuffer::Ring;

pub const SZ_MEMORY: u32 = 0x20080;
pub const SZ_BLOCK: u32 = 0x80;
pub const RB_PROFILE_BEGIN: u32 = 0;
pub const RB_PROFILE_END: u32 = 0x20000;
pub const FINGERPRINT_SIZE: usize = 4;

const MEMORY_ADDRESS: u32 = 0xDD00_0000;
const CONFIG: usize = RB_PROFILE_END as usize;

fn layout() -> Result<MarkerLayout> {
    Ok(MarkerLayout {
        ring: Ring::new(RB_PROFILE_BEGIN, RB_PROFILE_END)?,
        block: SZ_BLOCK,
        header_mark: 0xFFFF,
        footer_mark: 0xFFFE,
        sequence_offset: 2,
        fingerprint_offset: 12,
        fingerprint_size: FINGERPRINT_SIZE,
    })
}

fn check_image(image: &[u8]) -> Result<()> {
    if image.len() < SZ_MEMORY as usize {
        return Err(Error::data_format(format!(
            "memory image of {} bytes, expected {SZ_MEMORY}",
            image.len()
        )));
    }
    Ok(())
}

/// Identity stored in the configuration block behind the profile area.
pub fn devinfo(image: &[u8]) -> Result<DevInfo> {
    check_image(image)?;
    Ok(DevInfo {
        model: u32::from(image[CONFIG + 0x0D]),
        firmware: u32::from(bcd2dec(image[CONFIG + 0x0A])),
        serial: u32_be(image, CONFIG + 0x02),
    })
}

pub fn extract_dives(image: &[u8], fingerprint: &[u8], callback: &mut DiveCallback<'_>) -> Result<()> {
    check_image(image)?;
    layout()?.extract(image, fingerprint, callback)
}

pub struct ShearwaterPredator<'a> {
    pub(crate) base: DeviceBase<'a>,
    retry: RetryPolicy,
}

impl<'a> ShearwaterPredator<'a> {
    pub fn open(ctx: Arc<Context>, port: Port<'a>) -> Result<Self> {
        let mut base = DeviceBase::new(ctx, port, FINGERPRINT_SIZE);
        shearwater_common::setup(&mut base)?;
        let retry = base.retry_policy(DEFAULT_RETRY);
        Ok(ShearwaterPredator { base, retry })
    }
}

impl<'a> DeviceBackend<'a> for ShearwaterPredator<'a> {
    fn family(&self) -> Family {
        Family::ShearwaterPredator
    }

    fn base(&self) -> &DeviceBase<'a> {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DeviceBase<'a> {
        &mut self.base
    }

    fn dump(&mut self) -> Result<Vec<u8>> {
        self.base.begin_operation(SZ_MEMORY);
        let image = shearwater_common::download(&mut self.base, self.retry, MEMORY_ADDRESS, SZ_MEMORY)?;

        let info = devinfo(&image)?;
        self.base.emit_devinfo(info);
        self.base.emit_vendor(&image[CONFIG..SZ_MEMORY as usize]);
        self.base.finish_progress();
        Ok(image)
    }

    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        let image = self.dump()?;
        extract_dives(&image, self.base.fingerprint(), callback)
    }
}
