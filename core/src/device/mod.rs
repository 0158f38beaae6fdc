//! Device handles.
//!
//! Every supported model is a variant of [`Device`]; the per-model protocol
//! lives in [`crate::backend`] and implements [`DeviceBackend`]. Shared
//! bookkeeping (fingerprint, events, cancellation, progress) sits in
//! [`base::DeviceBase`], embedded in each backend.

pub mod base;
pub mod cancel;
pub mod events;
pub mod retry;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::NaiveDateTime;

use crate::backend::{
    deepblu_cosmiq::DeepbluCosmiq, divesystem_idive::DivesystemIdive, hw_ostc::HwOstc,
    hw_ostc3::HwOstc3, mares_iconhd::MaresIconHd, oceanic_veo250::OceanicVeo250,
    oceans_s1::OceansS1, reefnet_sensus::ReefnetSensus, seac_screen::SeacScreen,
    shearwater_petrel::ShearwaterPetrel, shearwater_predator::ShearwaterPredator,
    uwatec_memomouse::UwatecMemomouse, uwatec_smart::UwatecSmart,
};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::iostream::Port;

pub use base::DeviceBase;
pub use cancel::CancelToken;
pub use events::{ClockInfo, DevInfo, Event, EventMask, Progress};
pub use retry::RetryPolicy;

/// Per-dive callback: raw dive bytes and its fingerprint window. Returning
/// `false` ends the iteration successfully.
pub type DiveCallback<'c> = dyn FnMut(&[u8], &[u8]) -> bool + 'c;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    ShearwaterPredator,
    ShearwaterPetrel,
    HwOstc,
    HwOstc3,
    UwatecSmart,
    UwatecMemomouse,
    ReefnetSensus,
    DivesystemIdive,
    OceansS1,
    DeepbluCosmiq,
    SeacScreen,
    MaresIconHd,
    OceanicVeo250,
}

impl Family {
    pub const ALL: [Family; 13] = [
        Family::ShearwaterPredator,
        Family::ShearwaterPetrel,
        Family::HwOstc,
        Family::HwOstc3,
        Family::UwatecSmart,
        Family::UwatecMemomouse,
        Family::ReefnetSensus,
        Family::DivesystemIdive,
        Family::OceansS1,
        Family::DeepbluCosmiq,
        Family::SeacScreen,
        Family::MaresIconHd,
        Family::OceanicVeo250,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Family::ShearwaterPredator => "shearwater_predator",
            Family::ShearwaterPetrel => "shearwater_petrel",
            Family::HwOstc => "hw_ostc",
            Family::HwOstc3 => "hw_ostc3",
            Family::UwatecSmart => "uwatec_smart",
            Family::UwatecMemomouse => "uwatec_memomouse",
            Family::ReefnetSensus => "reefnet_sensus",
            Family::DivesystemIdive => "divesystem_idive",
            Family::OceansS1 => "oceans_s1",
            Family::DeepbluCosmiq => "deepblu_cosmiq",
            Family::SeacScreen => "seac_screen",
            Family::MaresIconHd => "mares_iconhd",
            Family::OceanicVeo250 => "oceanic_veo250",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Family {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Family::ALL
            .iter()
            .copied()
            .find(|family| family.name() == s)
            .ok_or_else(|| Error::invalid_args(format!("unknown device family '{s}'")))
    }
}

/// Protocol-specific half of a device. Operations a model cannot perform
/// keep the default and report [`Error::Unsupported`].
pub trait DeviceBackend<'a> {
    fn family(&self) -> Family;

    fn base(&self) -> &DeviceBase<'a>;

    fn base_mut(&mut self) -> &mut DeviceBase<'a>;

    /// Random-access memory read.
    fn read(&mut self, _address: u32, _size: usize) -> Result<Vec<u8>> {
        Err(Error::Unsupported)
    }

    fn write(&mut self, _address: u32, _data: &[u8]) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// Whole-memory image.
    fn dump(&mut self) -> Result<Vec<u8>> {
        Err(Error::Unsupported)
    }

    /// Stream dives newest-first until the stored fingerprint is reached or
    /// the callback asks to stop.
    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()>;

    fn timesync(&mut self, _datetime: &NaiveDateTime) -> Result<()> {
        Err(Error::Unsupported)
    }

    fn close(&mut self) -> Result<()> {
        self.base_mut().close()
    }
}

pub enum Device<'a> {
    ShearwaterPredator(ShearwaterPredator<'a>),
    ShearwaterPetrel(ShearwaterPetrel<'a>),
    HwOstc(HwOstc<'a>),
    HwOstc3(HwOstc3<'a>),
    UwatecSmart(UwatecSmart<'a>),
    UwatecMemomouse(UwatecMemomouse<'a>),
    ReefnetSensus(ReefnetSensus<'a>),
    DivesystemIdive(DivesystemIdive<'a>),
    OceansS1(OceansS1<'a>),
    DeepbluCosmiq(DeepbluCosmiq<'a>),
    SeacScreen(SeacScreen<'a>),
    MaresIconHd(MaresIconHd<'a>),
    OceanicVeo250(OceanicVeo250<'a>),
}

macro_rules! dispatch {
    ($device:expr, $backend:ident => $body:expr) => {
        match $device {
            Device::ShearwaterPredator($backend) => $body,
            Device::ShearwaterPetrel($backend) => $body,
            Device::HwOstc($backend) => $body,
            Device::HwOstc3($backend) => $body,
            Device::UwatecSmart($backend) => $body,
            Device::UwatecMemomouse($backend) => $body,
            Device::ReefnetSensus($backend) => $body,
            Device::DivesystemIdive($backend) => $body,
            Device::OceansS1($backend) => $body,
            Device::DeepbluCosmiq($backend) => $body,
            Device::SeacScreen($backend) => $body,
            Device::MaresIconHd($backend) => $body,
            Device::OceanicVeo250($backend) => $body,
        }
    };
}

impl<'a> Device<'a> {
    /// Bind `port` to the backend for `family` and run its handshake.
    /// `model` selects a variant where the family spans several products.
    pub fn open(ctx: Arc<Context>, port: Port<'a>, family: Family, model: u32) -> Result<Self> {
        tracing::debug!(%family, model, owned = port.is_owned(), "opening device");
        let device = match family {
            Family::ShearwaterPredator => {
                Device::ShearwaterPredator(ShearwaterPredator::open(ctx, port)?)
            }
            Family::ShearwaterPetrel => Device::ShearwaterPetrel(ShearwaterPetrel::open(ctx, port)?),
            Family::HwOstc => Device::HwOstc(HwOstc::open(ctx, port)?),
            Family::HwOstc3 => Device::HwOstc3(HwOstc3::open(ctx, port, model)?),
            Family::UwatecSmart => Device::UwatecSmart(UwatecSmart::open(ctx, port)?),
            Family::UwatecMemomouse => Device::UwatecMemomouse(UwatecMemomouse::open(ctx, port)?),
            Family::ReefnetSensus => Device::ReefnetSensus(ReefnetSensus::open(ctx, port)?),
            Family::DivesystemIdive => {
                Device::DivesystemIdive(DivesystemIdive::open(ctx, port, model)?)
            }
            Family::OceansS1 => Device::OceansS1(OceansS1::open(ctx, port)?),
            Family::DeepbluCosmiq => Device::DeepbluCosmiq(DeepbluCosmiq::open(ctx, port)?),
            Family::SeacScreen => Device::SeacScreen(SeacScreen::open(ctx, port)?),
            Family::MaresIconHd => Device::MaresIconHd(MaresIconHd::open(ctx, port, model)?),
            Family::OceanicVeo250 => Device::OceanicVeo250(OceanicVeo250::open(ctx, port)?),
        };
        Ok(device)
    }

    pub fn family(&self) -> Family {
        dispatch!(self, d => d.family())
    }

    pub fn fingerprint_size(&self) -> usize {
        dispatch!(self, d => d.base().fingerprint_size())
    }

    /// Store the fingerprint of the newest dive already downloaded; an empty
    /// slice clears it.
    pub fn set_fingerprint(&mut self, data: &[u8]) -> Result<()> {
        dispatch!(self, d => d.base_mut().set_fingerprint(data))
    }

    pub fn set_events<F>(&mut self, mask: EventMask, callback: F)
    where
        F: FnMut(&Event) + 'a,
    {
        dispatch!(self, d => d.base_mut().set_events(mask, Some(Box::new(callback))))
    }

    pub fn clear_events(&mut self) {
        dispatch!(self, d => d.base_mut().set_events(EventMask::NONE, None))
    }

    pub fn set_cancel(&mut self, token: Option<CancelToken>) {
        dispatch!(self, d => d.base_mut().set_cancel(token))
    }

    pub fn read(&mut self, address: u32, size: usize) -> Result<Vec<u8>> {
        dispatch!(self, d => d.read(address, size))
    }

    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        dispatch!(self, d => d.write(address, data))
    }

    pub fn dump(&mut self) -> Result<Vec<u8>> {
        dispatch!(self, d => d.dump())
    }

    /// Dump into a caller-supplied buffer, returning the image length.
    pub fn dump_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        let image = self.dump()?;
        if image.len() > buf.len() {
            return Err(Error::NoMemory {
                needed: image.len(),
                available: buf.len(),
            });
        }
        buf[..image.len()].copy_from_slice(&image);
        Ok(image.len())
    }

    pub fn foreach<F>(&mut self, mut callback: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let result = dispatch!(self, d => d.foreach(&mut callback));
        if let Err(e) = &result {
            tracing::warn!(family = %self.family(), error = %e, "dive download failed");
        }
        result
    }

    pub fn timesync(&mut self, datetime: &NaiveDateTime) -> Result<()> {
        dispatch!(self, d => d.timesync(datetime))
    }

    /// Say goodbye to the device and release an owned stream. A borrowed
    /// stream stays open.
    pub fn close(&mut self) -> Result<()> {
        dispatch!(self, d => {
            if d.base().is_closed() {
                return Ok(());
            }
            d.close()
        })
    }
}
