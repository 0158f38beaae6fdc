//! Dive extraction from downloaded memory.
//!
//! The engines here are wrap-free once the image is linearized and work on
//! plain byte slices, so they run equally on a live download and on an image
//! saved by an earlier [`crate::Device::dump`].

pub mod logbook;
pub mod markers;

use std::ops::ControlFlow;

use crate::backend::{
    hw_ostc, mares_iconhd, reefnet_sensus, shearwater_predator, uwatec_memomouse, uwatec_smart,
};
use crate::device::{DiveCallback, Family};
use crate::error::{Error, Result};

/// Fingerprint gate in front of the user callback. `Break` ends the walk
/// without an error.
pub fn deliver(
    stored: &[u8],
    callback: &mut DiveCallback<'_>,
    dive: &[u8],
    fingerprint: &[u8],
) -> ControlFlow<()> {
    if !stored.is_empty() && stored == fingerprint {
        tracing::debug!("fingerprint matched, stopping");
        return ControlFlow::Break(());
    }
    if callback(dive, fingerprint) {
        ControlFlow::Continue(())
    } else {
        ControlFlow::Break(())
    }
}

/// Split a memory image produced by `dump` into dives, newest first.
pub fn extract_dives(
    family: Family,
    image: &[u8],
    fingerprint: &[u8],
    callback: &mut DiveCallback<'_>,
) -> Result<()> {
    match family {
        Family::ShearwaterPredator => shearwater_predator::extract_dives(image, fingerprint, callback),
        Family::HwOstc => hw_ostc::extract_dives(image, fingerprint, callback),
        Family::UwatecSmart => uwatec_smart::extract_dives(image, fingerprint, callback),
        Family::UwatecMemomouse => uwatec_memomouse::extract_dives(image, fingerprint, callback),
        Family::ReefnetSensus => reefnet_sensus::extract_dives(image, fingerprint, callback),
        Family::MaresIconHd => mares_iconhd::extract_dives(image, fingerprint, callback),
        _ => Err(Error::Unsupported),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deliver_gate() {
        let mut seen = Vec::new();
        let mut callback = |dive: &[u8], _fp: &[u8]| {
            seen.push(dive.to_vec());
            dive[0] != 0
        };
        assert!(deliver(&[], &mut callback, &[1], &[7]).is_continue());
        assert!(deliver(&[7], &mut callback, &[2], &[7]).is_break());
        assert!(deliver(&[7], &mut callback, &[0], &[8]).is_break());
        assert_eq!(seen, vec![vec![1], vec![0]]);
    }

    #[test]
    fn test_online_only_families_are_unsupported() {
        let mut callback = |_: &[u8], _: &[u8]| true;
        assert_eq!(
            extract_dives(Family::OceansS1, &[0u8; 16], &[], &mut callback),
            Err(Error::Unsupported)
        );
    }
}
