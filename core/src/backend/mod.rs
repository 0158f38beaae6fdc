//! Per-model protocols. Each module owns one family's wire format, its
//! [`crate::device::DeviceBackend`] implementation and, where dives can be
//! cut out of a memory image, a free `extract_dives` function.

pub mod deepblu_cosmiq;
pub mod divesystem_idive;
pub mod hw_ostc;
pub mod hw_ostc3;
pub mod mares_iconhd;
pub mod oceanic_veo250;
pub mod oceans_s1;
pub mod reefnet_sensus;
pub mod seac_screen;
pub mod shearwater_common;
pub mod shearwater_petrel;
pub mod shearwater_predator;
pub mod uwatec_memomouse;
pub mod uwatec_smart;
