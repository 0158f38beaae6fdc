//! Framings shared by more than one backend.

pub mod slip;
pub mod xmodem;
