//! Verified-boot stage sequencing.
//!
//! This crate contains the part of the boot firmware that decides which
//! firmware image runs next and makes sure that decision is committed safely:
//! it sets up the root of trust, asks the verification library to select and
//! verify a slot, extends the resulting measurements into PCRs, locks the
//! secure NV regions that must not change after this point, publishes the
//! outcome for the OS, and finally hands control to the chosen image.
//!
//! Anything that goes wrong on the way collapses into a single answer --
//! reboot -- which the enclosing boot stage is expected to carry out.

#![cfg_attr(not(test), no_std)]

pub mod bsp;
pub mod config;
pub mod context;
pub mod export;
pub mod nvdata;
pub mod secdata;
pub mod sequencer;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod tpm;
pub mod tpm2;
pub mod transfer;
pub mod verify;
pub mod vstore;

use num_derive::FromPrimitive;

/// Names the firmware image regions the sequencer can pick between.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum SlotLabel {
    /// Read-only recovery firmware.
    RoRecovery = 0,
    /// Read-write slot A.
    RwA = 1,
    /// Read-write slot B.
    RwB = 2,
    /// The next-stage loader, for boards that verify it separately.
    NextStage = 3,
}

impl SlotLabel {
    pub fn name(self) -> &'static str {
        match self {
            SlotLabel::RoRecovery => "RO-recovery",
            SlotLabel::RwA => "RW-A",
            SlotLabel::RwB => "RW-B",
            SlotLabel::NextStage => "next-stage",
        }
    }
}

/// Identifies a firmware image region within the firmware store.
///
/// Descriptors are only ever produced from the board flash map, and the
/// fields are private so that nothing downstream can quietly nudge the offset
/// of a region that has already been verified.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SlotDescriptor {
    offset: u32,
    size: u32,
    label: SlotLabel,
}

impl SlotDescriptor {
    pub const fn new(label: SlotLabel, offset: u32, size: u32) -> Self {
        Self { offset, size, label }
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn label(&self) -> SlotLabel {
        self.label
    }

    /// One past the last byte of the region, or `None` if the region wraps
    /// the address space (which no sane flash map contains).
    pub fn end(&self) -> Option<u32> {
        self.offset.checked_add(self.size)
    }
}

/// Firmware type as reported to the OS.
///
/// The discriminants are the values the OS-side tooling expects, so don't
/// reorder these.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum FirmwareType {
    Recovery = 0,
    Normal = 1,
    Developer = 2,
}

impl FirmwareType {
    pub fn is_recovery(self) -> bool {
        self == FirmwareType::Recovery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn descriptor_end_detects_wrap() {
        let ok = SlotDescriptor::new(SlotLabel::RwA, 0x1000, 0x2000);
        assert_eq!(ok.end(), Some(0x3000));

        let wraps = SlotDescriptor::new(SlotLabel::RwB, u32::MAX - 4, 8);
        assert_eq!(wraps.end(), None);
    }

    #[test]
    fn firmware_type_values_are_stable() {
        assert_eq!(FirmwareType::from_u8(0), Some(FirmwareType::Recovery));
        assert_eq!(FirmwareType::from_u8(1), Some(FirmwareType::Normal));
        assert_eq!(FirmwareType::from_u8(2), Some(FirmwareType::Developer));
        assert_eq!(FirmwareType::from_u8(3), None);
    }
}
