// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Slot transfer: the last thing this stage does.
//!
//! The selected slot is checked once more against the board flash map, the
//! handoff record for the next stage is frozen, the image is read into the
//! load buffer, and control is handed over. On real hardware the last step
//! does not come back.

use bitflags::bitflags;
use crc::{Crc, CRC_32_ISO_HDLC};
use log::{error, info};
use static_assertions::const_assert_eq;
use thiserror::Error;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::config::FlashMap;
use crate::context::Switches;
use crate::{FirmwareType, SlotDescriptor};

pub const HANDOFF_MAGIC: [u8; 4] = *b"VBHO";
pub const HANDOFF_VERSION: u16 = 1;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Errors from the firmware store.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum FwStoreError {
    #[error("firmware store I/O error")]
    Io,
    #[error("read outside the firmware store")]
    OutOfRange,
}

/// The device holding the firmware images (SPI flash, eMMC, ...).
pub trait FwStore {
    /// Size of the store in bytes.
    fn size(&self) -> u32;

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), FwStoreError>;
}

bitflags! {
    /// Requests from this stage to the next about how to bring up the
    /// platform.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct OutFlags: u32 {
        const ENABLE_RECOVERY = 1 << 0;
        const CLEAR_RAM = 1 << 1;
        const ENABLE_DISPLAY = 1 << 2;
        const ENABLE_USB_STORAGE = 1 << 3;
        const ENABLE_DEVELOPER = 1 << 7;
    }
}

bitflags! {
    /// Boot state flags shared with the next stage, numbered as in the
    /// shared data header the OS reads.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct SharedFlags: u32 {
        const LF_DEV_SWITCH_ON = 1 << 2;
        const BOOT_DEV_SWITCH_ON = 1 << 4;
        const BOOT_REC_SWITCH_ON = 1 << 5;
        const BOOT_FIRMWARE_WP_ENABLED = 1 << 6;
        const BOOT_S3_RESUME = 1 << 8;
    }
}

impl SharedFlags {
    pub fn from_switches(switches: &Switches, developer: bool) -> Self {
        let mut flags = SharedFlags::empty();
        if developer {
            flags |= SharedFlags::BOOT_DEV_SWITCH_ON | SharedFlags::LF_DEV_SWITCH_ON;
        }
        if switches.force_recovery {
            flags |= SharedFlags::BOOT_REC_SWITCH_ON;
        }
        if switches.write_protect {
            flags |= SharedFlags::BOOT_FIRMWARE_WP_ENABLED;
        }
        if switches.resume {
            flags |= SharedFlags::BOOT_S3_RESUME;
        }
        flags
    }
}

impl OutFlags {
    /// The flags implied by the boot mode. Recovery and developer mode both
    /// want memory wiped and a display and USB storage available.
    pub fn for_mode(recovery: bool, developer: bool) -> Self {
        let mut flags = OutFlags::empty();
        if recovery {
            flags |= OutFlags::ENABLE_RECOVERY;
        }
        if developer {
            flags |= OutFlags::ENABLE_DEVELOPER;
        }
        if recovery || developer {
            flags |= OutFlags::CLEAR_RAM | OutFlags::ENABLE_DISPLAY | OutFlags::ENABLE_USB_STORAGE;
        }
        flags
    }
}

/// The record handed to the next stage, as laid out in memory.
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct HandoffRecord {
    magic: [u8; 4],
    version: U16<LittleEndian>,
    slot: u8,
    firmware_type: u8,
    out_flags: U32<LittleEndian>,
    shared_flags: U32<LittleEndian>,
    recovery_reason: U32<LittleEndian>,
    fw_version: U32<LittleEndian>,
    image_offset: U32<LittleEndian>,
    image_size: U32<LittleEndian>,
    /// CRC-32 of every preceding byte.
    crc: U32<LittleEndian>,
}

const_assert_eq!(core::mem::size_of::<HandoffRecord>(), 36);

/// Collects the handoff fields while the record can still change.
#[derive(Copy, Clone, Debug)]
pub struct HandoffBuilder {
    firmware_type: FirmwareType,
    out_flags: OutFlags,
    shared_flags: SharedFlags,
    recovery_reason: u8,
    fw_version: u32,
}

impl HandoffBuilder {
    pub fn new(firmware_type: FirmwareType) -> Self {
        Self {
            firmware_type,
            out_flags: OutFlags::empty(),
            shared_flags: SharedFlags::empty(),
            recovery_reason: 0,
            fw_version: 0,
        }
    }

    pub fn out_flags(mut self, flags: OutFlags) -> Self {
        self.out_flags = flags;
        self
    }

    pub fn shared_flags(mut self, flags: SharedFlags) -> Self {
        self.shared_flags = flags;
        self
    }

    pub fn recovery_reason(mut self, reason: u8) -> Self {
        self.recovery_reason = reason;
        self
    }

    pub fn fw_version(mut self, version: u32) -> Self {
        self.fw_version = version;
        self
    }

    /// Fills in the image location and seals the record.
    pub fn finish(self, slot: &SlotDescriptor) -> FrozenHandoff {
        let mut record = HandoffRecord {
            magic: HANDOFF_MAGIC,
            version: U16::new(HANDOFF_VERSION),
            slot: slot.label() as u8,
            firmware_type: self.firmware_type as u8,
            out_flags: U32::new(self.out_flags.bits()),
            shared_flags: U32::new(self.shared_flags.bits()),
            recovery_reason: U32::new(u32::from(self.recovery_reason)),
            fw_version: U32::new(self.fw_version),
            image_offset: U32::new(slot.offset()),
            image_size: U32::new(slot.size()),
            crc: U32::new(0),
        };
        record.crc = U32::new(record_crc(&record));
        FrozenHandoff { record }
    }
}

fn record_crc(record: &HandoffRecord) -> u32 {
    let bytes = record.as_bytes();
    CRC32.checksum(&bytes[..bytes.len() - 4])
}

/// A sealed handoff record. It can be read and copied out, never changed.
#[derive(Copy, Clone, Debug)]
pub struct FrozenHandoff {
    record: HandoffRecord,
}

impl FrozenHandoff {
    pub fn as_bytes(&self) -> &[u8] {
        self.record.as_bytes()
    }

    pub fn slot(&self) -> u8 {
        self.record.slot
    }

    pub fn firmware_type(&self) -> u8 {
        self.record.firmware_type
    }

    pub fn out_flags(&self) -> OutFlags {
        OutFlags::from_bits_retain(self.record.out_flags.get())
    }

    pub fn shared_flags(&self) -> SharedFlags {
        SharedFlags::from_bits_retain(self.record.shared_flags.get())
    }

    pub fn image_offset(&self) -> u32 {
        self.record.image_offset.get()
    }

    pub fn image_size(&self) -> u32 {
        self.record.image_size.get()
    }

    pub fn crc(&self) -> u32 {
        self.record.crc.get()
    }

    /// Re-checks the CRC, as the next stage would.
    pub fn is_intact(&self) -> bool {
        record_crc(&self.record) == self.crc()
    }
}

/// An image read into memory and ready to run.
pub struct LoadedImage<'a> {
    pub slot: SlotDescriptor,
    pub bytes: &'a [u8],
    pub handoff: &'a FrozenHandoff,
}

/// Hands control to a loaded image.
///
/// A hardware launcher jumps and never returns, so its `Exit` is
/// uninhabited. Test launchers record what they were given and come back.
pub trait Launch {
    type Exit;

    fn launch(&mut self, image: LoadedImage<'_>) -> Self::Exit;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum TransferError {
    #[error("slot descriptor does not match the flash map")]
    BadDescriptor,
    #[error("slot lies outside the firmware store")]
    OutOfBounds,
    #[error("slot does not fit in the load buffer")]
    TooLarge,
    #[error("could not read slot: {0}")]
    Unreadable(FwStoreError),
}

pub struct SlotTransfer<'a> {
    fwstore: &'a dyn FwStore,
    flash_map: &'a FlashMap,
    load_buffer: &'a mut [u8],
}

impl<'a> SlotTransfer<'a> {
    pub fn new(
        fwstore: &'a dyn FwStore,
        flash_map: &'a FlashMap,
        load_buffer: &'a mut [u8],
    ) -> Self {
        Self {
            fwstore,
            flash_map,
            load_buffer,
        }
    }

    /// Checks that `slot` is exactly what the flash map says it is and that
    /// it can be read and loaded.
    pub fn validate(&self, slot: &SlotDescriptor) -> Result<(), TransferError> {
        if self.flash_map.resolve(slot.label()) != Some(*slot) || slot.size() == 0 {
            return Err(TransferError::BadDescriptor);
        }
        match slot.end() {
            Some(end) if end <= self.fwstore.size() => {}
            _ => return Err(TransferError::OutOfBounds),
        }
        if slot.size() as usize > self.load_buffer.len() {
            return Err(TransferError::TooLarge);
        }
        Ok(())
    }

    /// Freezes `handoff`, loads `slot` and launches it.
    ///
    /// Nothing is read until the descriptor has been validated, and the
    /// handoff record can't change once the image has been read.
    pub fn finalize_and_jump<L: Launch>(
        &mut self,
        slot: &SlotDescriptor,
        handoff: HandoffBuilder,
        launcher: &mut L,
    ) -> Result<L::Exit, TransferError> {
        self.validate(slot).map_err(|e| {
            error!("transfer: {:?} rejected: {}", slot, e);
            e
        })?;

        let handoff = handoff.finish(slot);

        let image = &mut self.load_buffer[..slot.size() as usize];
        self.fwstore.read(slot.offset(), image).map_err(|e| {
            error!("transfer: read of {} failed: {}", slot.label().name(), e);
            TransferError::Unreadable(e)
        })?;

        info!(
            "transfer: jumping to {} at {:#x} ({:#x} bytes)",
            slot.label().name(),
            slot.offset(),
            slot.size()
        );
        Ok(launcher.launch(LoadedImage {
            slot: *slot,
            bytes: image,
            handoff: &handoff,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::MemFlash;
    use crate::SlotLabel;

    struct Recorder {
        launched: Option<(SlotDescriptor, std::vec::Vec<u8>, FrozenHandoff)>,
    }

    impl Launch for Recorder {
        type Exit = ();

        fn launch(&mut self, image: LoadedImage<'_>) {
            self.launched = Some((image.slot, image.bytes.to_vec(), *image.handoff));
        }
    }

    fn flash_map() -> FlashMap {
        FlashMap::new(
            SlotDescriptor::new(SlotLabel::RoRecovery, 0, 8),
            SlotDescriptor::new(SlotLabel::RwA, 8, 8),
            SlotDescriptor::new(SlotLabel::RwB, 16, 8),
        )
    }

    fn image() -> [u8; 24] {
        let mut image = [0; 24];
        for (i, b) in image.iter_mut().enumerate() {
            *b = i as u8;
        }
        image
    }

    #[test]
    fn crc32_is_the_usual_one() {
        assert_eq!(CRC32.checksum(b"123456789"), 0xcbf4_3926);
    }

    #[test]
    fn handoff_crc_covers_record() {
        let slot = SlotDescriptor::new(SlotLabel::RwB, 16, 8);
        let handoff = HandoffBuilder::new(FirmwareType::Developer)
            .out_flags(OutFlags::for_mode(false, true))
            .recovery_reason(0)
            .fw_version(0x0001_0002)
            .finish(&slot);

        let bytes = handoff.as_bytes();
        assert_eq!(bytes.len(), 36);
        assert_eq!(&bytes[..4], b"VBHO");
        assert_eq!(bytes[6], SlotLabel::RwB as u8);
        assert_eq!(bytes[7], FirmwareType::Developer as u8);
        assert_eq!(CRC32.checksum(&bytes[..32]), handoff.crc());
        assert_eq!(&bytes[32..], &handoff.crc().to_le_bytes());
        assert!(handoff.is_intact());
        assert!(handoff.out_flags().contains(OutFlags::ENABLE_DEVELOPER | OutFlags::CLEAR_RAM));
        assert_eq!(handoff.image_offset(), 16);
        assert_eq!(handoff.image_size(), 8);
    }

    #[test]
    fn shared_flags_from_switches() {
        let switches = Switches {
            write_protect: true,
            resume: true,
            ..Switches::default()
        };
        let flags = SharedFlags::from_switches(&switches, false);
        assert_eq!(
            flags,
            SharedFlags::BOOT_FIRMWARE_WP_ENABLED | SharedFlags::BOOT_S3_RESUME
        );
        assert!(SharedFlags::from_switches(&Switches::default(), true)
            .contains(SharedFlags::BOOT_DEV_SWITCH_ON));
    }

    #[test]
    fn out_flags_by_mode() {
        assert_eq!(OutFlags::for_mode(false, false), OutFlags::empty());
        let rec = OutFlags::for_mode(true, false);
        assert!(rec.contains(OutFlags::ENABLE_RECOVERY | OutFlags::ENABLE_USB_STORAGE));
        assert!(!rec.contains(OutFlags::ENABLE_DEVELOPER));
    }

    #[test]
    fn jump_loads_verified_slot() {
        let image = image();
        let flash = MemFlash::new(&image);
        let map = flash_map();
        let mut buf = [0; 16];
        let mut xfer = SlotTransfer::new(&flash, &map, &mut buf);
        let mut launcher = Recorder { launched: None };

        let slot = map.resolve(SlotLabel::RwA).unwrap();
        xfer.finalize_and_jump(&slot, HandoffBuilder::new(FirmwareType::Normal), &mut launcher)
            .unwrap();

        let (launched, bytes, handoff) = launcher.launched.unwrap();
        assert_eq!(launched, slot);
        assert_eq!(bytes, &image[8..16]);
        assert_eq!(handoff.slot(), SlotLabel::RwA as u8);
        assert!(handoff.is_intact());
    }

    #[test]
    fn substituted_descriptor_is_rejected() {
        let image = image();
        let flash = MemFlash::new(&image);
        let map = flash_map();
        let mut buf = [0; 16];
        let mut xfer = SlotTransfer::new(&flash, &map, &mut buf);
        let mut launcher = Recorder { launched: None };

        // Right label, wrong region.
        let forged = SlotDescriptor::new(SlotLabel::RwA, 16, 8);
        assert_eq!(
            xfer.finalize_and_jump(
                &forged,
                HandoffBuilder::new(FirmwareType::Normal),
                &mut launcher,
            ),
            Err(TransferError::BadDescriptor)
        );
        assert!(launcher.launched.is_none());
    }

    #[test]
    fn slot_must_fit() {
        let image = image();
        let map = FlashMap::new(
            SlotDescriptor::new(SlotLabel::RoRecovery, 0, 8),
            SlotDescriptor::new(SlotLabel::RwA, 8, 32),
            SlotDescriptor::new(SlotLabel::RwB, 16, 8),
        );
        let mut buf = [0; 4];
        let flash = MemFlash::new(&image);
        let xfer = SlotTransfer::new(&flash, &map, &mut buf);

        assert_eq!(
            xfer.validate(&map.resolve(SlotLabel::RwA).unwrap()),
            Err(TransferError::OutOfBounds)
        );
        assert_eq!(
            xfer.validate(&map.resolve(SlotLabel::RwB).unwrap()),
            Err(TransferError::TooLarge)
        );
    }

    #[test]
    fn read_failure_does_not_launch() {
        let image = image();
        let flash = MemFlash::new(&image);
        flash.fail_reads();
        let map = flash_map();
        let mut buf = [0; 16];
        let mut xfer = SlotTransfer::new(&flash, &map, &mut buf);
        let mut launcher = Recorder { launched: None };

        let slot = map.resolve(SlotLabel::RoRecovery).unwrap();
        assert_eq!(
            xfer.finalize_and_jump(
                &slot,
                HandoffBuilder::new(FirmwareType::Recovery),
                &mut launcher,
            ),
            Err(TransferError::Unreadable(FwStoreError::Io))
        );
        assert!(launcher.launched.is_none());
    }
}
