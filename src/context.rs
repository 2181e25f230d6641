// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-attempt boot state.
//!
//! One [`BootContext`] is built when the sequencer starts and is threaded
//! through every phase by mutable borrow. Nothing else holds on to it.

use heapless::Vec;
use log::debug;
use thiserror::Error;

use crate::nvdata::{RegionKind, RegionLock, RegionSet, RegionStore, StoreError};
use crate::secdata::{SECDATA_FIRMWARE_SIZE, SECDATA_KERNEL_SIZE};
use crate::tpm::Measurement;
use crate::verify::{GbbFlags, Selection, MAX_MEASUREMENTS};
use crate::{FirmwareType, SlotDescriptor};

/// Size of the NVDATA (Standard region) blob.
pub const NVDATA_SIZE: usize = 64;

/// The regions the sequencer keeps a copy of and writes back when changed,
/// in write-back order.
pub const PERSISTED: [RegionKind; 3] = [
    RegionKind::Standard,
    RegionKind::SecureFirmware,
    RegionKind::SecureKernel,
];

#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum ContextError {
    #[error("a slot has already been selected")]
    AlreadySelected,
    #[error("too many measurements")]
    TooManyMeasurements,
}

/// Switch inputs sampled before the sequencer starts.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Switches {
    pub force_recovery: bool,
    pub developer: bool,
    pub write_protect: bool,
    /// This is an S3 resume rather than a cold boot.
    pub resume: bool,
}

/// Copies of the persistent regions, with dirty tracking.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PersistentData {
    nvdata: [u8; NVDATA_SIZE],
    secdata_firmware: [u8; SECDATA_FIRMWARE_SIZE],
    secdata_kernel: [u8; SECDATA_KERNEL_SIZE],
    dirty: RegionSet,
}

impl Default for PersistentData {
    fn default() -> Self {
        Self {
            nvdata: [0; NVDATA_SIZE],
            secdata_firmware: [0; SECDATA_FIRMWARE_SIZE],
            secdata_kernel: [0; SECDATA_KERNEL_SIZE],
            dirty: RegionSet::EMPTY,
        }
    }
}

impl PersistentData {
    /// The copy of `kind`, if we keep one.
    pub fn get(&self, kind: RegionKind) -> Option<&[u8]> {
        match kind {
            RegionKind::Standard => Some(&self.nvdata[..]),
            RegionKind::SecureFirmware => Some(&self.secdata_firmware[..]),
            RegionKind::SecureKernel => Some(&self.secdata_kernel[..]),
            _ => None,
        }
    }

    /// Loading buffer for `kind`. This does not mark the buffer dirty.
    pub(crate) fn load_buf(&mut self, kind: RegionKind) -> Option<&mut [u8]> {
        match kind {
            RegionKind::Standard => Some(&mut self.nvdata[..]),
            RegionKind::SecureFirmware => Some(&mut self.secdata_firmware[..]),
            RegionKind::SecureKernel => Some(&mut self.secdata_kernel[..]),
            _ => None,
        }
    }

    /// Mutable access to `kind`; the region will be written back after the
    /// current phase.
    pub fn get_mut(&mut self, kind: RegionKind) -> Option<&mut [u8]> {
        if self.get(kind).is_some() {
            self.dirty.insert(kind);
        }
        self.load_buf(kind)
    }

    /// Replaces our copy of `kind` with what the store holds.
    pub(crate) fn load_from(
        &mut self,
        store: &RegionStore<'_>,
        kind: RegionKind,
    ) -> Result<(), StoreError> {
        if let Some(buf) = self.load_buf(kind) {
            store.read(kind, buf)?;
            debug!("{:?}: {:02x?}", kind, buf);
        }
        Ok(())
    }

    pub fn is_dirty(&self, kind: RegionKind) -> bool {
        self.dirty.contains(kind)
    }

    pub(crate) fn mark_clean(&mut self, kind: RegionKind) {
        self.dirty.remove(kind);
    }
}

/// Everything one boot attempt knows about itself.
#[derive(Debug)]
pub struct BootContext {
    pub switches: Switches,
    pub data: PersistentData,
    recovery_mode: bool,
    firmware_type: FirmwareType,
    recovery_reason: u8,
    gbb_flags: GbbFlags,
    fw_version: u32,
    selected_slot: Option<SlotDescriptor>,
    measurements: Vec<Measurement, MAX_MEASUREMENTS>,
    kernel_lock: Option<RegionLock>,
}

impl BootContext {
    pub fn new(switches: Switches) -> Self {
        Self {
            switches,
            data: PersistentData::default(),
            recovery_mode: false,
            firmware_type: FirmwareType::Normal,
            recovery_reason: 0,
            gbb_flags: GbbFlags::empty(),
            fw_version: 0,
            selected_slot: None,
            measurements: Vec::new(),
            kernel_lock: None,
        }
    }

    pub fn recovery_mode(&self) -> bool {
        self.recovery_mode
    }

    pub fn firmware_type(&self) -> FirmwareType {
        self.firmware_type
    }

    pub fn recovery_reason(&self) -> u8 {
        self.recovery_reason
    }

    pub fn gbb_flags(&self) -> GbbFlags {
        self.gbb_flags
    }

    pub fn fw_version(&self) -> u32 {
        self.fw_version
    }

    pub fn selected_slot(&self) -> Option<SlotDescriptor> {
        self.selected_slot
    }

    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }

    /// Whether the kernel rollback space has been locked this attempt.
    pub fn kernel_locked(&self) -> bool {
        self.kernel_lock.is_some()
    }

    /// Takes on the library's firmware choice.
    pub(crate) fn apply_selection(&mut self, selection: &Selection) {
        self.firmware_type = selection.firmware_type;
        self.recovery_mode = selection.firmware_type.is_recovery();
        self.recovery_reason = selection.recovery_reason;
        self.gbb_flags = selection.gbb_flags;
    }

    pub(crate) fn set_fw_version(&mut self, version: u32) {
        self.fw_version = version;
    }

    pub(crate) fn push_measurement(&mut self, m: Measurement) -> Result<(), ContextError> {
        self.measurements
            .push(m)
            .map_err(|_| ContextError::TooManyMeasurements)
    }

    /// Records the verified slot. This happens once per attempt; a second
    /// selection is refused rather than overwriting the first.
    pub(crate) fn select_slot(&mut self, slot: SlotDescriptor) -> Result<(), ContextError> {
        if self.selected_slot.is_some() {
            return Err(ContextError::AlreadySelected);
        }
        debug!("selected {:?}", slot);
        self.selected_slot = Some(slot);
        Ok(())
    }

    pub(crate) fn hold_kernel_lock(&mut self, lock: RegionLock) {
        self.kernel_lock = Some(lock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SlotLabel;

    #[test]
    fn slot_is_selected_once() {
        let mut ctx = BootContext::new(Switches::default());
        assert_eq!(ctx.selected_slot(), None);

        let a = SlotDescriptor::new(SlotLabel::RwA, 0x1000, 0x100);
        let b = SlotDescriptor::new(SlotLabel::RwB, 0x2000, 0x100);
        ctx.select_slot(a).unwrap();
        assert_eq!(ctx.select_slot(b), Err(ContextError::AlreadySelected));
        assert_eq!(ctx.selected_slot(), Some(a));
    }

    #[test]
    fn get_mut_marks_dirty() {
        let mut data = PersistentData::default();
        assert!(!data.is_dirty(RegionKind::Standard));

        data.get_mut(RegionKind::Standard).unwrap()[0] = 1;
        assert!(data.is_dirty(RegionKind::Standard));
        assert!(!data.is_dirty(RegionKind::SecureKernel));

        // Regions we don't keep a copy of are never dirty.
        assert!(data.get_mut(RegionKind::FirmwareMgmtParams).is_none());
        assert!(!data.is_dirty(RegionKind::FirmwareMgmtParams));

        data.mark_clean(RegionKind::Standard);
        assert!(!data.is_dirty(RegionKind::Standard));
        assert_eq!(data.get(RegionKind::Standard).unwrap()[0], 1);
    }

    #[test]
    fn selection_sets_recovery_mode() {
        let mut ctx = BootContext::new(Switches::default());
        ctx.apply_selection(&Selection {
            firmware_type: FirmwareType::Recovery,
            slot: SlotLabel::RoRecovery,
            gbb_flags: GbbFlags::FORCE_MANUAL_RECOVERY,
            recovery_reason: 0x02,
        });
        assert!(ctx.recovery_mode());
        assert_eq!(ctx.recovery_reason(), 0x02);
        assert!(ctx.gbb_flags().contains(GbbFlags::FORCE_MANUAL_RECOVERY));
    }
}
