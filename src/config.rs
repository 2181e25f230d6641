// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-board verified-boot settings.

use crate::{FirmwareType, SlotDescriptor, SlotLabel};

/// Where the firmware images live in the firmware store.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FlashMap {
    ro_recovery: SlotDescriptor,
    rw_a: SlotDescriptor,
    rw_b: SlotDescriptor,
    next_stage: Option<SlotDescriptor>,
}

impl FlashMap {
    /// Builds a map from the three firmware regions every board has. The
    /// descriptors must carry the matching labels; anything else is a board
    /// definition bug, caught by `resolve` returning `None`.
    pub const fn new(
        ro_recovery: SlotDescriptor,
        rw_a: SlotDescriptor,
        rw_b: SlotDescriptor,
    ) -> Self {
        Self {
            ro_recovery,
            rw_a,
            rw_b,
            next_stage: None,
        }
    }

    pub const fn with_next_stage(self, next_stage: SlotDescriptor) -> Self {
        Self {
            next_stage: Some(next_stage),
            ..self
        }
    }

    /// Looks up the region for `label`.
    pub fn resolve(&self, label: SlotLabel) -> Option<SlotDescriptor> {
        let d = match label {
            SlotLabel::RoRecovery => Some(self.ro_recovery),
            SlotLabel::RwA => Some(self.rw_a),
            SlotLabel::RwB => Some(self.rw_b),
            SlotLabel::NextStage => self.next_stage,
        }?;
        (d.label() == label).then_some(d)
    }
}

/// How the boot decision is published to the OS.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExportKind {
    /// ACPI global NVS area (x86).
    Acpi,
    /// Fixed-address legacy table, for boards without ACPI.
    LegacyTable,
    /// Nothing to publish to.
    Disabled,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VbootConfig {
    pub flash_map: FlashMap,
    /// The board keeps a hash of recovery-mode memory training data in the
    /// TPM, so that space has to be created at factory init and locked
    /// along with the kernel space.
    pub has_rec_hash: bool,
    /// S3 resume must come back through the same RW firmware it booted.
    pub resume_path_same_as_boot: bool,
    /// Memory init runs from RW firmware rather than RO.
    pub memory_init_in_rw: bool,
    pub export: ExportKind,
    /// Firmware ID string reported to the OS.
    pub fwid: &'static str,
    /// Report this firmware type to the OS regardless of the boot mode.
    pub firmware_type_override: Option<FirmwareType>,
}

impl VbootConfig {
    /// Whether the verified firmware digest needs to be saved on boot and
    /// checked on resume.
    pub fn needs_resume_hash(&self) -> bool {
        self.resume_path_same_as_boot && self.memory_init_in_rw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAP: FlashMap = FlashMap::new(
        SlotDescriptor::new(SlotLabel::RoRecovery, 0x0, 0x1000),
        SlotDescriptor::new(SlotLabel::RwA, 0x1000, 0x1000),
        SlotDescriptor::new(SlotLabel::RwB, 0x2000, 0x1000),
    );

    #[test]
    fn resolve_by_label() {
        assert_eq!(MAP.resolve(SlotLabel::RwB).unwrap().offset(), 0x2000);
        assert_eq!(MAP.resolve(SlotLabel::NextStage), None);

        let map = MAP.with_next_stage(SlotDescriptor::new(SlotLabel::NextStage, 0x3000, 0x800));
        assert_eq!(map.resolve(SlotLabel::NextStage).unwrap().size(), 0x800);
    }

    #[test]
    fn mislabelled_entry_does_not_resolve() {
        let map = FlashMap::new(
            SlotDescriptor::new(SlotLabel::RoRecovery, 0x0, 0x1000),
            SlotDescriptor::new(SlotLabel::RwB, 0x1000, 0x1000),
            SlotDescriptor::new(SlotLabel::RwB, 0x2000, 0x1000),
        );
        assert_eq!(map.resolve(SlotLabel::RwA), None);
    }
}
