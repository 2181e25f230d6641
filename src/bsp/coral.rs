// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// BSP for Coral (Apollo Lake Chromebooks)
///
/// Memory init runs from RO here, so resume doesn't need the firmware hash,
/// but the recovery-mode training data hash lives in the TPM.
use super::Bsp;
use crate::config::{ExportKind, FlashMap, VbootConfig};
use crate::{SlotDescriptor, SlotLabel};

pub struct Board;

impl Bsp for Board {
    fn config() -> VbootConfig {
        VbootConfig {
            flash_map: FlashMap::new(
                SlotDescriptor::new(SlotLabel::RoRecovery, 0x0010_0000, 0x0008_0000),
                SlotDescriptor::new(SlotLabel::RwA, 0x0044_0000, 0x0008_0000),
                SlotDescriptor::new(SlotLabel::RwB, 0x0084_0000, 0x0008_0000),
            ),
            has_rec_hash: true,
            resume_path_same_as_boot: true,
            memory_init_in_rw: false,
            export: ExportKind::Acpi,
            fwid: "Google_Coral.10068.0.0",
            firmware_type_override: None,
        }
    }
}
