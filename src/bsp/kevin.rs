// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// BSP for Kevin (RK3399)
///
/// No ACPI on ARM, so the boot state goes into the legacy table. The
/// next-stage loader is verified as its own region.
use super::Bsp;
use crate::config::{ExportKind, FlashMap, VbootConfig};
use crate::{SlotDescriptor, SlotLabel};

pub struct Board;

impl Bsp for Board {
    fn config() -> VbootConfig {
        VbootConfig {
            flash_map: FlashMap::new(
                SlotDescriptor::new(SlotLabel::RoRecovery, 0x0000_0000, 0x0010_0000),
                SlotDescriptor::new(SlotLabel::RwA, 0x0030_0000, 0x000f_0000),
                SlotDescriptor::new(SlotLabel::RwB, 0x0050_0000, 0x000f_0000),
            )
            .with_next_stage(SlotDescriptor::new(SlotLabel::NextStage, 0x0070_0000, 0x0004_0000)),
            has_rec_hash: false,
            resume_path_same_as_boot: false,
            memory_init_in_rw: false,
            export: ExportKind::LegacyTable,
            fwid: "Google_Kevin.8785.0.0",
            firmware_type_override: None,
        }
    }
}
