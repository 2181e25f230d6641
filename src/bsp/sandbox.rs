// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! BSP for the host sandbox.
//!
//! Everything is small enough to live in memory, and every optional feature
//! is switched on so the sandbox can exercise it.

use super::Bsp;
use crate::config::{ExportKind, FlashMap, VbootConfig};
use crate::{SlotDescriptor, SlotLabel};

/// Size of each firmware region in the sandbox image.
pub const SLOT_SIZE: u32 = 0x1000;

pub const FLASH_MAP: FlashMap = FlashMap::new(
    SlotDescriptor::new(SlotLabel::RoRecovery, 0, SLOT_SIZE),
    SlotDescriptor::new(SlotLabel::RwA, SLOT_SIZE, SLOT_SIZE),
    SlotDescriptor::new(SlotLabel::RwB, 2 * SLOT_SIZE, SLOT_SIZE),
);

pub struct Board;

impl Bsp for Board {
    fn config() -> VbootConfig {
        VbootConfig {
            flash_map: FLASH_MAP,
            has_rec_hash: true,
            resume_path_same_as_boot: true,
            memory_init_in_rw: true,
            export: ExportKind::LegacyTable,
            fwid: "Sandbox.0.0.0",
            firmware_type_override: None,
        }
    }
}
