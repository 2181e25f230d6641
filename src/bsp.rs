// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Board Support Packages (BSPs) for the verified-boot stage.
//!
//! The sequencer doesn't care much about the board. What it does need to
//! know (where the images are, which optional NV spaces exist, how resume
//! works, where to publish the result) is gathered into a `VbootConfig` by
//! the `Bsp` trait below.
//!
//! To implement a BSP:
//!
//! 1. Create a module within `bsp` named after your board.
//! 2. Define a unit struct in the module called `Board`.
//! 3. Implement `Bsp` for your `Board` type.
//! 4. Add a `target-board-*` feature to `Cargo.toml`.
//! 5. Add a branch to the `cfg_if` below so the feature selects your
//!    `Board`.

// All BSPs are always compiled, whichever one is selected, so that they all
// keep building.
pub mod coral;
pub mod kevin;
pub mod sandbox;

use crate::config::VbootConfig;

/// Requirements placed upon a BSP type.
pub trait Bsp {
    /// The board's verified-boot settings.
    fn config() -> VbootConfig;
}

cfg_if::cfg_if! {
    if #[cfg(feature = "target-board-coral")] {
        pub type Board = coral::Board;
    } else if #[cfg(feature = "target-board-kevin")] {
        pub type Board = kevin::Board;
    } else if #[cfg(feature = "target-board-sandbox")] {
        pub type Board = sandbox::Board;
    } else {
        compile_error!("no target-board-* feature selected");
    }
}

/// Name of the board this build is for.
pub const BOARD_NAME: &str = env!("VBOOT_STAGE_BOARD");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SlotLabel;

    const LABELS: [SlotLabel; 3] = [SlotLabel::RoRecovery, SlotLabel::RwA, SlotLabel::RwB];

    fn check(config: VbootConfig) {
        for label in LABELS {
            let slot = config
                .flash_map
                .resolve(label)
                .unwrap_or_else(|| panic!("{:?} missing", label));
            assert!(slot.size() > 0);
            assert!(slot.end().is_some());
        }
        // The firmware regions don't overlap.
        for a in LABELS {
            for b in LABELS {
                if a == b {
                    continue;
                }
                let a = config.flash_map.resolve(a).unwrap();
                let b = config.flash_map.resolve(b).unwrap();
                assert!(a.end().unwrap() <= b.offset() || b.end().unwrap() <= a.offset());
            }
        }
    }

    #[test]
    fn flash_maps_are_sane() {
        check(coral::Board::config());
        check(kevin::Board::config());
        check(sandbox::Board::config());
    }

    #[test]
    fn selected_board_is_named() {
        assert!(BOARD_NAME.starts_with("target-board-"));
        check(Board::config());
    }
}
