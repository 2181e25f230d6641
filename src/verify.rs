// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The seam between the sequencer and the verified-boot library.
//!
//! The library owns the policy: which slot to try, whether its signatures
//! check out, what goes into which PCR. The sequencer owns the order in
//! which those answers are acted on.

use bitflags::bitflags;
use heapless::Vec;
use thiserror::Error;

use crate::context::{PersistentData, Switches};
use crate::tpm::{Digest, Measurement};
use crate::transfer::FwStore;
use crate::{FirmwareType, SlotDescriptor, SlotLabel};

/// Upper bound on the measurements one verification can produce.
pub const MAX_MEASUREMENTS: usize = 8;

bitflags! {
    /// Flags from the read-only firmware header (GBB). Values are fixed by
    /// the image format.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct GbbFlags: u32 {
        const DEV_SCREEN_SHORT_DELAY = 1 << 0;
        const LOAD_OPTION_ROMS = 1 << 1;
        const ENABLE_ALTERNATE_OS = 1 << 2;
        const FORCE_DEV_SWITCH_ON = 1 << 3;
        const FORCE_DEV_BOOT_USB = 1 << 4;
        const DISABLE_FW_ROLLBACK_CHECK = 1 << 5;
        const ENTER_TRIGGERS_TONORM = 1 << 6;
        const FORCE_DEV_BOOT_LEGACY = 1 << 7;
        const FAFT_KEY_OVERIDE = 1 << 8;
        const DISABLE_EC_SOFTWARE_SYNC = 1 << 9;
        const DEFAULT_DEV_BOOT_LEGACY = 1 << 10;
        const DISABLE_PD_SOFTWARE_SYNC = 1 << 11;
        const DISABLE_LID_SHUTDOWN = 1 << 12;
        const FORCE_DEV_BOOT_FASTBOOT_FULL_CAP = 1 << 13;
        const FORCE_MANUAL_RECOVERY = 1 << 14;
        const DISABLE_FWMP = 1 << 15;
        const ENABLE_UDC = 1 << 16;
    }
}

/// Failure reported by the verification library. The code is the library's
/// own and is only logged.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
#[error("verification failed ({0:#x})")]
pub struct VerifyError(pub u32);

/// The library's choice of firmware.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Selection {
    pub firmware_type: FirmwareType,
    pub slot: SlotLabel,
    pub gbb_flags: GbbFlags,
    /// Non-zero when recovery was requested; the value says why.
    pub recovery_reason: u8,
}

/// A slot that has passed verification.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VerifiedSlot {
    pub slot: SlotDescriptor,
    /// PCR extensions, in the order they must be applied.
    pub measurements: Vec<Measurement, MAX_MEASUREMENTS>,
    /// Digest of the firmware body, if the library computed one.
    pub body_digest: Option<Digest>,
    /// Firmware version from the verified preamble.
    pub fw_version: u32,
}

/// The verified-boot library, as seen by the sequencer.
///
/// Both calls may change the persistent data (e.g. bump a try counter or
/// record a recovery request); the library marks what it touched as dirty
/// and the sequencer writes it back.
pub trait Verifier {
    /// Decides what to boot.
    fn select_firmware(
        &mut self,
        data: &mut PersistentData,
        switches: &Switches,
    ) -> Result<Selection, VerifyError>;

    /// Verifies `candidate`, reading it from `fwstore`.
    fn verify_slot(
        &mut self,
        data: &mut PersistentData,
        candidate: &SlotDescriptor,
        fwstore: &dyn FwStore,
    ) -> Result<VerifiedSlot, VerifyError>;
}
