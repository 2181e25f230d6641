// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A stand-in for the verified-boot library.
//!
//! Each firmware region in the sandbox image is laid out as
//!
//! | offset      | contents                            |
//! |-------------|-------------------------------------|
//! | 0           | firmware version, u32 little-endian |
//! | 4           | body                                |
//! | size - 32   | SHA-256 of everything before it     |
//!
//! Checking the trailer is all the signature checking there is. Slot choice,
//! rollback and failure bookkeeping behave enough like the real thing to
//! drive every path through the sequencer.

use log::{info, warn};
use vboot_stage::context::{PersistentData, Switches};
use vboot_stage::nvdata::RegionKind;
use vboot_stage::secdata::{crc8, SECDATA_FIRMWARE_SIZE};
use vboot_stage::sim::sha256;
use vboot_stage::tpm::{Digest, Measurement};
use vboot_stage::transfer::FwStore;
use vboot_stage::verify::{GbbFlags, Selection, VerifiedSlot, Verifier, VerifyError};
use vboot_stage::{FirmwareType, SlotDescriptor, SlotLabel};

pub const VERSION_LEN: usize = 4;
pub const TRAILER_LEN: usize = 32;

// NVDATA bytes owned by this library.
const NV_TRY_B: usize = 0;
const NV_RECOVERY_REQUEST: usize = 1;
const NV_FAILED: usize = 2;

const FAILED_A: u8 = 1 << 0;
const FAILED_B: u8 = 1 << 1;

// Secure firmware data: struct version, flags, u32 versions, ..., CRC-8.
const SECDATA_VERSIONS: core::ops::Range<usize> = 2..6;

pub const RECOVERY_MANUAL: u8 = 0x02;
pub const RECOVERY_INVALID_RW: u8 = 0x03;
pub const RECOVERY_SECDATA: u8 = 0x2b;

const ERR_BAD_TRAILER: u32 = 0x1001;
const ERR_ROLLBACK: u32 = 0x1002;
const ERR_SECDATA_CRC: u32 = 0x1003;
const ERR_READ: u32 = 0x1004;
const ERR_TOO_SHORT: u32 = 0x1005;
const ERR_NOT_SELECTED: u32 = 0x1006;

/// PCRs we extend.
pub const PCR_BOOT_MODE: u8 = 0;
pub const PCR_HWID: u8 = 1;

/// Writes the trailer for a region laid out as above.
pub fn seal(region: &mut [u8]) {
    let split = region.len() - TRAILER_LEN;
    let digest = sha256(&region[..split]);
    region[split..].copy_from_slice(&digest);
}

pub struct TrailerVerifier {
    hwid: &'static str,
    gbb_flags: GbbFlags,
    selected: Option<FirmwareType>,
}

impl TrailerVerifier {
    pub fn new(hwid: &'static str, gbb_flags: GbbFlags) -> Self {
        Self {
            hwid,
            gbb_flags,
            selected: None,
        }
    }

    fn request_recovery(data: &mut PersistentData, reason: u8) {
        if let Some(nv) = data.get_mut(RegionKind::Standard) {
            nv[NV_RECOVERY_REQUEST] = reason;
        }
    }

    /// Records that `label` failed; the next attempt tries the other slot,
    /// or recovery once both have failed.
    fn record_failure(data: &mut PersistentData, label: SlotLabel) {
        let Some(nv) = data.get_mut(RegionKind::Standard) else {
            return;
        };
        match label {
            SlotLabel::RwA => {
                nv[NV_FAILED] |= FAILED_A;
                nv[NV_TRY_B] = 1;
            }
            SlotLabel::RwB => {
                nv[NV_FAILED] |= FAILED_B;
                nv[NV_TRY_B] = 0;
            }
            SlotLabel::RoRecovery | SlotLabel::NextStage => return,
        }
        if nv[NV_FAILED] & (FAILED_A | FAILED_B) == FAILED_A | FAILED_B {
            nv[NV_RECOVERY_REQUEST] = RECOVERY_INVALID_RW;
        }
    }

    fn boot_mode_digest(firmware_type: FirmwareType) -> Digest {
        let mode = [
            u8::from(firmware_type == FirmwareType::Developer),
            u8::from(firmware_type.is_recovery()),
            1,
        ];
        Digest::sha256(sha256(&mode))
    }
}

/// Stores `version` in secure firmware data and fixes up its CRC.
pub fn set_rollback_version(secdata: &mut [u8], version: u32) {
    secdata[SECDATA_VERSIONS].copy_from_slice(&version.to_le_bytes());
    let last = secdata.len() - 1;
    secdata[last] = crc8(&secdata[..last]);
}

fn secdata_versions(secdata: &[u8]) -> Option<u32> {
    let bytes = secdata.get(SECDATA_VERSIONS)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

impl Verifier for TrailerVerifier {
    fn select_firmware(
        &mut self,
        data: &mut PersistentData,
        switches: &Switches,
    ) -> Result<Selection, VerifyError> {
        let secdata = data.get(RegionKind::SecureFirmware).unwrap_or(&[]);
        if secdata.len() != SECDATA_FIRMWARE_SIZE
            || secdata[0] == 0
            || crc8(&secdata[..SECDATA_FIRMWARE_SIZE - 1]) != secdata[SECDATA_FIRMWARE_SIZE - 1]
        {
            warn!("library: secure firmware data is corrupt");
            Self::request_recovery(data, RECOVERY_SECDATA);
            return Err(VerifyError(ERR_SECDATA_CRC));
        }

        let nv = data.get(RegionKind::Standard).unwrap_or(&[]);
        let requested = nv.get(NV_RECOVERY_REQUEST).copied().unwrap_or(0);
        let try_b = nv.get(NV_TRY_B).copied().unwrap_or(0) != 0;

        let recovery_reason = if switches.force_recovery {
            RECOVERY_MANUAL
        } else {
            requested
        };
        if recovery_reason != 0 {
            // A request is honoured once.
            if requested != 0 {
                Self::request_recovery(data, 0);
            }
            info!("library: recovery requested ({:#x})", recovery_reason);
            self.selected = Some(FirmwareType::Recovery);
            return Ok(Selection {
                firmware_type: FirmwareType::Recovery,
                slot: SlotLabel::RoRecovery,
                gbb_flags: self.gbb_flags,
                recovery_reason,
            });
        }

        let developer =
            switches.developer || self.gbb_flags.contains(GbbFlags::FORCE_DEV_SWITCH_ON);
        let firmware_type = if developer {
            FirmwareType::Developer
        } else {
            FirmwareType::Normal
        };
        self.selected = Some(firmware_type);
        Ok(Selection {
            firmware_type,
            slot: if try_b { SlotLabel::RwB } else { SlotLabel::RwA },
            gbb_flags: self.gbb_flags,
            recovery_reason: 0,
        })
    }

    fn verify_slot(
        &mut self,
        data: &mut PersistentData,
        candidate: &SlotDescriptor,
        fwstore: &dyn FwStore,
    ) -> Result<VerifiedSlot, VerifyError> {
        let size = candidate.size() as usize;
        if size < VERSION_LEN + TRAILER_LEN {
            return Err(VerifyError(ERR_TOO_SHORT));
        }
        let mut region = vec![0; size];
        fwstore
            .read(candidate.offset(), &mut region)
            .map_err(|_| VerifyError(ERR_READ))?;

        let split = size - TRAILER_LEN;
        let body_digest = sha256(&region[..split]);
        if body_digest[..] != region[split..] {
            warn!("library: {} trailer mismatch", candidate.label().name());
            Self::record_failure(data, candidate.label());
            return Err(VerifyError(ERR_BAD_TRAILER));
        }

        let fw_version = u32::from_le_bytes([region[0], region[1], region[2], region[3]]);
        let recovery = candidate.label() == SlotLabel::RoRecovery;
        if !recovery && !self.gbb_flags.contains(GbbFlags::DISABLE_FW_ROLLBACK_CHECK) {
            let stored = data
                .get(RegionKind::SecureFirmware)
                .and_then(secdata_versions)
                .unwrap_or(0);
            if fw_version < stored {
                warn!(
                    "library: {} version {:#x} is older than {:#x}",
                    candidate.label().name(),
                    fw_version,
                    stored
                );
                Self::record_failure(data, candidate.label());
                return Err(VerifyError(ERR_ROLLBACK));
            }
            if fw_version > stored {
                if let Some(secdata) = data.get_mut(RegionKind::SecureFirmware) {
                    set_rollback_version(secdata, fw_version);
                }
                info!("library: rollback version now {:#x}", fw_version);
            }
        }

        // This slot is good again.
        if let Some(nv) = data.get_mut(RegionKind::Standard) {
            match candidate.label() {
                SlotLabel::RwA => nv[NV_FAILED] &= !FAILED_A,
                SlotLabel::RwB => nv[NV_FAILED] &= !FAILED_B,
                SlotLabel::RoRecovery | SlotLabel::NextStage => {}
            }
        }

        let firmware_type = self.selected.ok_or(VerifyError(ERR_NOT_SELECTED))?;
        let measurements = heapless::Vec::from_slice(&[
            Measurement {
                pcr: PCR_BOOT_MODE,
                digest: Self::boot_mode_digest(firmware_type),
            },
            Measurement {
                pcr: PCR_HWID,
                digest: Digest::sha256(sha256(self.hwid.as_bytes())),
            },
        ])
        .map_err(|_| VerifyError(ERR_NOT_SELECTED))?;

        info!(
            "library: {} verified, version {:#x}",
            candidate.label().name(),
            fw_version
        );
        Ok(VerifiedSlot {
            slot: *candidate,
            measurements,
            body_digest: Some(Digest::sha256(body_digest)),
            fw_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vboot_stage::secdata::fresh_firmware_secdata;
    use vboot_stage::sim::MemFlash;

    const SIZE: u32 = 0x100;

    fn region(version: u32) -> Vec<u8> {
        let mut r = vec![0x5a; SIZE as usize];
        r[..VERSION_LEN].copy_from_slice(&version.to_le_bytes());
        seal(&mut r);
        r
    }

    fn data() -> PersistentData {
        let mut data = PersistentData::default();
        data.get_mut(RegionKind::SecureFirmware)
            .unwrap()
            .copy_from_slice(&fresh_firmware_secdata());
        data
    }

    fn rw_a() -> SlotDescriptor {
        SlotDescriptor::new(SlotLabel::RwA, 0, SIZE)
    }

    #[test]
    fn good_slot_verifies_and_bumps_rollback() {
        let image = region(3);
        let flash = MemFlash::new(&image);
        let mut lib = TrailerVerifier::new("SANDBOX", GbbFlags::empty());
        let mut data = data();

        let sel = lib.select_firmware(&mut data, &Switches::default()).unwrap();
        assert_eq!(sel.slot, SlotLabel::RwA);
        let verified = lib.verify_slot(&mut data, &rw_a(), &flash).unwrap();
        assert_eq!(verified.fw_version, 3);
        assert_eq!(verified.measurements.len(), 2);
        assert_eq!(
            verified.body_digest.unwrap().as_bytes(),
            &image[SIZE as usize - TRAILER_LEN..]
        );
        let secdata = data.get(RegionKind::SecureFirmware).unwrap();
        assert_eq!(secdata_versions(secdata), Some(3));
        assert_eq!(crc8(&secdata[..SECDATA_FIRMWARE_SIZE - 1]), secdata[SECDATA_FIRMWARE_SIZE - 1]);
    }

    #[test]
    fn bad_trailers_fall_back_then_recover() {
        let mut image = region(1);
        image[8] ^= 0xff;
        let flash = MemFlash::new(&image);
        let mut lib = TrailerVerifier::new("SANDBOX", GbbFlags::empty());
        let mut data = data();

        lib.select_firmware(&mut data, &Switches::default()).unwrap();
        assert_eq!(
            lib.verify_slot(&mut data, &rw_a(), &flash),
            Err(VerifyError(ERR_BAD_TRAILER))
        );
        let sel = lib.select_firmware(&mut data, &Switches::default()).unwrap();
        assert_eq!(sel.slot, SlotLabel::RwB);

        let rw_b = SlotDescriptor::new(SlotLabel::RwB, 0, SIZE);
        assert!(lib.verify_slot(&mut data, &rw_b, &flash).is_err());
        let sel = lib.select_firmware(&mut data, &Switches::default()).unwrap();
        assert_eq!(sel.firmware_type, FirmwareType::Recovery);
        assert_eq!(sel.recovery_reason, RECOVERY_INVALID_RW);

        // The request is used up.
        let sel = lib.select_firmware(&mut data, &Switches::default()).unwrap();
        assert_eq!(sel.firmware_type, FirmwareType::Normal);
    }

    #[test]
    fn rollback_is_refused() {
        let image = region(1);
        let flash = MemFlash::new(&image);
        let mut lib = TrailerVerifier::new("SANDBOX", GbbFlags::empty());
        let mut data = data();
        set_rollback_version(data.get_mut(RegionKind::SecureFirmware).unwrap(), 2);

        lib.select_firmware(&mut data, &Switches::default()).unwrap();
        assert_eq!(
            lib.verify_slot(&mut data, &rw_a(), &flash),
            Err(VerifyError(ERR_ROLLBACK))
        );
    }

    #[test]
    fn corrupt_secdata_requests_recovery() {
        let mut lib = TrailerVerifier::new("SANDBOX", GbbFlags::empty());
        let mut data = PersistentData::default();
        data.get_mut(RegionKind::SecureFirmware).unwrap()[0] = 2;

        assert_eq!(
            lib.select_firmware(&mut data, &Switches::default()),
            Err(VerifyError(ERR_SECDATA_CRC))
        );
        assert_eq!(
            data.get(RegionKind::Standard).unwrap()[NV_RECOVERY_REQUEST],
            RECOVERY_SECDATA
        );
    }
}
