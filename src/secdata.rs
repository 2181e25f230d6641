// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Antirollback spaces.
//!
//! The firmware and kernel rollback data live in TPM NV spaces. They are read
//! once at startup; if the firmware space doesn't exist yet, this is the
//! first boot after manufacture and we create the spaces ourselves.

use crc::{Crc, CRC_8_SMBUS};
use hex_literal::hex;
use log::{error, info, warn};
use thiserror::Error;

use crate::context::PersistentData;
use crate::nvdata::{NvAttributes, RegionKind, RegionStore, SpaceSpec, StoreError};

pub const SECDATA_FIRMWARE_SIZE: usize = 10;
pub const SECDATA_KERNEL_SIZE: usize = 13;
pub const REC_HASH_SIZE: usize = 32;
pub const FWMP_SIZE: usize = 40;

const SECDATA_FIRMWARE_VERSION: u8 = 2;

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

/// Kernel rollback data for a freshly provisioned part: version 2, the
/// "GRWL" uid, zero kernel versions, CRC-8 trailer.
pub const SECDATA_KERNEL_DEFAULT: [u8; SECDATA_KERNEL_SIZE] =
    hex!("02 4c575247 00000000 000000 e8");

/// Attributes for spaces only firmware may write, locked until the next
/// TPM reset.
pub const RO_SPACE_ATTRIBUTES: NvAttributes = NvAttributes::PPWRITE
    .union(NvAttributes::AUTHREAD)
    .union(NvAttributes::PPREAD)
    .union(NvAttributes::PLATFORMCREATE)
    .union(NvAttributes::WRITE_STCLEAR)
    .union(NvAttributes::POLICY_DELETE);

/// Attributes for spaces the OS may update through firmware.
pub const RW_SPACE_ATTRIBUTES: NvAttributes = NvAttributes::PPWRITE
    .union(NvAttributes::AUTHREAD)
    .union(NvAttributes::PPREAD)
    .union(NvAttributes::PLATFORMCREATE);

/// Policy allowing the RO spaces to be deleted only while PCR0 still holds
/// one of its boot-mode values, i.e. before anything but firmware ran.
pub const PCR0_UNCHANGED_POLICY: [u8; 32] =
    hex!("09933cce ebb44111 18811dd4 47788008 8886622d d7799446 6226688e eee66aa1");

#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum SecdataError {
    #[error("factory initialisation failed: {0}")]
    FactoryInit(StoreError),
    #[error("no device holds the rollback spaces")]
    NoDevice,
}

/// CRC-8 as used for the rollback spaces.
pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

/// Firmware rollback data for a freshly provisioned part.
pub fn fresh_firmware_secdata() -> [u8; SECDATA_FIRMWARE_SIZE] {
    let mut data = [0; SECDATA_FIRMWARE_SIZE];
    data[0] = SECDATA_FIRMWARE_VERSION;
    data[SECDATA_FIRMWARE_SIZE - 1] = crc8(&data[..SECDATA_FIRMWARE_SIZE - 1]);
    data
}

fn set_space(
    store: &mut RegionStore<'_>,
    kind: RegionKind,
    attributes: NvAttributes,
    policy: &[u8],
    data: &[u8],
) -> Result<(), StoreError> {
    info!("secdata: setting up {:?}", kind);
    let size = u16::try_from(data.len()).map_err(|_| StoreError::BadSize(kind))?;
    store.define(
        kind,
        &SpaceSpec {
            attributes,
            size,
            policy,
        },
    )?;
    store.write(kind, data)
}

/// Creates and fills the rollback spaces.
///
/// The firmware space goes last: its presence is what tells later boots
/// that this has been done, so if we're interrupted part way the next boot
/// starts over.
pub fn factory_init(store: &mut RegionStore<'_>, has_rec_hash: bool) -> Result<(), StoreError> {
    set_space(
        store,
        RegionKind::SecureKernel,
        RW_SPACE_ATTRIBUTES,
        &[],
        &SECDATA_KERNEL_DEFAULT,
    )?;
    if has_rec_hash {
        set_space(
            store,
            RegionKind::RecoveryHash,
            RO_SPACE_ATTRIBUTES,
            &PCR0_UNCHANGED_POLICY,
            &[0; REC_HASH_SIZE],
        )?;
    }
    set_space(
        store,
        RegionKind::SecureFirmware,
        RO_SPACE_ATTRIBUTES,
        &PCR0_UNCHANGED_POLICY,
        &fresh_firmware_secdata(),
    )
}

/// Reads the rollback spaces into `data`, provisioning them first if this
/// is a factory-fresh part.
///
/// Read failures other than a missing firmware space leave the buffer zeroed;
/// the verification library will notice the bad CRC and ask for recovery.
pub fn load(
    store: &mut RegionStore<'_>,
    data: &mut PersistentData,
    has_rec_hash: bool,
) -> Result<(), SecdataError> {
    let mut firmware = [0; SECDATA_FIRMWARE_SIZE];
    match store.read(RegionKind::SecureFirmware, &mut firmware) {
        Ok(()) => {}
        Err(StoreError::NotFound(_)) => {
            info!("secdata: firmware space missing, doing factory init");
            factory_init(store, has_rec_hash).map_err(|e| {
                error!("secdata: factory init failed: {}", e);
                SecdataError::FactoryInit(e)
            })?;
            firmware = fresh_firmware_secdata();
        }
        Err(StoreError::NoDevice(_)) => return Err(SecdataError::NoDevice),
        Err(e) => {
            warn!("secdata: can't read firmware space: {}", e);
            firmware = [0; SECDATA_FIRMWARE_SIZE];
        }
    }

    let mut kernel = [0; SECDATA_KERNEL_SIZE];
    if let Err(e) = store.read(RegionKind::SecureKernel, &mut kernel) {
        warn!("secdata: can't read kernel space: {}", e);
        kernel = [0; SECDATA_KERNEL_SIZE];
    }

    for (kind, src) in [
        (RegionKind::SecureFirmware, &firmware[..]),
        (RegionKind::SecureKernel, &kernel[..]),
    ] {
        if let Some(buf) = data.load_buf(kind) {
            buf.copy_from_slice(src);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvdata::LockState;
    use crate::sim::SimTpm;

    #[test]
    fn default_kernel_secdata_crc() {
        let data = SECDATA_KERNEL_DEFAULT;
        assert_eq!(crc8(&data[..SECDATA_KERNEL_SIZE - 1]), data[SECDATA_KERNEL_SIZE - 1]);
        assert_eq!(&data[1..5], b"LWRG");
    }

    #[test]
    fn fresh_firmware_secdata_contents() {
        let data = fresh_firmware_secdata();
        assert_eq!(data, [2, 0, 0, 0, 0, 0, 0, 0, 0, 0xf2]);
    }

    #[test]
    fn missing_spaces_are_provisioned() {
        let tpm = SimTpm::new();
        let mut store = RegionStore::new();
        store.attach(&tpm).unwrap();
        let mut data = PersistentData::default();

        load(&mut store, &mut data, true).unwrap();

        let nv = tpm.nv();
        assert_eq!(
            nv.contents(RegionKind::SecureFirmware).unwrap().as_slice(),
            &fresh_firmware_secdata()
        );
        assert_eq!(
            nv.contents(RegionKind::SecureKernel).unwrap().as_slice(),
            &SECDATA_KERNEL_DEFAULT
        );
        assert_eq!(
            nv.contents(RegionKind::RecoveryHash).unwrap().as_slice(),
            &[0; REC_HASH_SIZE]
        );
        assert_eq!(data.get(RegionKind::SecureFirmware).unwrap(), &fresh_firmware_secdata());
        assert_eq!(data.get(RegionKind::SecureKernel).unwrap(), &SECDATA_KERNEL_DEFAULT);
        // Loading doesn't make anything dirty.
        assert!(!data.is_dirty(RegionKind::SecureFirmware));
        assert_eq!(store.lock_state(RegionKind::SecureKernel), LockState::Unlocked);
    }

    #[test]
    fn firmware_space_is_created_last() {
        let tpm = SimTpm::new();
        tpm.nv().fail_write(RegionKind::RecoveryHash);
        let mut store = RegionStore::new();
        store.attach(&tpm).unwrap();
        let mut data = PersistentData::default();

        assert_eq!(
            load(&mut store, &mut data, true),
            Err(SecdataError::FactoryInit(StoreError::HardwareFault(
                RegionKind::RecoveryHash
            )))
        );
        // The kernel space got done, but without the firmware space the next
        // boot will try again.
        assert!(tpm.nv().contents(RegionKind::SecureKernel).is_some());
        assert!(tpm.nv().contents(RegionKind::SecureFirmware).is_none());
    }

    #[test]
    fn existing_spaces_are_read() {
        let tpm = SimTpm::new();
        let firmware = [2, 1, 3, 0, 0, 0, 0, 0, 0, 0];
        tpm.nv().preload(RegionKind::SecureFirmware, &firmware);
        tpm.nv().preload(RegionKind::SecureKernel, &SECDATA_KERNEL_DEFAULT);
        let mut store = RegionStore::new();
        store.attach(&tpm).unwrap();
        let mut data = PersistentData::default();

        load(&mut store, &mut data, false).unwrap();
        assert_eq!(data.get(RegionKind::SecureFirmware).unwrap(), &firmware);
        assert_eq!(tpm.nv().write_calls(RegionKind::SecureFirmware), 0);
    }

    #[test]
    fn unreadable_kernel_space_is_zeroed() {
        let tpm = SimTpm::new();
        tpm.nv().preload(RegionKind::SecureFirmware, &fresh_firmware_secdata());
        tpm.nv().preload(RegionKind::SecureKernel, &SECDATA_KERNEL_DEFAULT);
        tpm.nv().fail_read(RegionKind::SecureKernel);
        let mut store = RegionStore::new();
        store.attach(&tpm).unwrap();
        let mut data = PersistentData::default();

        load(&mut store, &mut data, false).unwrap();
        assert_eq!(data.get(RegionKind::SecureKernel).unwrap(), &[0; SECDATA_KERNEL_SIZE]);
    }
}
