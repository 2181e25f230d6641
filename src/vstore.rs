// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resume-path firmware hash.
//!
//! On boards where S3 resume runs memory init from RW firmware, resume must
//! go through exactly the firmware that was verified at boot. We keep the
//! verified body digest in a verified-store slot (normally on the EC): saved
//! and locked on a cold boot, compared on resume.

use log::{error, info, warn};
use thiserror::Error;

use crate::nvdata::{RegionKind, RegionStore, StoreError};
use crate::tpm::{Digest, MAX_DIGEST_LEN};

/// Size of a verified-store slot. Shorter digests are zero-padded.
pub const VSTORE_SLOT_SIZE: usize = MAX_DIGEST_LEN;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum VstoreError {
    #[error("can't read saved firmware hash: {0}")]
    Read(StoreError),
    #[error("firmware hash differs from the one saved at boot")]
    Mismatch,
    #[error("saved firmware hash is locked: {0}")]
    Locked(StoreError),
}

fn slot_contents(digest: &Digest) -> [u8; VSTORE_SLOT_SIZE] {
    let mut slot = [0; VSTORE_SLOT_SIZE];
    let bytes = digest.as_bytes();
    slot[..bytes.len()].copy_from_slice(bytes);
    slot
}

/// Checks `digest` against the saved one when resuming, or saves it when
/// booting.
///
/// Failing to save is logged and otherwise ignored, since refusing to boot
/// would just loop; the worst outcome is a failed resume later. A slot that
/// is already locked this boot is a different matter, as it means something
/// else got there first.
pub fn handle_body_digest(
    store: &mut RegionStore<'_>,
    digest: &Digest,
    resume: bool,
) -> Result<(), VstoreError> {
    let expected = slot_contents(digest);

    if resume {
        let mut saved = [0; VSTORE_SLOT_SIZE];
        store.read(RegionKind::VerifiedStoreSlot, &mut saved).map_err(|e| {
            error!("vstore: couldn't retrieve saved hash: {}", e);
            VstoreError::Read(e)
        })?;
        if saved != expected {
            error!("vstore: hash mismatch on resume");
            return Err(VstoreError::Mismatch);
        }
        info!("vstore: resume hash matches");
        return Ok(());
    }

    match store.write(RegionKind::VerifiedStoreSlot, &expected) {
        Ok(()) => {}
        Err(e @ StoreError::RegionLocked(_)) => {
            error!("vstore: {}", e);
            return Err(VstoreError::Locked(e));
        }
        Err(e) => {
            warn!("vstore: error saving hash: {}", e);
            return Ok(());
        }
    }
    match store.lock(RegionKind::VerifiedStoreSlot) {
        Ok(lock) => info!("vstore: hash saved, {:?} locked", lock.kind()),
        Err(e) => warn!("vstore: {}", e),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvdata::{LockState, RegionSet};
    use crate::sim::SimNvram;

    fn ec() -> SimNvram {
        let nv = SimNvram::new(RegionSet::of(&[RegionKind::VerifiedStoreSlot]));
        nv.preload(RegionKind::VerifiedStoreSlot, &[0; VSTORE_SLOT_SIZE]);
        nv
    }

    #[test]
    fn boot_saves_and_locks() {
        let nv = ec();
        let mut store = RegionStore::new();
        store.attach(&nv).unwrap();

        let digest = Digest::sha256([0x5a; 32]);
        handle_body_digest(&mut store, &digest, false).unwrap();

        let saved = nv.contents(RegionKind::VerifiedStoreSlot).unwrap();
        assert_eq!(&saved[..32], &[0x5a; 32]);
        assert_eq!(&saved[32..], &[0; 32]);
        assert_eq!(store.lock_state(RegionKind::VerifiedStoreSlot), LockState::Locked);
    }

    #[test]
    fn resume_compares() {
        let nv = ec();
        let digest = Digest::sha256([0x5a; 32]);
        nv.preload(RegionKind::VerifiedStoreSlot, &slot_contents(&digest));
        let mut store = RegionStore::new();
        store.attach(&nv).unwrap();

        handle_body_digest(&mut store, &digest, true).unwrap();
        assert_eq!(
            handle_body_digest(&mut store, &Digest::sha256([0xa5; 32]), true),
            Err(VstoreError::Mismatch)
        );
        // Resume never rewrites the slot.
        assert_eq!(nv.write_calls(RegionKind::VerifiedStoreSlot), 0);
    }

    #[test]
    fn resume_read_failure_is_fatal() {
        let nv = ec();
        nv.fail_read(RegionKind::VerifiedStoreSlot);
        let mut store = RegionStore::new();
        store.attach(&nv).unwrap();

        assert_eq!(
            handle_body_digest(&mut store, &Digest::sha256([0; 32]), true),
            Err(VstoreError::Read(StoreError::HardwareFault(
                RegionKind::VerifiedStoreSlot
            )))
        );
    }

    #[test]
    fn save_fault_is_not_fatal() {
        let nv = ec();
        nv.fail_write(RegionKind::VerifiedStoreSlot);
        let mut store = RegionStore::new();
        store.attach(&nv).unwrap();

        handle_body_digest(&mut store, &Digest::sha256([1; 32]), false).unwrap();
        assert_eq!(nv.lock_calls(RegionKind::VerifiedStoreSlot), 0);
    }

    #[test]
    fn locked_slot_is_fatal() {
        let nv = ec();
        let mut store = RegionStore::new();
        store.attach(&nv).unwrap();
        let _lock = store.lock(RegionKind::VerifiedStoreSlot).unwrap();

        assert_eq!(
            handle_body_digest(&mut store, &Digest::sha256([1; 32]), false),
            Err(VstoreError::Locked(StoreError::RegionLocked(
                RegionKind::VerifiedStoreSlot
            )))
        );
    }
}
