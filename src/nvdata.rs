// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Secure region store.
//!
//! Non-volatile boot data lives in a handful of regions, each of which may be
//! backed by a different device (TPM NV spaces, CMOS, the EC's verified-store
//! slots, ...). The store below keeps non-owning handles to those devices and
//! routes each request to the first device that claims the region kind and
//! succeeds, the same way the device model walks its drivers.
//!
//! Regions have a lock bit that only a cold reset clears. We model a taken
//! lock as a [`RegionLock`] token, and there is deliberately no operation
//! anywhere in this crate that gives one back.

use bitflags::bitflags;
use heapless::Vec;
use log::{debug, info, warn};
use num_derive::FromPrimitive;
use thiserror::Error;

/// Maximum number of storage devices a store can route between.
pub const MAX_NVDATA_DEVICES: usize = 4;

/// The kinds of NV region.
///
/// The numeric values are shared with existing firmware images and device
/// trees; they must not change.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum RegionKind {
    /// Generic NVDATA, e.g. try-counters and recovery requests. Can be lost.
    Standard = 0,
    /// Firmware rollback data.
    SecureFirmware = 1,
    /// Kernel rollback data.
    SecureKernel = 2,
    /// Hash of recovery-mode memory training data.
    RecoveryHash = 3,
    /// Hash of normal-mode memory training data.
    NormalHash = 4,
    /// Firmware management parameters.
    FirmwareMgmtParams = 5,
    /// Verified-store slot, used for the resume-path firmware hash.
    VerifiedStoreSlot = 6,
}

impl RegionKind {
    pub const ALL: [RegionKind; 7] = [
        RegionKind::Standard,
        RegionKind::SecureFirmware,
        RegionKind::SecureKernel,
        RegionKind::RecoveryHash,
        RegionKind::NormalHash,
        RegionKind::FirmwareMgmtParams,
        RegionKind::VerifiedStoreSlot,
    ];

    fn bit(self) -> u8 {
        1 << self as u8
    }
}

/// A small set of region kinds.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RegionSet(u8);

impl RegionSet {
    pub const EMPTY: Self = Self(0);

    pub const fn all() -> Self {
        Self((1 << RegionKind::ALL.len()) - 1)
    }

    pub fn of(kinds: &[RegionKind]) -> Self {
        let mut set = Self::EMPTY;
        for &k in kinds {
            set.insert(k);
        }
        set
    }

    pub fn contains(&self, kind: RegionKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn insert(&mut self, kind: RegionKind) {
        self.0 |= kind.bit();
    }

    pub fn remove(&mut self, kind: RegionKind) {
        self.0 &= !kind.bit();
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

bitflags! {
    /// NV space attributes used when defining a region. Bit positions match
    /// the TPM 2.0 `TPMA_NV` layout.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct NvAttributes: u32 {
        const PPWRITE = 1 << 0;
        const OWNERWRITE = 1 << 1;
        const AUTHWRITE = 1 << 2;
        const POLICYWRITE = 1 << 3;
        const POLICY_DELETE = 1 << 10;
        const WRITELOCKED = 1 << 11;
        const WRITEALL = 1 << 12;
        const WRITEDEFINE = 1 << 13;
        const WRITE_STCLEAR = 1 << 14;
        const GLOBALLOCK = 1 << 15;
        const PPREAD = 1 << 16;
        const OWNERREAD = 1 << 17;
        const AUTHREAD = 1 << 18;
        const POLICYREAD = 1 << 19;
        const NO_DA = 1 << 25;
        const ORDERLY = 1 << 26;
        const CLEAR_STCLEAR = 1 << 27;
        const READLOCKED = 1 << 28;
        const WRITTEN = 1 << 29;
        const PLATFORMCREATE = 1 << 30;
        const READ_STCLEAR = 1 << 31;
    }
}

/// Describes a region to be created on a device.
#[derive(Copy, Clone, Debug)]
pub struct SpaceSpec<'a> {
    pub attributes: NvAttributes,
    pub size: u16,
    /// Authorisation policy digest; empty for none.
    pub policy: &'a [u8],
}

/// Errors reported by an individual storage device.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum NvError {
    #[error("region has not been defined")]
    NotFound,
    #[error("region is write-locked")]
    Locked,
    #[error("region kind not supported by device")]
    Unsupported,
    #[error("buffer size does not match region")]
    BadSize,
    #[error("device fault")]
    Fault,
}

/// Errors from reading, writing or defining a region through the store.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum StoreError {
    #[error("write to locked region {0:?}")]
    RegionLocked(RegionKind),
    #[error("region {0:?} has not been defined")]
    NotFound(RegionKind),
    #[error("no device holds region {0:?}")]
    NoDevice(RegionKind),
    #[error("size mismatch for region {0:?}")]
    BadSize(RegionKind),
    #[error("hardware fault on region {0:?}")]
    HardwareFault(RegionKind),
    #[error("too many storage devices")]
    TooManyDevices,
}

/// Errors from locking a region.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum LockError {
    #[error("hardware fault locking region {0:?}")]
    HardwareFault(RegionKind),
    #[error("no device can lock region {0:?}")]
    NoDevice(RegionKind),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockState {
    Unlocked,
    Locked,
}

/// Operations provided by a device that can hold NV regions.
///
/// Methods take `&self`: device handles are shared (the TPM is both a PCR
/// bank and a region store), so implementations keep their mutable state
/// behind cells.
pub trait RegionStorage {
    /// Returns `true` if this device is configured to hold `kind`.
    fn supports(&self, kind: RegionKind) -> bool;

    /// Reads the whole region into `buf`, whose length must match the region.
    fn read(&self, kind: RegionKind, buf: &mut [u8]) -> Result<(), NvError>;

    fn write(&self, kind: RegionKind, data: &[u8]) -> Result<(), NvError>;

    /// Creates the region. Creating a region that already exists succeeds.
    fn define(&self, kind: RegionKind, space: &SpaceSpec<'_>) -> Result<(), NvError>;

    /// Sets the region's write lock until the next cold reset. Locking an
    /// already-locked region must succeed.
    fn lock(&self, kind: RegionKind) -> Result<(), NvError>;
}

/// Proof that a region has been write-locked during this boot attempt.
///
/// There is no way to construct one outside of [`RegionStore::lock`] and no
/// way to turn one back into an unlocked region.
#[derive(Debug, Eq, PartialEq)]
#[must_use]
pub struct RegionLock {
    kind: RegionKind,
}

impl RegionLock {
    pub fn kind(&self) -> RegionKind {
        self.kind
    }
}

/// Routes region operations to the attached storage devices.
pub struct RegionStore<'d> {
    devices: Vec<&'d dyn RegionStorage, MAX_NVDATA_DEVICES>,
    locked: RegionSet,
}

impl<'d> Default for RegionStore<'d> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'d> RegionStore<'d> {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            locked: RegionSet::EMPTY,
        }
    }

    /// Adds a device. Devices are consulted in the order they were attached.
    pub fn attach(&mut self, dev: &'d dyn RegionStorage) -> Result<(), StoreError> {
        self.devices
            .push(dev)
            .map_err(|_| StoreError::TooManyDevices)
    }

    pub fn lock_state(&self, kind: RegionKind) -> LockState {
        if self.locked.contains(kind) {
            LockState::Locked
        } else {
            LockState::Unlocked
        }
    }

    pub fn read(&self, kind: RegionKind, buf: &mut [u8]) -> Result<(), StoreError> {
        let r = self.walk(kind, |dev| dev.read(kind, buf));
        r.map_err(|e| store_error(kind, e))
    }

    pub fn write(&mut self, kind: RegionKind, data: &[u8]) -> Result<(), StoreError> {
        if self.locked.contains(kind) {
            // Never let this look like it worked.
            warn!("refusing write to locked region {:?}", kind);
            return Err(StoreError::RegionLocked(kind));
        }
        info!("write region {:?} size {:#x}", kind, data.len());
        match self.walk(kind, |dev| dev.write(kind, data)) {
            Ok(()) => Ok(()),
            Err(NvError::Locked) => {
                // The hardware knows better than we do.
                self.locked.insert(kind);
                Err(StoreError::RegionLocked(kind))
            }
            Err(e) => {
                warn!("failed to write region {:?}: {}", kind, e);
                Err(store_error(kind, e))
            }
        }
    }

    pub fn define(&mut self, kind: RegionKind, space: &SpaceSpec<'_>) -> Result<(), StoreError> {
        if self.locked.contains(kind) {
            return Err(StoreError::RegionLocked(kind));
        }
        self.walk(kind, |dev| dev.define(kind, space))
            .map_err(|e| store_error(kind, e))
    }

    /// Locks `kind` until the next cold reset.
    ///
    /// Locking a region that is already locked succeeds; the request is still
    /// passed down to the hardware, but a complaint from it is only logged.
    pub fn lock(&mut self, kind: RegionKind) -> Result<RegionLock, LockError> {
        let already = self.locked.contains(kind);
        if already {
            debug!("region {:?} already locked", kind);
        }
        match self.walk(kind, |dev| dev.lock(kind)) {
            Ok(()) => {
                self.locked.insert(kind);
                Ok(RegionLock { kind })
            }
            Err(e) if already => {
                warn!("re-locking region {:?}: {}", kind, e);
                Ok(RegionLock { kind })
            }
            Err(NvError::Unsupported) => Err(LockError::NoDevice(kind)),
            Err(e) => {
                warn!("failed to lock region {:?}: {}", kind, e);
                Err(LockError::HardwareFault(kind))
            }
        }
    }

    /// Tries each device that claims `kind` until one succeeds, returning the
    /// last error if none did.
    fn walk(
        &self,
        kind: RegionKind,
        mut op: impl FnMut(&dyn RegionStorage) -> Result<(), NvError>,
    ) -> Result<(), NvError> {
        let mut result = Err(NvError::Unsupported);
        for dev in self.devices.iter().filter(|d| d.supports(kind)) {
            result = op(*dev);
            if result.is_ok() {
                break;
            }
        }
        result
    }
}

fn store_error(kind: RegionKind, e: NvError) -> StoreError {
    match e {
        NvError::NotFound => StoreError::NotFound(kind),
        NvError::Locked => StoreError::RegionLocked(kind),
        NvError::Unsupported => StoreError::NoDevice(kind),
        NvError::BadSize => StoreError::BadSize(kind),
        NvError::Fault => StoreError::HardwareFault(kind),
    }
}
