// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Software stand-ins for the boot devices.
//!
//! These back the unit tests and the sandbox runner. They follow the same
//! rules as the hardware: locks only clear when the object is dropped (our
//! version of a cold reset), PCRs only move by chained hashing, and faults
//! can be injected per region so the failure paths can be driven.

use core::cell::{Cell, RefCell};

use heapless::Vec;
use sha2::{Digest as _, Sha256};

use crate::nvdata::{NvError, RegionKind, RegionSet, RegionStorage, SpaceSpec};
use crate::tpm::{Digest, HashAlg, PcrBank, StartupMode, TpmError, PCR_COUNT};
use crate::transfer::{FrozenHandoff, FwStore, FwStoreError, Launch, LoadedImage};
use crate::SlotDescriptor;

/// Largest region a [`SimNvram`] will hold.
pub const SIM_REGION_MAX: usize = 64;

const KINDS: usize = RegionKind::ALL.len();

#[derive(Default)]
struct SimRegion {
    data: Option<Vec<u8, SIM_REGION_MAX>>,
    locked: bool,
    lock_calls: u32,
    write_calls: u32,
}

/// Memory-backed NV regions, e.g. CMOS or an EC's verified-store slots.
pub struct SimNvram {
    supported: RegionSet,
    regions: RefCell<[SimRegion; KINDS]>,
    fail_lock: Cell<RegionSet>,
    fail_write: Cell<RegionSet>,
    fail_read: Cell<RegionSet>,
}

impl SimNvram {
    pub fn new(supported: RegionSet) -> Self {
        Self {
            supported,
            regions: RefCell::new(Default::default()),
            fail_lock: Cell::new(RegionSet::EMPTY),
            fail_write: Cell::new(RegionSet::EMPTY),
            fail_read: Cell::new(RegionSet::EMPTY),
        }
    }

    /// Defines `kind` with `contents`, as if it had been provisioned earlier.
    pub fn preload(&self, kind: RegionKind, contents: &[u8]) {
        let mut regions = self.regions.borrow_mut();
        regions[kind as usize].data = Vec::from_slice(contents).ok();
    }

    /// Current contents of `kind`, if defined.
    pub fn contents(&self, kind: RegionKind) -> Option<Vec<u8, SIM_REGION_MAX>> {
        self.regions.borrow()[kind as usize].data.clone()
    }

    pub fn is_locked(&self, kind: RegionKind) -> bool {
        self.regions.borrow()[kind as usize].locked
    }

    pub fn lock_calls(&self, kind: RegionKind) -> u32 {
        self.regions.borrow()[kind as usize].lock_calls
    }

    pub fn write_calls(&self, kind: RegionKind) -> u32 {
        self.regions.borrow()[kind as usize].write_calls
    }

    /// Total lock requests seen across all regions.
    pub fn total_lock_calls(&self) -> u32 {
        self.regions.borrow().iter().map(|r| r.lock_calls).sum()
    }

    pub fn fail_lock(&self, kind: RegionKind) {
        let mut s = self.fail_lock.get();
        s.insert(kind);
        self.fail_lock.set(s);
    }

    pub fn fail_write(&self, kind: RegionKind) {
        let mut s = self.fail_write.get();
        s.insert(kind);
        self.fail_write.set(s);
    }

    pub fn fail_read(&self, kind: RegionKind) {
        let mut s = self.fail_read.get();
        s.insert(kind);
        self.fail_read.set(s);
    }

    fn check(&self, kind: RegionKind) -> Result<(), NvError> {
        if self.supported.contains(kind) {
            Ok(())
        } else {
            Err(NvError::Unsupported)
        }
    }
}

impl RegionStorage for SimNvram {
    fn supports(&self, kind: RegionKind) -> bool {
        self.supported.contains(kind)
    }

    fn read(&self, kind: RegionKind, buf: &mut [u8]) -> Result<(), NvError> {
        self.check(kind)?;
        if self.fail_read.get().contains(kind) {
            return Err(NvError::Fault);
        }
        let regions = self.regions.borrow();
        let data = regions[kind as usize]
            .data
            .as_ref()
            .ok_or(NvError::NotFound)?;
        if data.len() != buf.len() {
            return Err(NvError::BadSize);
        }
        buf.copy_from_slice(data);
        Ok(())
    }

    fn write(&self, kind: RegionKind, data: &[u8]) -> Result<(), NvError> {
        self.check(kind)?;
        let mut regions = self.regions.borrow_mut();
        let region = &mut regions[kind as usize];
        region.write_calls += 1;
        if self.fail_write.get().contains(kind) {
            return Err(NvError::Fault);
        }
        if region.locked {
            return Err(NvError::Locked);
        }
        match &mut region.data {
            Some(existing) if existing.len() == data.len() => {
                existing.clear();
                existing
                    .extend_from_slice(data)
                    .map_err(|_| NvError::BadSize)?;
            }
            Some(_) => return Err(NvError::BadSize),
            // Spaces must be defined before they can be written.
            None => return Err(NvError::NotFound),
        }
        Ok(())
    }

    fn define(&self, kind: RegionKind, space: &SpaceSpec<'_>) -> Result<(), NvError> {
        self.check(kind)?;
        let size = usize::from(space.size);
        if size > SIM_REGION_MAX {
            return Err(NvError::BadSize);
        }
        let mut regions = self.regions.borrow_mut();
        let region = &mut regions[kind as usize];
        if region.data.is_none() {
            let mut v = Vec::new();
            v.resize(size, 0).map_err(|_| NvError::BadSize)?;
            region.data = Some(v);
        }
        Ok(())
    }

    fn lock(&self, kind: RegionKind) -> Result<(), NvError> {
        self.check(kind)?;
        let mut regions = self.regions.borrow_mut();
        let region = &mut regions[kind as usize];
        region.lock_calls += 1;
        if self.fail_lock.get().contains(kind) {
            return Err(NvError::Fault);
        }
        region.locked = true;
        Ok(())
    }
}

/// A software TPM: a SHA-256 PCR bank plus the TPM-held NV regions.
pub struct SimTpm {
    pcrs: RefCell<[[u8; 32]; PCR_COUNT as usize]>,
    started: Cell<bool>,
    startup_calls: Cell<u32>,
    fail_startup: Cell<bool>,
    fail_extend: Cell<bool>,
    extends: RefCell<Vec<(u8, [u8; 32]), 32>>,
    nv: SimNvram,
}

impl Default for SimTpm {
    fn default() -> Self {
        Self::new()
    }
}

impl SimTpm {
    /// Region kinds a TPM holds.
    pub fn tpm_regions() -> RegionSet {
        RegionSet::of(&[
            RegionKind::SecureFirmware,
            RegionKind::SecureKernel,
            RegionKind::RecoveryHash,
            RegionKind::NormalHash,
            RegionKind::FirmwareMgmtParams,
        ])
    }

    pub fn new() -> Self {
        Self {
            pcrs: RefCell::new([[0; 32]; PCR_COUNT as usize]),
            started: Cell::new(false),
            startup_calls: Cell::new(0),
            fail_startup: Cell::new(false),
            fail_extend: Cell::new(false),
            extends: RefCell::new(Vec::new()),
            nv: SimNvram::new(Self::tpm_regions()),
        }
    }

    /// The NV side of the TPM, for provisioning and inspection.
    pub fn nv(&self) -> &SimNvram {
        &self.nv
    }

    pub fn pcr(&self, index: u8) -> [u8; 32] {
        self.pcrs.borrow()[usize::from(index)]
    }

    pub fn startup_calls(&self) -> u32 {
        self.startup_calls.get()
    }

    /// Every extend the TPM accepted, in order.
    pub fn extend_log(&self) -> Vec<(u8, [u8; 32]), 32> {
        self.extends.borrow().clone()
    }

    pub fn fail_startup(&self) {
        self.fail_startup.set(true);
    }

    pub fn fail_extend(&self) {
        self.fail_extend.set(true);
    }
}

impl PcrBank for SimTpm {
    fn startup(&self, mode: StartupMode) -> Result<(), TpmError> {
        self.startup_calls.set(self.startup_calls.get() + 1);
        if self.fail_startup.get() {
            return Err(TpmError::Response(0x101));
        }
        if self.started.get() {
            return Err(TpmError::AlreadyStarted);
        }
        if mode == StartupMode::Clear {
            *self.pcrs.borrow_mut() = [[0; 32]; PCR_COUNT as usize];
        }
        self.started.set(true);
        Ok(())
    }

    fn extend(&self, pcr: u8, digest: &Digest) -> Result<(), TpmError> {
        if !self.started.get() {
            return Err(TpmError::Response(0x100));
        }
        if self.fail_extend.get() {
            return Err(TpmError::Response(0x101));
        }
        if digest.alg() != HashAlg::Sha256 {
            return Err(TpmError::UnsupportedAlg);
        }
        let mut pcrs = self.pcrs.borrow_mut();
        let slot = pcrs
            .get_mut(usize::from(pcr))
            .ok_or(TpmError::BadPcr(pcr))?;
        let mut h = Sha256::new();
        h.update(&slot[..]);
        h.update(digest.as_bytes());
        slot.copy_from_slice(&h.finalize());

        let mut logged = [0; 32];
        logged.copy_from_slice(digest.as_bytes());
        // The log is only for inspection; a full log isn't an extend failure.
        let _ = self.extends.borrow_mut().push((pcr, logged));
        Ok(())
    }
}

impl RegionStorage for SimTpm {
    fn supports(&self, kind: RegionKind) -> bool {
        self.nv.supports(kind)
    }

    fn read(&self, kind: RegionKind, buf: &mut [u8]) -> Result<(), NvError> {
        self.nv.read(kind, buf)
    }

    fn write(&self, kind: RegionKind, data: &[u8]) -> Result<(), NvError> {
        self.nv.write(kind, data)
    }

    fn define(&self, kind: RegionKind, space: &SpaceSpec<'_>) -> Result<(), NvError> {
        self.nv.define(kind, space)
    }

    fn lock(&self, kind: RegionKind) -> Result<(), NvError> {
        self.nv.lock(kind)
    }
}

/// Firmware store backed by a byte slice.
pub struct MemFlash<'a> {
    image: &'a [u8],
    fail_reads: Cell<bool>,
}

impl<'a> MemFlash<'a> {
    pub fn new(image: &'a [u8]) -> Self {
        Self {
            image,
            fail_reads: Cell::new(false),
        }
    }

    pub fn fail_reads(&self) {
        self.fail_reads.set(true);
    }
}

impl FwStore for MemFlash<'_> {
    fn size(&self) -> u32 {
        u32::try_from(self.image.len()).unwrap_or(u32::MAX)
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), FwStoreError> {
        if self.fail_reads.get() {
            return Err(FwStoreError::Io);
        }
        let start = offset as usize;
        let end = start.checked_add(buf.len()).ok_or(FwStoreError::OutOfRange)?;
        let src = self.image.get(start..end).ok_or(FwStoreError::OutOfRange)?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// What a [`RecordingLauncher`] was asked to run.
#[derive(Copy, Clone, Debug)]
pub struct LaunchRecord {
    pub slot: SlotDescriptor,
    pub handoff: FrozenHandoff,
    pub image_digest: [u8; 32],
}

/// Stands in for the jump to the next stage: records the image and returns.
#[derive(Default)]
pub struct RecordingLauncher {
    launches: u32,
}

impl RecordingLauncher {
    pub fn launches(&self) -> u32 {
        self.launches
    }
}

impl Launch for RecordingLauncher {
    type Exit = LaunchRecord;

    fn launch(&mut self, image: LoadedImage<'_>) -> LaunchRecord {
        self.launches += 1;
        LaunchRecord {
            slot: image.slot,
            handoff: *image.handoff,
            image_digest: sha256(image.bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_region_cannot_be_written() {
        let nv = SimNvram::new(RegionSet::all());
        assert_eq!(nv.write(RegionKind::Standard, &[1]), Err(NvError::NotFound));
        nv.define(
            RegionKind::Standard,
            &SpaceSpec {
                attributes: crate::nvdata::NvAttributes::empty(),
                size: 1,
                policy: &[],
            },
        )
        .unwrap();
        nv.write(RegionKind::Standard, &[1]).unwrap();
        assert_eq!(nv.contents(RegionKind::Standard).unwrap().as_slice(), &[1]);
    }

    #[test]
    fn mem_flash_bounds() {
        let image = [1u8, 2, 3, 4];
        let flash = MemFlash::new(&image);
        let mut buf = [0; 2];
        flash.read(2, &mut buf).unwrap();
        assert_eq!(buf, [3, 4]);
        assert_eq!(flash.read(3, &mut buf), Err(FwStoreError::OutOfRange));
    }
}
