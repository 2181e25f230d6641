// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The phase executor.
//!
//! A boot attempt is a fixed list of phases run strictly in order against
//! one [`BootContext`]. Each phase either succeeds or ends the attempt; there
//! are no retries, and every fatal failure comes out as the same answer:
//! reboot. The enclosing boot stage does the actual reset.
//!
//! After every phase, whatever the phase changed in the persistent data is
//! written back, so that a later lock can never strand an update.

use log::{error, info, warn};
use thiserror::Error;

use crate::config::VbootConfig;
use crate::context::{BootContext, ContextError, PERSISTED};
use crate::export::{BootReport, ExportSink};
use crate::nvdata::{LockError, RegionKind, RegionStore, StoreError};
use crate::secdata::{self, SecdataError};
use crate::tpm::{PcrBank, RootOfTrust, StartupMode, TpmError};
use crate::transfer::{
    FwStore, HandoffBuilder, Launch, OutFlags, SharedFlags, SlotTransfer, TransferError,
};
use crate::verify::{Verifier, VerifyError};
use crate::vstore::{self, VstoreError};
use crate::{FirmwareType, SlotDescriptor, SlotLabel};

/// The phases of a boot attempt, in the order they run.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Phase {
    RootOfTrustSetup,
    FirmwareSelect,
    SlotVerify,
    SecureDataLock,
    ExportState,
    Transfer,
}

impl Phase {
    pub const ORDER: [Phase; 6] = [
        Phase::RootOfTrustSetup,
        Phase::FirmwareSelect,
        Phase::SlotVerify,
        Phase::SecureDataLock,
        Phase::ExportState,
        Phase::Transfer,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Phase::RootOfTrustSetup => "root-of-trust setup",
            Phase::FirmwareSelect => "firmware select",
            Phase::SlotVerify => "slot verify",
            Phase::SecureDataLock => "secure data lock",
            Phase::ExportState => "export state",
            Phase::Transfer => "transfer",
        }
    }
}

/// Result of running every phase up to transfer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// Everything checked out; this is the slot to hand over to.
    Continue(SlotDescriptor),
    RebootRequired,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum PhaseError {
    #[error("root of trust: {0}")]
    Tpm(#[from] TpmError),
    #[error("rollback spaces: {0}")]
    Secdata(#[from] SecdataError),
    #[error("region store: {0}")]
    Store(#[from] StoreError),
    #[error("region lock: {0}")]
    Lock(#[from] LockError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error("boot context: {0}")]
    Context(#[from] ContextError),
    #[error("resume hash: {0}")]
    Vstore(#[from] VstoreError),
    #[error("transfer: {0}")]
    Transfer(#[from] TransferError),
    #[error("no flash map entry for {0:?}")]
    NoSlot(SlotLabel),
    #[error("verified {verified:?} but selected {candidate:?}")]
    Substituted {
        candidate: SlotDescriptor,
        verified: SlotDescriptor,
    },
    #[error("{0:?} ran before its prerequisites")]
    OutOfOrder(Phase),
}

/// Why an attempt ended in a reboot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Reboot {
    pub phase: Phase,
    pub error: PhaseError,
}

/// Runs the phases of one boot attempt.
pub struct Sequencer<'a> {
    config: &'a VbootConfig,
    rot: RootOfTrust<'a>,
    store: RegionStore<'a>,
    fwstore: &'a dyn FwStore,
    verifier: &'a mut dyn Verifier,
    export: &'a mut dyn ExportSink,
    candidate: Option<SlotDescriptor>,
    failure: Option<Reboot>,
}

impl<'a> Sequencer<'a> {
    pub fn new(
        config: &'a VbootConfig,
        pcrs: &'a dyn PcrBank,
        store: RegionStore<'a>,
        fwstore: &'a dyn FwStore,
        verifier: &'a mut dyn Verifier,
        export: &'a mut dyn ExportSink,
    ) -> Self {
        Self {
            config,
            rot: RootOfTrust::new(pcrs),
            store,
            fwstore,
            verifier,
            export,
            candidate: None,
            failure: None,
        }
    }

    /// The region store, for whatever runs after us in this stage.
    pub fn regions(&mut self) -> &mut RegionStore<'a> {
        &mut self.store
    }

    /// Why the last `run` asked for a reboot, if it did.
    pub fn failure(&self) -> Option<Reboot> {
        self.failure
    }

    /// Runs every phase before transfer.
    pub fn run(&mut self, ctx: &mut BootContext) -> Outcome {
        for phase in Phase::ORDER {
            if phase == Phase::Transfer {
                break;
            }
            info!("vboot: {}", phase.name());
            let result = self
                .run_phase(phase, ctx)
                .and_then(|()| self.persist(ctx));
            if let Err(e) = result {
                error!("vboot: {} failed: {}", phase.name(), e);
                // The library may have recorded this failure for the next
                // attempt to act on.
                if let Err(e) = self.persist(ctx) {
                    warn!("vboot: couldn't save data before reboot: {}", e);
                }
                self.failure = Some(Reboot { phase, error: e });
                return Outcome::RebootRequired;
            }
        }

        match ctx.selected_slot() {
            Some(slot) => Outcome::Continue(slot),
            None => {
                let phase = Phase::Transfer;
                self.failure = Some(Reboot {
                    phase,
                    error: PhaseError::OutOfOrder(phase),
                });
                Outcome::RebootRequired
            }
        }
    }

    /// Runs the whole attempt, ending in a launch of the selected slot.
    ///
    /// The context is consumed: once we've jumped there is nothing left for
    /// it to describe.
    pub fn boot<L: Launch>(
        mut self,
        mut ctx: BootContext,
        transfer: &mut SlotTransfer<'_>,
        launcher: &mut L,
    ) -> Result<L::Exit, Reboot> {
        let slot = match self.run(&mut ctx) {
            Outcome::Continue(slot) => slot,
            Outcome::RebootRequired => {
                return Err(self.failure.unwrap_or(Reboot {
                    phase: Phase::Transfer,
                    error: PhaseError::OutOfOrder(Phase::Transfer),
                }));
            }
        };

        info!("vboot: {}", Phase::Transfer.name());
        let developer = ctx.firmware_type() == FirmwareType::Developer;
        let handoff = HandoffBuilder::new(ctx.firmware_type())
            .out_flags(OutFlags::for_mode(ctx.recovery_mode(), developer))
            .shared_flags(SharedFlags::from_switches(&ctx.switches, developer))
            .recovery_reason(ctx.recovery_reason())
            .fw_version(ctx.fw_version());

        transfer
            .finalize_and_jump(&slot, handoff, launcher)
            .map_err(|e| {
                error!("vboot: {} failed: {}", Phase::Transfer.name(), e);
                Reboot {
                    phase: Phase::Transfer,
                    error: e.into(),
                }
            })
    }

    fn run_phase(&mut self, phase: Phase, ctx: &mut BootContext) -> Result<(), PhaseError> {
        match phase {
            Phase::RootOfTrustSetup => self.root_of_trust_setup(ctx),
            Phase::FirmwareSelect => self.firmware_select(ctx),
            Phase::SlotVerify => self.slot_verify(ctx),
            Phase::SecureDataLock => self.secure_data_lock(ctx),
            Phase::ExportState => self.export_state(ctx),
            // Needs the launcher; see `boot`.
            Phase::Transfer => Err(PhaseError::OutOfOrder(phase)),
        }
    }

    fn root_of_trust_setup(&mut self, ctx: &mut BootContext) -> Result<(), PhaseError> {
        let mode = if ctx.switches.resume {
            StartupMode::Resume
        } else {
            StartupMode::Clear
        };
        self.rot.setup(mode)?;
        secdata::load(&mut self.store, &mut ctx.data, self.config.has_rec_hash)?;
        ctx.data.load_from(&self.store, RegionKind::Standard)?;
        Ok(())
    }

    fn firmware_select(&mut self, ctx: &mut BootContext) -> Result<(), PhaseError> {
        let selection = self.verifier.select_firmware(&mut ctx.data, &ctx.switches)?;
        ctx.apply_selection(&selection);

        let candidate = self
            .config
            .flash_map
            .resolve(selection.slot)
            .ok_or(PhaseError::NoSlot(selection.slot))?;
        info!(
            "vboot: selected {} ({:?}), recovery reason {:#x}",
            candidate.label().name(),
            selection.firmware_type,
            selection.recovery_reason
        );
        self.candidate = Some(candidate);
        Ok(())
    }

    fn slot_verify(&mut self, ctx: &mut BootContext) -> Result<(), PhaseError> {
        let candidate = self
            .candidate
            .ok_or(PhaseError::OutOfOrder(Phase::SlotVerify))?;
        let verified = self
            .verifier
            .verify_slot(&mut ctx.data, &candidate, self.fwstore)?;

        if verified.slot != candidate {
            return Err(PhaseError::Substituted {
                candidate,
                verified: verified.slot,
            });
        }

        for m in &verified.measurements {
            self.rot.extend_pcr(m.pcr, &m.digest)?;
            ctx.push_measurement(*m)?;
        }

        if let Some(digest) = &verified.body_digest {
            if self.config.needs_resume_hash() {
                vstore::handle_body_digest(&mut self.store, digest, ctx.switches.resume)?;
            }
        }

        ctx.set_fw_version(verified.fw_version);
        ctx.select_slot(candidate)?;
        Ok(())
    }

    fn secure_data_lock(&mut self, ctx: &mut BootContext) -> Result<(), PhaseError> {
        // The firmware rollback version is committed in every mode.
        let fw = self.store.lock(RegionKind::SecureFirmware)?;
        info!("vboot: {:?} locked", fw.kind());

        if self.config.has_rec_hash {
            let rec = self.store.lock(RegionKind::RecoveryHash)?;
            info!("vboot: {:?} locked", rec.kind());
        }

        if ctx.recovery_mode() {
            // Recovery may need to update the kernel space, so it stays
            // writable for whatever boots next.
            info!("vboot: recovery mode, kernel space left unlocked");
            return Ok(());
        }

        let lock = self.store.lock(RegionKind::SecureKernel)?;
        ctx.hold_kernel_lock(lock);
        Ok(())
    }

    fn export_state(&mut self, ctx: &mut BootContext) -> Result<(), PhaseError> {
        let slot = ctx
            .selected_slot()
            .ok_or(PhaseError::OutOfOrder(Phase::ExportState))?;
        let report = BootReport {
            firmware_type: self
                .config
                .firmware_type_override
                .unwrap_or(ctx.firmware_type()),
            recovery_mode: ctx.recovery_mode(),
            slot,
            recovery_reason: ctx.recovery_reason(),
            fw_version: ctx.fw_version(),
            switches: ctx.switches,
            fwid: self.config.fwid,
        };
        if let Err(e) = self.export.publish(&report) {
            warn!("vboot: couldn't publish boot state: {}", e);
        }
        Ok(())
    }

    /// Writes back every persistent buffer changed since the last call.
    fn persist(&mut self, ctx: &mut BootContext) -> Result<(), PhaseError> {
        for kind in PERSISTED {
            if !ctx.data.is_dirty(kind) {
                continue;
            }
            if let Some(data) = ctx.data.get(kind) {
                self.store.write(kind, data)?;
            }
            ctx.data.mark_clean(kind);
        }
        Ok(())
    }
}
