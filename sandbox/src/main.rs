// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runs the boot sequencer on the host against simulated devices.
//!
//! This plays the part of the boot stage around the sequencer: it builds the
//! devices, runs an attempt, and then either "jumps" (prints what would have
//! been launched) or "resets" (starts a fresh attempt with the persistent
//! state carried over and every lock cleared).

mod verifier;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use log::info;
use std::str::FromStr;

use vboot_stage::bsp::{self, Board, Bsp};
use vboot_stage::config::{ExportKind, VbootConfig};
use vboot_stage::context::{BootContext, Switches, NVDATA_SIZE};
use vboot_stage::export::{
    AcpiSink, AcpiVbootArea, BootReport, ExportError, ExportSink, LegacyTableSink, NullSink,
    OneShot,
};
use vboot_stage::nvdata::{RegionKind, RegionSet, RegionStore};
use vboot_stage::secdata;
use vboot_stage::sequencer::{Reboot, Sequencer};
use vboot_stage::sim::{LaunchRecord, MemFlash, RecordingLauncher, SimNvram, SimTpm};
use vboot_stage::transfer::SlotTransfer;
use vboot_stage::verify::GbbFlags;
use vboot_stage::vstore::VSTORE_SLOT_SIZE;
use vboot_stage::SlotLabel;

use verifier::{
    seal, set_rollback_version, TrailerVerifier, PCR_BOOT_MODE, PCR_HWID, VERSION_LEN,
};

const HWID: &str = "SANDBOX TEST 1234";
const GNVS_SIZE: usize = 0x100;
const LEGACY_TABLE_SIZE: usize = 16;

#[derive(Debug, Parser)]
#[clap(about = "Boots the verified-boot sequencer against simulated devices")]
struct Args {
    /// Hold the recovery button
    #[clap(long)]
    recovery: bool,
    /// Developer switch on
    #[clap(long)]
    developer: bool,
    /// Firmware write protect asserted
    #[clap(long)]
    write_protect: bool,
    /// Start out trying RW-B rather than RW-A
    #[clap(long)]
    try_b: bool,
    /// Corrupt a firmware region (ro, a, b); may be repeated
    #[clap(long)]
    corrupt: Vec<SlotArg>,
    /// Firmware version stamped into the RW regions
    #[clap(long, default_value = "1")]
    rw_version: u32,
    /// Rollback version already recorded in the TPM
    #[clap(long, default_value = "0")]
    rollback_version: u32,
    /// Boot a factory-fresh part with no rollback spaces
    #[clap(long)]
    factory_fresh: bool,
    /// Fail TPM startup on the first attempt
    #[clap(long)]
    fail_startup: bool,
    /// Fail locking a region on the first attempt; may be repeated
    #[clap(long)]
    fail_lock: Vec<RegionArg>,
    /// Fail writes to a region on the first attempt; may be repeated
    #[clap(long)]
    fail_write: Vec<RegionArg>,
    /// After booting, suspend and resume through the same firmware
    #[clap(long)]
    resume: bool,
    /// Reflash the booted region while suspended
    #[clap(long, requires = "resume")]
    reflash_while_suspended: bool,
    /// Give up after this many attempts
    #[clap(long, default_value = "4")]
    max_attempts: u32,
}

#[derive(Copy, Clone, Debug)]
struct SlotArg(SlotLabel);

impl FromStr for SlotArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Self(match s {
            "ro" => SlotLabel::RoRecovery,
            "a" => SlotLabel::RwA,
            "b" => SlotLabel::RwB,
            _ => bail!("unknown region {:?}; expected ro, a or b", s),
        }))
    }
}

#[derive(Copy, Clone, Debug)]
struct RegionArg(RegionKind);

impl FromStr for RegionArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Self(match s {
            "nvdata" => RegionKind::Standard,
            "firmware" => RegionKind::SecureFirmware,
            "kernel" => RegionKind::SecureKernel,
            "rec-hash" => RegionKind::RecoveryHash,
            "vstore" => RegionKind::VerifiedStoreSlot,
            _ => bail!(
                "unknown region {:?}; expected nvdata, firmware, kernel, rec-hash or vstore",
                s
            ),
        }))
    }
}

/// The simulated board. Dropping it is a cold reset.
struct Devices {
    tpm: SimTpm,
    cmos: SimNvram,
    ec: SimNvram,
}

impl Devices {
    fn new(args: &Args) -> Self {
        let cmos = SimNvram::new(RegionSet::of(&[RegionKind::Standard]));
        let mut nvdata = [0; NVDATA_SIZE];
        nvdata[0] = u8::from(args.try_b);
        cmos.preload(RegionKind::Standard, &nvdata);

        let ec = SimNvram::new(RegionSet::of(&[RegionKind::VerifiedStoreSlot]));
        ec.preload(RegionKind::VerifiedStoreSlot, &[0; VSTORE_SLOT_SIZE]);

        let tpm = SimTpm::new();
        if !args.factory_fresh {
            let mut firmware = secdata::fresh_firmware_secdata();
            set_rollback_version(&mut firmware, args.rollback_version);
            tpm.nv().preload(RegionKind::SecureFirmware, &firmware);
            tpm.nv()
                .preload(RegionKind::SecureKernel, &secdata::SECDATA_KERNEL_DEFAULT);
            tpm.nv()
                .preload(RegionKind::RecoveryHash, &[0; secdata::REC_HASH_SIZE]);
        }
        if args.fail_startup {
            tpm.fail_startup();
        }
        for RegionArg(kind) in &args.fail_lock {
            tpm.nv().fail_lock(*kind);
            cmos.fail_lock(*kind);
            ec.fail_lock(*kind);
        }
        for RegionArg(kind) in &args.fail_write {
            tpm.nv().fail_write(*kind);
            cmos.fail_write(*kind);
            ec.fail_write(*kind);
        }
        Self { tpm, cmos, ec }
    }

    /// Power-cycles the board: stored contents survive, locks and injected
    /// faults don't.
    fn reset(self) -> Self {
        let tpm = SimTpm::new();
        let cmos = SimNvram::new(RegionSet::of(&[RegionKind::Standard]));
        let ec = SimNvram::new(RegionSet::of(&[RegionKind::VerifiedStoreSlot]));
        for kind in RegionKind::ALL {
            for (old, new) in [(self.tpm.nv(), tpm.nv()), (&self.cmos, &cmos), (&self.ec, &ec)] {
                if let Some(contents) = old.contents(kind) {
                    new.preload(kind, &contents);
                }
            }
        }
        Self { tpm, cmos, ec }
    }

    fn store(&self) -> Result<RegionStore<'_>> {
        let mut store = RegionStore::new();
        store.attach(&self.tpm)?;
        store.attach(&self.cmos)?;
        store.attach(&self.ec)?;
        Ok(store)
    }
}

/// Builds a flash image holding a sealed region for every firmware slot.
fn build_image(config: &VbootConfig, args: &Args) -> Result<Vec<u8>> {
    let labels = [SlotLabel::RoRecovery, SlotLabel::RwA, SlotLabel::RwB];
    let mut len = 0;
    for label in labels {
        let slot = config
            .flash_map
            .resolve(label)
            .ok_or_else(|| anyhow!("no {} in the flash map", label.name()))?;
        let end = slot
            .end()
            .ok_or_else(|| anyhow!("{} runs off the end of flash", label.name()))?;
        len = len.max(end as usize);
    }

    let mut image = vec![0xff; len];
    for label in labels {
        let slot = config
            .flash_map
            .resolve(label)
            .ok_or_else(|| anyhow!("no {} in the flash map", label.name()))?;
        let region = &mut image[slot.offset() as usize..][..slot.size() as usize];
        let version = if label == SlotLabel::RoRecovery {
            0
        } else {
            args.rw_version
        };
        region.fill(label as u8);
        region[..VERSION_LEN].copy_from_slice(&version.to_le_bytes());
        seal(region);
    }

    for SlotArg(label) in &args.corrupt {
        let slot = config
            .flash_map
            .resolve(*label)
            .ok_or_else(|| anyhow!("no {} in the flash map", label.name()))?;
        image[slot.offset() as usize + VERSION_LEN] ^= 0xff;
        info!("sandbox: corrupted {}", label.name());
    }
    Ok(image)
}

/// Rewrites a region with different but validly sealed contents.
fn reflash(image: &mut [u8], config: &VbootConfig, label: SlotLabel) -> Result<()> {
    let slot = config
        .flash_map
        .resolve(label)
        .ok_or_else(|| anyhow!("no {} in the flash map", label.name()))?;
    let region = &mut image[slot.offset() as usize..][..slot.size() as usize];
    region[VERSION_LEN] = region[VERSION_LEN].wrapping_add(1);
    seal(region);
    Ok(())
}

/// Whichever export backend the board has.
enum Sink<'a> {
    Acpi(AcpiSink<'a>),
    Legacy(LegacyTableSink<'a>),
    Null(NullSink),
}

impl ExportSink for Sink<'_> {
    fn publish(&mut self, report: &BootReport<'_>) -> Result<(), ExportError> {
        match self {
            Sink::Acpi(s) => s.publish(report),
            Sink::Legacy(s) => s.publish(report),
            Sink::Null(s) => s.publish(report),
        }
    }
}

fn attempt(
    config: &VbootConfig,
    devices: &Devices,
    image: &[u8],
    switches: Switches,
) -> Result<Result<LaunchRecord, Reboot>> {
    let flash = MemFlash::new(image);
    let mut load_buffer = vec![0u8; image.len()];
    let mut transfer = SlotTransfer::new(&flash, &config.flash_map, &mut load_buffer);
    let mut launcher = RecordingLauncher::default();
    let mut verifier = TrailerVerifier::new(HWID, GbbFlags::empty());

    let mut gnvs = [0u8; GNVS_SIZE];
    let mut table = [0u8; LEGACY_TABLE_SIZE];
    let mut export = OneShot::new(match config.export {
        ExportKind::Acpi => Sink::Acpi(AcpiSink::new(&mut gnvs)),
        ExportKind::LegacyTable => Sink::Legacy(LegacyTableSink::new(&mut table)),
        ExportKind::Disabled => Sink::Null(NullSink),
    });

    let seq = Sequencer::new(
        config,
        &devices.tpm,
        devices.store()?,
        &flash,
        &mut verifier,
        &mut export,
    );
    let result = seq.boot(BootContext::new(switches), &mut transfer, &mut launcher);
    let published = export.is_published();
    drop(export);

    if published {
        match config.export {
            ExportKind::Acpi => {
                let area = &gnvs[..core::mem::size_of::<AcpiVbootArea>()];
                println!("exported ACPI area: {}", hex(area));
            }
            ExportKind::LegacyTable => println!("exported legacy table: {}", hex(&table)),
            ExportKind::Disabled => {}
        }
    }
    Ok(result)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn report_launch(record: &LaunchRecord, devices: &Devices) {
    let handoff = &record.handoff;
    println!(
        "jump: {} at {:#x}, {} bytes, sha256 {}",
        record.slot.label().name(),
        record.slot.offset(),
        record.slot.size(),
        hex(&record.image_digest)
    );
    println!(
        "  handoff: type {} out {:?} shared {:?} crc {:#010x} ({})",
        handoff.firmware_type(),
        handoff.out_flags(),
        handoff.shared_flags(),
        handoff.crc(),
        if handoff.is_intact() { "ok" } else { "BAD" }
    );
    for pcr in [PCR_BOOT_MODE, PCR_HWID] {
        println!("  PCR{}: {}", pcr, hex(&devices.tpm.pcr(pcr)));
    }
    for kind in [
        RegionKind::SecureFirmware,
        RegionKind::SecureKernel,
        RegionKind::RecoveryHash,
    ] {
        if devices.tpm.nv().contents(kind).is_some() {
            println!(
                "  {:?}: {}",
                kind,
                if devices.tpm.nv().is_locked(kind) {
                    "locked"
                } else {
                    "unlocked"
                }
            );
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = Board::config();
    info!("sandbox: board {}, fwid {}", bsp::BOARD_NAME, config.fwid);

    let mut image = build_image(&config, &args)?;
    let mut devices = Devices::new(&args);
    let mut switches = Switches {
        force_recovery: args.recovery,
        developer: args.developer,
        write_protect: args.write_protect,
        resume: false,
    };

    let mut booted = None;
    for n in 1..=args.max_attempts {
        match attempt(&config, &devices, &image, switches)? {
            Ok(record) => {
                report_launch(&record, &devices);
                booted = Some(record);
                break;
            }
            Err(reboot) => {
                println!(
                    "reset: attempt {} failed in {}: {}",
                    n,
                    reboot.phase.name(),
                    reboot.error
                );
                devices = devices.reset();
                // The button is only held for the first boot.
                switches.force_recovery = false;
            }
        }
    }
    let record = booted.with_context(|| format!("no boot after {} attempts", args.max_attempts))?;

    if args.resume {
        if args.reflash_while_suspended {
            reflash(&mut image, &config, record.slot.label())?;
            info!("sandbox: reflashed {} while suspended", record.slot.label().name());
        }
        // S3 keeps the TPM and EC powered, so their state and locks carry
        // over.
        switches.resume = true;
        match attempt(&config, &devices, &image, switches)? {
            Ok(record) => report_launch(&record, &devices),
            Err(reboot) => {
                println!(
                    "reset: resume failed in {}: {}",
                    reboot.phase.name(),
                    reboot.error
                );
            }
        }
    }
    Ok(())
}
