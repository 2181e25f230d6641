// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Publishing the boot decision for the OS.
//!
//! This is informational only. Nothing here may stop the boot: the
//! sequencer logs an export failure and carries on.

use crc::{Crc, CRC_32_ISO_HDLC};
use log::info;
use static_assertions::const_assert_eq;
use thiserror::Error;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use crate::context::Switches;
use crate::{FirmwareType, SlotDescriptor, SlotLabel};

/// Length of the firmware ID field in the ACPI area.
pub const FWID_LEN: usize = 64;

pub const LEGACY_TABLE_MAGIC: [u8; 4] = *b"VBLT";

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Active main firmware, as reported through ACPI.
pub const BINF_RECOVERY: u32 = 0;
pub const BINF_RW_A: u32 = 1;
pub const BINF_RW_B: u32 = 2;

/// Switch state bits (`CHSW`).
pub const CHSW_RECOVERY_X86: u16 = 1 << 1;
pub const CHSW_DEVELOPER_SWITCH: u16 = 1 << 5;
pub const CHSW_FIRMWARE_WP: u16 = 1 << 9;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum ExportError {
    #[error("boot state already published")]
    AlreadyPublished,
    #[error("export area too small")]
    TooSmall,
    #[error("firmware ID too long")]
    FwidTooLong,
}

/// What gets published.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BootReport<'a> {
    pub firmware_type: FirmwareType,
    pub recovery_mode: bool,
    pub slot: SlotDescriptor,
    pub recovery_reason: u8,
    pub fw_version: u32,
    pub switches: Switches,
    pub fwid: &'a str,
}

impl BootReport<'_> {
    /// The main firmware index the OS tools expect.
    pub fn active_main_firmware(&self) -> u32 {
        if self.recovery_mode {
            return BINF_RECOVERY;
        }
        match self.slot.label() {
            SlotLabel::RwA => BINF_RW_A,
            SlotLabel::RwB => BINF_RW_B,
            SlotLabel::RoRecovery | SlotLabel::NextStage => BINF_RECOVERY,
        }
    }

    pub fn switch_state(&self) -> u16 {
        let mut chsw = 0;
        if self.switches.force_recovery {
            chsw |= CHSW_RECOVERY_X86;
        }
        if self.switches.developer {
            chsw |= CHSW_DEVELOPER_SWITCH;
        }
        if self.switches.write_protect {
            chsw |= CHSW_FIRMWARE_WP;
        }
        chsw
    }
}

/// Somewhere the boot decision can be published.
pub trait ExportSink {
    fn publish(&mut self, report: &BootReport<'_>) -> Result<(), ExportError>;
}

/// The verified-boot part of the ACPI global NVS area.
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct AcpiVbootArea {
    pub boot_reason: U32<LittleEndian>,
    pub active_main_fw: U32<LittleEndian>,
    pub active_ec_fw: U32<LittleEndian>,
    pub chsw: U16<LittleEndian>,
    pub fwid: [u8; FWID_LEN],
    pub main_fw_type: U32<LittleEndian>,
    pub recovery_reason: U32<LittleEndian>,
}

const_assert_eq!(core::mem::size_of::<AcpiVbootArea>(), 86);

/// Publishes into an ACPI NVS area handed over by the platform code.
pub struct AcpiSink<'a> {
    area: &'a mut [u8],
}

impl<'a> AcpiSink<'a> {
    pub fn new(area: &'a mut [u8]) -> Self {
        Self { area }
    }
}

impl ExportSink for AcpiSink<'_> {
    fn publish(&mut self, report: &BootReport<'_>) -> Result<(), ExportError> {
        let fwid = report.fwid.as_bytes();
        if fwid.len() > FWID_LEN {
            return Err(ExportError::FwidTooLong);
        }
        let (mut area, _) =
            LayoutVerified::<_, AcpiVbootArea>::new_unaligned_from_prefix(&mut self.area[..])
                .ok_or(ExportError::TooSmall)?;

        area.active_main_fw = U32::new(report.active_main_firmware());
        area.chsw = U16::new(report.switch_state());
        area.fwid = [0; FWID_LEN];
        area.fwid[..fwid.len()].copy_from_slice(fwid);
        area.main_fw_type = U32::new(report.firmware_type as u32);
        area.recovery_reason = U32::new(u32::from(report.recovery_reason));
        info!(
            "export: ACPI main fw {} type {:?}",
            report.active_main_firmware(),
            report.firmware_type
        );
        Ok(())
    }
}

/// Fixed-layout record for boards without ACPI.
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct LegacyRecord {
    pub magic: [u8; 4],
    pub firmware_type: u8,
    pub recovery_mode: u8,
    pub active_main_fw: u8,
    pub recovery_reason: u8,
    pub fw_version: U32<LittleEndian>,
    /// CRC-32 of the first 12 bytes.
    pub crc: U32<LittleEndian>,
}

const_assert_eq!(core::mem::size_of::<LegacyRecord>(), 16);

impl LegacyRecord {
    pub fn new(report: &BootReport<'_>) -> Self {
        let mut record = Self {
            magic: LEGACY_TABLE_MAGIC,
            firmware_type: report.firmware_type as u8,
            recovery_mode: u8::from(report.recovery_mode),
            active_main_fw: report.active_main_firmware() as u8,
            recovery_reason: report.recovery_reason,
            fw_version: U32::new(report.fw_version),
            crc: U32::new(0),
        };
        record.crc = U32::new(CRC32.checksum(&record.as_bytes()[..12]));
        record
    }
}

/// Publishes a [`LegacyRecord`] into a fixed memory region.
pub struct LegacyTableSink<'a> {
    table: &'a mut [u8],
}

impl<'a> LegacyTableSink<'a> {
    pub fn new(table: &'a mut [u8]) -> Self {
        Self { table }
    }
}

impl ExportSink for LegacyTableSink<'_> {
    fn publish(&mut self, report: &BootReport<'_>) -> Result<(), ExportError> {
        let record = LegacyRecord::new(report);
        let bytes = record.as_bytes();
        self.table
            .get_mut(..bytes.len())
            .ok_or(ExportError::TooSmall)?
            .copy_from_slice(bytes);
        info!("export: legacy table crc {:#010x}", record.crc.get());
        Ok(())
    }
}

/// For boards with nowhere to publish to.
pub struct NullSink;

impl ExportSink for NullSink {
    fn publish(&mut self, _report: &BootReport<'_>) -> Result<(), ExportError> {
        info!("export: nothing to publish to");
        Ok(())
    }
}

/// Lets a sink be published to once per boot.
pub struct OneShot<S> {
    inner: S,
    published: bool,
}

impl<S: ExportSink> OneShot<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            published: false,
        }
    }

    pub fn is_published(&self) -> bool {
        self.published
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: ExportSink> ExportSink for OneShot<S> {
    fn publish(&mut self, report: &BootReport<'_>) -> Result<(), ExportError> {
        if self.published {
            return Err(ExportError::AlreadyPublished);
        }
        self.inner.publish(report)?;
        self.published = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(label: SlotLabel, recovery: bool) -> BootReport<'static> {
        BootReport {
            firmware_type: if recovery {
                FirmwareType::Recovery
            } else {
                FirmwareType::Normal
            },
            recovery_mode: recovery,
            slot: SlotDescriptor::new(label, 0x1000, 0x1000),
            recovery_reason: if recovery { 0x02 } else { 0 },
            fw_version: 0x0001_0001,
            switches: Switches {
                write_protect: true,
                ..Switches::default()
            },
            fwid: "Google_Sandbox.1234.0.0",
        }
    }

    #[test]
    fn active_firmware_index() {
        assert_eq!(report(SlotLabel::RwA, false).active_main_firmware(), BINF_RW_A);
        assert_eq!(report(SlotLabel::RwB, false).active_main_firmware(), BINF_RW_B);
        assert_eq!(report(SlotLabel::RoRecovery, true).active_main_firmware(), BINF_RECOVERY);
    }

    #[test]
    fn acpi_area_is_filled() {
        let mut gnvs = [0xffu8; 0x100];
        let mut sink = AcpiSink::new(&mut gnvs);
        sink.publish(&report(SlotLabel::RwB, false)).unwrap();

        let area = LayoutVerified::<_, AcpiVbootArea>::new_unaligned_from_prefix(&gnvs[..])
            .unwrap()
            .0
            .into_ref();
        assert_eq!(area.active_main_fw.get(), BINF_RW_B);
        assert_eq!(area.main_fw_type.get(), FirmwareType::Normal as u32);
        assert_eq!(area.chsw.get(), CHSW_FIRMWARE_WP);
        assert_eq!(&area.fwid[..23], b"Google_Sandbox.1234.0.0");
        assert_eq!(area.fwid[23], 0);
        // Fields we don't own are left alone.
        assert_eq!(area.boot_reason.get(), 0xffff_ffff);
    }

    #[test]
    fn acpi_area_too_small() {
        let mut gnvs = [0u8; 16];
        let mut sink = AcpiSink::new(&mut gnvs);
        assert_eq!(
            sink.publish(&report(SlotLabel::RwA, false)),
            Err(ExportError::TooSmall)
        );
    }

    #[test]
    fn legacy_record_crc() {
        let mut table = [0u8; 16];
        let mut sink = LegacyTableSink::new(&mut table);
        sink.publish(&report(SlotLabel::RoRecovery, true)).unwrap();

        assert_eq!(&table[..4], b"VBLT");
        assert_eq!(table[4], FirmwareType::Recovery as u8);
        assert_eq!(table[5], 1);
        assert_eq!(table[7], 0x02);
        let crc = u32::from_le_bytes([table[12], table[13], table[14], table[15]]);
        assert_eq!(CRC32.checksum(&table[..12]), crc);
    }

    #[test]
    fn one_shot_refuses_second_publish() {
        let mut table = [0u8; 16];
        let mut sink = OneShot::new(LegacyTableSink::new(&mut table));
        let r = report(SlotLabel::RwA, false);
        sink.publish(&r).unwrap();
        assert!(sink.is_published());
        assert_eq!(sink.publish(&r), Err(ExportError::AlreadyPublished));
    }

    #[test]
    fn one_shot_allows_retry_after_failure() {
        let mut table = [0u8; 8];
        let mut sink = OneShot::new(LegacyTableSink::new(&mut table));
        let r = report(SlotLabel::RwA, false);
        assert_eq!(sink.publish(&r), Err(ExportError::TooSmall));
        assert!(!sink.is_published());
    }
}
