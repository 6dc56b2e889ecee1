//! Task-file register layout and flag definitions.

use bitflags::bitflags;

pub const ATA_REG_DATA: u16 = 0;
pub const ATA_REG_ERROR_FEATURES: u16 = 1;
pub const ATA_REG_SECTOR_COUNT: u16 = 2;
pub const ATA_REG_LBA0: u16 = 3;
pub const ATA_REG_LBA1: u16 = 4;
pub const ATA_REG_LBA2: u16 = 5;
pub const ATA_REG_DEVICE: u16 = 6;
pub const ATA_REG_STATUS_COMMAND: u16 = 7;

pub const ATA_CTRL_ALT_STATUS_DEVICE_CTRL: u16 = 0;
pub const ATA_CTRL_DRIVE_ADDRESS: u16 = 1;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Status: u8 {
        const BUSY = 0x80;
        const READY = 0x40;
        const DEVICE_FAULT = 0x20;
        const SEEK = 0x10;
        const DRQ = 0x08;
        const CORRECTED = 0x04;
        const INDEX = 0x02;
        const ERR = 0x01;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceControl: u8 {
        /// Interrupts disabled.
        const NIEN = 0x02;
        const SRST = 0x04;
        /// Reads of registers 1-5 return the high-order bytes.
        const HOB = 0x80;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BmCommand: u8 {
        const START = 0x01;
        const TO_MEMORY = 0x08;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BmStatus: u8 {
        const ACTIVE = 0x01;
        const ERROR = 0x02;
        const IRQ = 0x04;
        const DRIVE0_DMA = 0x20;
        const DRIVE1_DMA = 0x40;
        const SIMPLEX = 0x80;
    }
}

/// Error register: command aborted.
pub const ERR_ABRT: u8 = 0x04;
/// Error register: sector ID not found.
pub const ERR_IDNF: u8 = 0x10;

/// ATAPI interrupt reason (sector count register): command/data.
pub const IREASON_COD: u8 = 0x01;
/// ATAPI interrupt reason: transfer towards the host.
pub const IREASON_IO: u8 = 0x02;

/// Task-file registers of one device, including the LBA48 high-order shadows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterFile {
    pub feature: u8,
    pub hob_feature: u8,
    pub nsector: u8,
    pub hob_nsector: u8,
    pub sector: u8,
    pub hob_sector: u8,
    pub lcyl: u8,
    pub hob_lcyl: u8,
    pub hcyl: u8,
    pub hob_hcyl: u8,
    pub select: u8,
    pub status: Status,
    pub error: u8,
    pub command: u8,
    pub lba48: bool,
}

impl RegisterFile {
    /// Writes registers 1-6. The previous value of registers 1-5 moves into its HOB shadow.
    pub fn write(&mut self, reg: u16, val: u8) {
        match reg {
            ATA_REG_ERROR_FEATURES => {
                self.hob_feature = self.feature;
                self.feature = val;
            }
            ATA_REG_SECTOR_COUNT => {
                self.hob_nsector = self.nsector;
                self.nsector = val;
            }
            ATA_REG_LBA0 => {
                self.hob_sector = self.sector;
                self.sector = val;
            }
            ATA_REG_LBA1 => {
                self.hob_lcyl = self.lcyl;
                self.lcyl = val;
            }
            ATA_REG_LBA2 => {
                self.hob_hcyl = self.hcyl;
                self.hcyl = val;
            }
            ATA_REG_DEVICE => self.select = val | 0xA0,
            _ => {}
        }
    }

    pub fn read(&self, reg: u16, hob: bool) -> u8 {
        match (reg, hob) {
            (ATA_REG_ERROR_FEATURES, _) => self.error,
            (ATA_REG_SECTOR_COUNT, false) => self.nsector,
            (ATA_REG_SECTOR_COUNT, true) => self.hob_nsector,
            (ATA_REG_LBA0, false) => self.sector,
            (ATA_REG_LBA0, true) => self.hob_sector,
            (ATA_REG_LBA1, false) => self.lcyl,
            (ATA_REG_LBA1, true) => self.hob_lcyl,
            (ATA_REG_LBA2, false) => self.hcyl,
            (ATA_REG_LBA2, true) => self.hob_hcyl,
            (ATA_REG_DEVICE, _) => self.select,
            (ATA_REG_STATUS_COMMAND, _) => self.status.bits(),
            _ => 0,
        }
    }

    pub fn head(&self) -> u8 {
        self.select & 0x0F
    }

    pub fn lba_mode(&self) -> bool {
        self.select & 0x40 != 0
    }

    /// ATAPI byte-count limit (cylinder registers).
    pub fn byte_count_limit(&self) -> u16 {
        u16::from_le_bytes([self.lcyl, self.hcyl])
    }

    pub fn set_byte_count(&mut self, count: u16) {
        let [lo, hi] = count.to_le_bytes();
        self.lcyl = lo;
        self.hcyl = hi;
    }

    pub fn set_ireason(&mut self, reason: u8) {
        self.nsector = (self.nsector & !0x07) | (reason & 0x07);
    }
}

/// Device index selected by a write to the drive/head register.
pub fn device_from_select(val: u8) -> usize {
    usize::from((val >> 4) & 1)
}
