//! Host media consumed by the emulated IDE controller.
//!
//! The controller only ever talks to a [`HostMedium`]: a byte-addressed, thread-safe backing
//! store that may additionally accept raw SCSI commands (host CD/DVD passthrough). This crate
//! provides:
//!
//! - [`HostMedium`]: the medium interface (block I/O, discard, raw SCSI, region queries)
//! - [`MediumError`]: error type with the transient/permanent classification used for redo
//! - [`RamMedium`]: in-memory disk or optical image with optional track regions
//! - [`FileMedium`]: raw image file on the host filesystem

mod error;
mod file;
mod medium;
mod ram;
mod util;

pub use error::{MediumError, Result};
pub use file::FileMedium;
pub use medium::{
    ByteRange, DataForm, HostMedium, RegionProperties, ScsiDirection, ScsiStatus,
    DEFAULT_SCSI_TRANSFER_LIMIT,
};
pub use ram::RamMedium;
pub use util::checked_range;

/// Sector size of ATA hard disks.
pub const SECTOR_SIZE: usize = 512;

/// Sector size of cooked CD/DVD data tracks.
pub const CD_SECTOR_SIZE: usize = 2048;

/// Raw CD sector size (audio, or data with sync/header/EDC).
pub const CD_RAW_SECTOR_SIZE: usize = 2352;
