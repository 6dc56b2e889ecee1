use std::time::Duration;

use crate::{MediumError, Result};

/// Upper bound for a single raw SCSI transfer when the host does not report one.
pub const DEFAULT_SCSI_TRANSFER_LIMIT: usize = 64 * 1024;

/// A byte range handed to [`HostMedium::discard`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiDirection {
    None,
    /// Device -> host (data-in).
    FromDevice,
    /// Host -> device (data-out).
    ToDevice,
}

/// SCSI status byte returned by the host drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiStatus {
    Good,
    /// The command failed; the caller's sense buffer has been filled.
    CheckCondition,
}

/// Sector layout of one region (track) of an optical medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataForm {
    /// Mode 1 or cooked data, 2048 bytes of user data per sector.
    Mode1Cooked,
    /// Mode 1 raw, 2352 bytes per sector.
    Mode1Raw,
    /// Mode 2 formless, 2336 bytes per sector.
    Mode2Formless,
    /// Red-book audio, 2352 bytes per sector.
    Audio,
}

impl DataForm {
    pub fn is_audio(self) -> bool {
        matches!(self, DataForm::Audio)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionProperties {
    pub lba_start: u64,
    pub block_count: u64,
    pub block_size: u32,
    pub data_form: DataForm,
}

impl RegionProperties {
    pub fn contains(&self, lba: u64) -> bool {
        lba >= self.lba_start && lba - self.lba_start < self.block_count
    }
}

/// Backing store for one emulated drive.
///
/// All methods take `&self` because the controller calls them from its worker thread with its
/// own lock released; implementations use interior mutability. Disk-only media keep the default
/// implementations of the optical and passthrough hooks.
pub trait HostMedium: Send + Sync {
    /// Logical sector size in bytes.
    fn sector_size(&self) -> u32 {
        crate::SECTOR_SIZE as u32
    }

    fn capacity_bytes(&self) -> u64;

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    fn flush(&self) -> Result<()>;

    fn discard(&self, _ranges: &[ByteRange]) -> Result<()> {
        Err(MediumError::NotSupported("discard".to_string()))
    }

    fn is_read_only(&self) -> bool {
        false
    }

    /// Whether this medium is a host drive that accepts raw SCSI commands.
    fn is_passthrough(&self) -> bool {
        false
    }

    /// Issues a raw SCSI command to a host drive.
    ///
    /// `buf` is the data-in or data-out buffer for the command; its length is the transfer
    /// length. On [`ScsiStatus::CheckCondition`] the fixed-format sense data is stored in
    /// `sense`.
    fn send_scsi_cmd(
        &self,
        _cdb: &[u8],
        _direction: ScsiDirection,
        _buf: &mut [u8],
        _sense: &mut [u8],
        _timeout: Duration,
    ) -> Result<ScsiStatus> {
        Err(MediumError::NotSupported("raw scsi".to_string()))
    }

    /// Largest data transfer a single raw SCSI command may carry.
    fn max_scsi_transfer(&self) -> usize {
        DEFAULT_SCSI_TRANSFER_LIMIT
    }

    fn region_count(&self) -> u32 {
        1
    }

    fn query_region_properties(&self, region: u32) -> Result<RegionProperties> {
        if region != 0 {
            return Err(MediumError::NotSupported("multiple regions".to_string()));
        }
        let block_size = self.sector_size();
        Ok(RegionProperties {
            lba_start: 0,
            block_count: self.capacity_bytes() / u64::from(block_size),
            block_size,
            data_form: DataForm::Mode1Cooked,
        })
    }

    /// Finds the region containing `lba` and returns its index and properties.
    fn query_region_for_lba(&self, lba: u64) -> Result<(u32, RegionProperties)> {
        for region in 0..self.region_count() {
            let props = self.query_region_properties(region)?;
            if props.contains(lba) {
                return Ok((region, props));
            }
        }
        Err(MediumError::OutOfBounds {
            offset: lba,
            len: 0,
            capacity: self.capacity_bytes(),
        })
    }

    /// Prevents the user from removing the medium.
    fn lock(&self) -> Result<()> {
        Ok(())
    }

    fn unlock(&self) -> Result<()> {
        Ok(())
    }

    fn eject(&self) -> Result<()> {
        Err(MediumError::NotSupported("eject".to_string()))
    }
}
