use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::{Mutex, MutexGuard};

use crate::medium::{ByteRange, HostMedium};
use crate::{checked_range, MediumError, Result, SECTOR_SIZE};

/// Raw disk image stored in a host file.
///
/// The capacity is fixed at open time; accesses past it fail instead of growing the file.
#[derive(Debug)]
pub struct FileMedium {
    file: Mutex<File>,
    capacity: u64,
    sector_size: u32,
    read_only: bool,
}

impl FileMedium {
    pub fn from_file(file: File) -> Result<Self> {
        let capacity = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            capacity,
            sector_size: SECTOR_SIZE as u32,
            read_only: false,
        })
    }

    pub fn with_sector_size(mut self, sector_size: u32) -> Self {
        self.sector_size = sector_size;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    fn lock_file(&self) -> MutexGuard<'_, File> {
        self.file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl HostMedium for FileMedium {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.capacity)?;
        let mut file = self.lock_file();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(MediumError::ReadOnly);
        }
        checked_range(offset, buf.len(), self.capacity)?;
        let mut file = self.lock_file();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let file = self.lock_file();
        file.sync_data()?;
        Ok(())
    }

    fn discard(&self, ranges: &[ByteRange]) -> Result<()> {
        // Punching holes is platform specific; writing zeroes keeps the guest-visible contract.
        const ZERO_CHUNK: usize = 64 * 1024;
        let zeroes = vec![0u8; ZERO_CHUNK];
        for range in ranges {
            let mut offset = range.offset;
            let mut left = range.len;
            while left > 0 {
                let n = left.min(ZERO_CHUNK as u64) as usize;
                self.write_at(offset, &zeroes[..n])?;
                offset += n as u64;
                left -= n as u64;
            }
        }
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}
