use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::medium::{ByteRange, DataForm, HostMedium, RegionProperties};
use crate::{checked_range, MediumError, Result, CD_SECTOR_SIZE, SECTOR_SIZE};

/// In-memory medium.
///
/// Used for RAM disks, ISO images loaded into memory and tests. Optical images can describe
/// several regions (tracks) so that audio/data layout queries behave like a real disc.
#[derive(Debug)]
pub struct RamMedium {
    data: Mutex<Vec<u8>>,
    sector_size: u32,
    regions: Vec<RegionProperties>,
    read_only: bool,
    locked: AtomicBool,
    flushes: AtomicU64,
    discarded: Mutex<Vec<ByteRange>>,
}

impl RamMedium {
    /// Creates a zero-filled hard disk image of `sectors` 512-byte sectors.
    pub fn disk(sectors: u64) -> Self {
        Self::with_data(vec![0u8; sectors as usize * SECTOR_SIZE], SECTOR_SIZE as u32)
    }

    /// Wraps an ISO 9660 image (2048-byte sectors, one data track).
    pub fn iso(data: Vec<u8>) -> Self {
        let mut medium = Self::with_data(data, CD_SECTOR_SIZE as u32);
        medium.read_only = true;
        medium
    }

    pub fn with_data(data: Vec<u8>, sector_size: u32) -> Self {
        let blocks = data.len() as u64 / u64::from(sector_size);
        Self {
            data: Mutex::new(data),
            sector_size,
            regions: vec![RegionProperties {
                lba_start: 0,
                block_count: blocks,
                block_size: sector_size,
                data_form: DataForm::Mode1Cooked,
            }],
            read_only: false,
            locked: AtomicBool::new(false),
            flushes: AtomicU64::new(0),
            discarded: Mutex::new(Vec::new()),
        }
    }

    /// Replaces the track layout. Regions must be sorted by `lba_start`.
    pub fn with_regions(mut self, regions: Vec<RegionProperties>) -> Self {
        self.regions = regions;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Returns a copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.lock_data().clone()
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn discarded_ranges(&self) -> Vec<ByteRange> {
        self.discarded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    fn lock_data(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl HostMedium for RamMedium {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn capacity_bytes(&self) -> u64 {
        self.lock_data().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.lock_data();
        checked_range(offset, buf.len(), data.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(MediumError::ReadOnly);
        }
        let mut data = self.lock_data();
        checked_range(offset, buf.len(), data.len() as u64)?;
        let start = offset as usize;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn discard(&self, ranges: &[ByteRange]) -> Result<()> {
        if self.read_only {
            return Err(MediumError::ReadOnly);
        }
        let mut data = self.lock_data();
        for range in ranges {
            let len = usize::try_from(range.len).map_err(|_| MediumError::OffsetOverflow)?;
            checked_range(range.offset, len, data.len() as u64)?;
            let start = range.offset as usize;
            data[start..start + len].fill(0);
        }
        drop(data);
        self.discarded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend_from_slice(ranges);
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn region_count(&self) -> u32 {
        self.regions.len() as u32
    }

    fn query_region_properties(&self, region: u32) -> Result<RegionProperties> {
        self.regions
            .get(region as usize)
            .copied()
            .ok_or(MediumError::OutOfBounds {
                offset: u64::from(region),
                len: 0,
                capacity: self.regions.len() as u64,
            })
    }

    fn lock(&self) -> Result<()> {
        self.locked.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn unlock(&self) -> Result<()> {
        self.locked.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn eject(&self) -> Result<()> {
        if self.is_locked() {
            return Err(MediumError::NotSupported("medium is locked".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discard_zeroes_and_records_ranges() {
        let medium = RamMedium::with_data(vec![0xAA; 4096], 512);
        medium
            .discard(&[ByteRange {
                offset: 512,
                len: 1024,
            }])
            .unwrap();

        let data = medium.contents();
        assert!(data[..512].iter().all(|b| *b == 0xAA));
        assert!(data[512..1536].iter().all(|b| *b == 0));
        assert!(data[1536..].iter().all(|b| *b == 0xAA));
        assert_eq!(medium.discarded_ranges().len(), 1);
    }

    #[test]
    fn iso_is_read_only() {
        let medium = RamMedium::iso(vec![0; 2048 * 4]);
        assert_eq!(medium.sector_size(), 2048);
        assert!(matches!(
            medium.write_at(0, &[1, 2, 3]).unwrap_err(),
            MediumError::ReadOnly
        ));
    }

    #[test]
    fn region_lookup_finds_audio_track() {
        let medium = RamMedium::iso(vec![0; 2048 * 20]).with_regions(vec![
            RegionProperties {
                lba_start: 0,
                block_count: 10,
                block_size: 2048,
                data_form: DataForm::Mode1Cooked,
            },
            RegionProperties {
                lba_start: 10,
                block_count: 10,
                block_size: 2352,
                data_form: DataForm::Audio,
            },
        ]);

        let (region, props) = medium.query_region_for_lba(12).unwrap();
        assert_eq!(region, 1);
        assert!(props.data_form.is_audio());
        assert!(medium.query_region_for_lba(20).is_err());
    }

    #[test]
    fn locked_medium_refuses_eject() {
        let medium = RamMedium::iso(vec![0; 2048]);
        medium.lock().unwrap();
        assert!(medium.eject().is_err());
        medium.unlock().unwrap();
        medium.eject().unwrap();
    }
}
