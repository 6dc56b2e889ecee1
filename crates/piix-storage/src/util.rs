use crate::{MediumError, Result};

pub fn checked_range(offset: u64, len: usize, capacity: u64) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or(MediumError::OffsetOverflow)?;
    if end > capacity {
        return Err(MediumError::OutOfBounds {
            offset,
            len,
            capacity,
        });
    }
    Ok(())
}
