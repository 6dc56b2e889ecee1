use crate::bus::MemoryBus;

/// Flat guest RAM starting at physical address 0.
///
/// Reads beyond the end of RAM return all-ones (open bus) and writes beyond the end are
/// dropped, matching what an unterminated PCI master cycle observes.
#[derive(Debug, Clone)]
pub struct Bus {
    ram: Vec<u8>,
}

impl Bus {
    pub fn new(size: usize) -> Self {
        Self {
            ram: vec![0u8; size],
        }
    }

    pub fn ram(&self) -> &[u8] {
        &self.ram
    }

    pub fn ram_mut(&mut self) -> &mut [u8] {
        &mut self.ram
    }

    fn span(&self, paddr: u64, len: usize) -> (usize, usize) {
        let size = self.ram.len() as u64;
        if paddr >= size {
            return (0, 0);
        }
        let start = paddr as usize;
        let avail = self.ram.len() - start;
        (start, len.min(avail))
    }
}

impl MemoryBus for Bus {
    fn read_physical(&mut self, paddr: u64, buf: &mut [u8]) {
        let (start, n) = self.span(paddr, buf.len());
        buf[..n].copy_from_slice(&self.ram[start..start + n]);
        buf[n..].fill(0xFF);
    }

    fn write_physical(&mut self, paddr: u64, buf: &[u8]) {
        let (start, n) = self.span(paddr, buf.len());
        self.ram[start..start + n].copy_from_slice(&buf[..n]);
    }
}
