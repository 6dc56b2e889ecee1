/// Guest physical address space as seen by a bus-mastering device.
///
/// Both directions take `&mut self`: an address may decode to MMIO whose reads have side
/// effects.
pub trait MemoryBus {
    fn read_physical(&mut self, paddr: u64, buf: &mut [u8]);
    fn write_physical(&mut self, paddr: u64, buf: &[u8]);

    /// Reads a little-endian word, e.g. a descriptor byte count.
    fn read_u16(&mut self, paddr: u64) -> u16 {
        u16::from_le_bytes(read_array(self, paddr))
    }

    /// Reads a little-endian dword, e.g. a descriptor base address.
    fn read_u32(&mut self, paddr: u64) -> u32 {
        u32::from_le_bytes(read_array(self, paddr))
    }

    fn write_u16(&mut self, paddr: u64, val: u16) {
        self.write_physical(paddr, &val.to_le_bytes());
    }

    fn write_u32(&mut self, paddr: u64, val: u32) {
        self.write_physical(paddr, &val.to_le_bytes());
    }
}

fn read_array<const N: usize, B: MemoryBus + ?Sized>(bus: &mut B, paddr: u64) -> [u8; N] {
    let mut buf = [0u8; N];
    bus.read_physical(paddr, &mut buf);
    buf
}
