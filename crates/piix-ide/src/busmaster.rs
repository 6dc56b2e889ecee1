use memory::MemoryBus;

use piix_io_snapshot::io::storage::state::IdeBusMasterState;

use crate::regs::{BmCommand, BmStatus};

/// Descriptor tables may not cross the 4 KiB page they start in.
pub const PRD_TABLE_PAGE: u32 = 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrdEntry {
    pub addr: u32,
    pub byte_count: u16,
    pub end_of_table: bool,
}

impl PrdEntry {
    pub const SIZE: u32 = 8;

    pub fn read_from(mem: &mut dyn MemoryBus, paddr: u64) -> Self {
        let addr = mem.read_u32(paddr);
        // Malformed guest pointers wrap instead of overflowing.
        let byte_count = mem.read_u16(paddr.wrapping_add(4));
        let flags = mem.read_u16(paddr.wrapping_add(6));
        Self {
            addr,
            byte_count,
            end_of_table: (flags & 0x8000) != 0,
        }
    }

    /// A byte count of 0 encodes 64 KiB.
    pub fn effective_len(&self) -> u32 {
        match self.byte_count {
            0 => 0x1_0000,
            c => u32::from(c),
        }
    }
}

/// Position inside the descriptor table, kept across a redo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrdCursor {
    /// Guest-physical address of the next descriptor.
    pub desc: u32,
    /// Guest-physical address inside the current descriptor's buffer.
    pub addr: u32,
    /// Bytes left in the current descriptor.
    pub left: u32,
    /// The current descriptor is the last one.
    pub last: bool,
}

impl PrdCursor {
    pub fn start(table: u32) -> Self {
        Self {
            desc: table,
            ..Self::default()
        }
    }

    /// Loads the descriptor at `desc` and moves past it.
    pub fn advance(&mut self, mem: &mut dyn MemoryBus) {
        let prd = PrdEntry::read_from(mem, u64::from(self.desc));
        self.desc = self.desc.wrapping_add(PrdEntry::SIZE);
        self.addr = prd.addr;
        self.left = prd.effective_len();
        self.last = prd.end_of_table;
    }
}

/// One bus-master IDE register block (primary or secondary).
#[derive(Debug, Clone, Copy, Default)]
pub struct BusMaster {
    cmd: BmCommand,
    status: BmStatus,
    prd_addr: u32,
}

/// What a command register write asks the controller to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BmCommandEffect {
    None,
    Started,
    Stopped,
}

impl BusMaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.cmd.contains(BmCommand::START)
    }

    pub fn is_active(&self) -> bool {
        self.status.contains(BmStatus::ACTIVE)
    }

    pub fn prd_addr(&self) -> u32 {
        self.prd_addr
    }

    /// End of the page holding the descriptor table.
    pub fn table_page_end(&self) -> u32 {
        (self.prd_addr & !(PRD_TABLE_PAGE - 1)).wrapping_add(PRD_TABLE_PAGE)
    }

    /// Byte-wise register read at `offset` 0..=7.
    pub fn read_u8(&self, offset: u16) -> u8 {
        match offset {
            0 => self.cmd.bits(),
            2 => self.status.bits(),
            4..=7 => self.prd_addr.to_le_bytes()[usize::from(offset - 4)],
            _ => 0,
        }
    }

    pub fn write_u8(&mut self, offset: u16, val: u8) -> BmCommandEffect {
        match offset {
            0 => {
                let new = BmCommand::from_bits_truncate(val);
                let was_started = self.is_started();
                self.cmd = new;
                match (was_started, new.contains(BmCommand::START)) {
                    (false, true) => {
                        self.status.insert(BmStatus::ACTIVE);
                        BmCommandEffect::Started
                    }
                    (true, false) => {
                        self.status.remove(BmStatus::ACTIVE);
                        BmCommandEffect::Stopped
                    }
                    _ => BmCommandEffect::None,
                }
            }
            2 => {
                let v = BmStatus::from_bits_truncate(val);
                // ERROR and IRQ are write-1-to-clear; the drive capability bits are plain R/W.
                self.status
                    .remove(v & (BmStatus::ERROR | BmStatus::IRQ));
                let rw = BmStatus::DRIVE0_DMA | BmStatus::DRIVE1_DMA;
                self.status = (self.status & !rw) | (v & rw);
                BmCommandEffect::None
            }
            4..=7 => {
                let shift = u32::from(offset - 4) * 8;
                let mask = 0xFFu32 << shift;
                self.prd_addr = ((self.prd_addr & !mask) | (u32::from(val) << shift)) & !3;
                BmCommandEffect::None
            }
            _ => BmCommandEffect::None,
        }
    }

    pub fn set_irq(&mut self) {
        self.status.insert(BmStatus::IRQ);
    }

    /// Marks a transfer in flight when the drive joins an already started engine.
    pub fn mark_active(&mut self) {
        self.status.insert(BmStatus::ACTIVE);
    }

    pub fn clear_active(&mut self) {
        self.status.remove(BmStatus::ACTIVE);
    }

    pub fn finish_success(&mut self) {
        self.status.remove(BmStatus::ACTIVE);
        self.status.insert(BmStatus::IRQ);
    }

    pub fn finish_error(&mut self) {
        self.status.remove(BmStatus::ACTIVE);
        self.status.insert(BmStatus::ERROR | BmStatus::IRQ);
    }

    pub fn snapshot_state(&self) -> IdeBusMasterState {
        IdeBusMasterState {
            cmd: self.cmd.bits(),
            status: self.status.bits(),
            prd_addr: self.prd_addr,
        }
    }

    pub fn restore_state(&mut self, state: &IdeBusMasterState) {
        self.cmd = BmCommand::from_bits_truncate(state.cmd);
        self.status = BmStatus::from_bits_truncate(state.status);
        self.prd_addr = state.prd_addr & !3;
    }
}
