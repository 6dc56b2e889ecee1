//! PIIX3/PIIX4/ICH6 IDE function: legacy port decode for both channels plus the bus-master
//! block.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::channel::SharedMemory;
use crate::config::IdeConfig;
use crate::controller::{open_bus, Controller, IdeError, IrqLine, RedoHandler, Result};

/// Legacy I/O port assignment of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdePortMap {
    pub cmd_base: u16,
    pub ctrl_base: u16,
}

pub const PRIMARY_PORTS: IdePortMap = IdePortMap {
    cmd_base: 0x1F0,
    ctrl_base: 0x3F6,
};

pub const SECONDARY_PORTS: IdePortMap = IdePortMap {
    cmd_base: 0x170,
    ctrl_base: 0x376,
};

/// Size of the bus-master register block (8 bytes per channel).
pub const BUS_MASTER_BLOCK_LEN: u16 = 16;

/// Which register block a port belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Port {
    Command { channel: usize, reg: u16 },
    Control { channel: usize, reg: u16 },
    BusMaster { channel: usize, offset: u16 },
}

/// The IDE function of a PIIX-family south bridge.
pub struct PiixIde {
    channels: [Controller; 2],
    bus_master_base: u16,
}

impl PiixIde {
    /// Builds both channels. `irqs` are the primary and secondary interrupt lines.
    pub fn new(
        config: &IdeConfig,
        memory: SharedMemory,
        irqs: [Arc<dyn IrqLine>; 2],
        redo_handler: Arc<dyn RedoHandler>,
    ) -> Result<Self> {
        let [primary_irq, secondary_irq] = irqs;
        let primary = Controller::new(
            config,
            0,
            Arc::clone(&memory),
            primary_irq,
            Arc::clone(&redo_handler),
        )?;
        let secondary = Controller::new(config, 1, memory, secondary_irq, redo_handler)?;
        debug!(chipset = ?config.chipset, bus_master_base = config.bus_master_base, "piix ide created");
        Ok(Self {
            channels: [primary, secondary],
            bus_master_base: config.bus_master_base,
        })
    }

    pub fn channel(&self, index: usize) -> Result<&Controller> {
        self.channels.get(index).ok_or(IdeError::InvalidChannel(index))
    }

    pub fn bus_master_base(&self) -> u16 {
        self.bus_master_base
    }

    /// Moves the bus-master block, as done when the guest reprograms BAR4.
    pub fn set_bus_master_base(&mut self, base: u16) {
        if base != self.bus_master_base {
            debug!(old = self.bus_master_base, new = base, "bus master block relocated");
        }
        self.bus_master_base = base;
    }

    fn decode(&self, port: u16) -> Option<Port> {
        for (channel, map) in [PRIMARY_PORTS, SECONDARY_PORTS].into_iter().enumerate() {
            let off = port.wrapping_sub(map.cmd_base);
            if off < 8 {
                return Some(Port::Command { channel, reg: off });
            }
            let off = port.wrapping_sub(map.ctrl_base);
            if off < 2 {
                return Some(Port::Control { channel, reg: off });
            }
        }
        let off = port.wrapping_sub(self.bus_master_base);
        if off < BUS_MASTER_BLOCK_LEN {
            return Some(Port::BusMaster {
                channel: usize::from(off / 8),
                offset: off % 8,
            });
        }
        None
    }

    pub fn io_read(&self, port: u16, size: u8) -> u32 {
        if size == 0 {
            return 0;
        }
        let val = match self.decode(port) {
            Some(Port::Command { channel, reg }) => self.channels[channel].read_command(reg, size),
            Some(Port::Control { channel, reg }) => self.channels[channel].read_control(reg, size),
            Some(Port::BusMaster { channel, offset }) => {
                self.channels[channel].read_bus_master(offset, size)
            }
            None => open_bus(size),
        };
        trace!(port, size, val, "ide port read");
        val
    }

    pub fn io_write(&self, port: u16, size: u8, val: u32) {
        if size == 0 {
            return;
        }
        trace!(port, size, val, "ide port write");
        match self.decode(port) {
            Some(Port::Command { channel, reg }) => {
                self.channels[channel].write_command(reg, size, val)
            }
            Some(Port::Control { channel, reg }) => {
                self.channels[channel].write_control(reg, val as u8)
            }
            Some(Port::BusMaster { channel, offset }) => {
                self.channels[channel].write_bus_master(offset, size, val)
            }
            None => {}
        }
    }

    /// Suspends both channel workers.
    pub fn suspend(&self) {
        self.channels.iter().for_each(Controller::suspend);
    }

    /// Resumes both channel workers, replaying pending redo requests.
    pub fn resume(&self) {
        self.channels.iter().for_each(Controller::resume);
    }

    /// Waits until both channels are idle. Returns `false` on timeout.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.channels.iter().all(|c| {
            let left = deadline.saturating_duration_since(Instant::now());
            c.wait_for_idle(left)
        })
    }

    pub fn irq_asserted(&self, channel: usize) -> bool {
        self.channels.get(channel).is_some_and(Controller::irq_asserted)
    }
}
