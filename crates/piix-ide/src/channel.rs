//! State shared between the emulation path and the worker thread of one channel.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use memory::MemoryBus;

use crate::busmaster::{BusMaster, PrdCursor};
use crate::controller::{IrqLine, RedoHandler};
use crate::device::Device;
use crate::queue::RequestQueue;
use crate::regs::{DeviceControl, Status, ERR_ABRT, IREASON_COD, IREASON_IO};
use crate::request::AsyncState;

pub type SharedMemory = Arc<Mutex<dyn MemoryBus + Send>>;

pub(crate) type StateGuard<'a> = MutexGuard<'a, ChannelState>;

/// SCSI sense keys used by the emulated ATAPI device.
pub(crate) const SENSE_NOT_READY: u8 = 0x02;
pub(crate) const SENSE_MEDIUM_ERROR: u8 = 0x03;
pub(crate) const SENSE_HARDWARE_ERROR: u8 = 0x04;
pub(crate) const SENSE_ILLEGAL_REQUEST: u8 = 0x05;
pub(crate) const SENSE_UNIT_ATTENTION: u8 = 0x06;

/// Redo bookkeeping: set while a request waits for `resume()`.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RedoState {
    pub(crate) pending: bool,
    pub(crate) dma: Option<PrdCursor>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ChannelLimits {
    pub(crate) max_udma: Option<u8>,
    pub(crate) passthrough_timeout: Duration,
}

/// Everything guarded by the controller lock.
pub(crate) struct ChannelState {
    pub(crate) devices: [Device; 2],
    pub(crate) selected: usize,
    pub(crate) async_device: usize,
    pub(crate) async_state: AsyncState,
    pub(crate) device_control: DeviceControl,
    pub(crate) reset: bool,
    pub(crate) bm: BusMaster,
    pub(crate) redo: RedoState,
    pub(crate) memory: SharedMemory,
    pub(crate) irq: Arc<dyn IrqLine>,
    pub(crate) irq_level: bool,
    pub(crate) busy_polls: u32,
    pub(crate) limits: ChannelLimits,
}

impl ChannelState {
    pub(crate) fn no_devices(&self) -> bool {
        !self.devices[0].is_present() && !self.devices[1].is_present()
    }

    /// Replaces a device's status. Suppressed while the channel is held in reset.
    pub(crate) fn set_status(&mut self, dev: usize, status: Status) {
        if !self.reset {
            self.devices[dev].regs.status = status;
        }
    }

    pub(crate) fn status_insert(&mut self, dev: usize, bits: Status) {
        if !self.reset {
            self.devices[dev].regs.status.insert(bits);
        }
    }

    pub(crate) fn status_remove(&mut self, dev: usize, bits: Status) {
        if !self.reset {
            self.devices[dev].regs.status.remove(bits);
        }
    }

    /// Latches a device interrupt and drives the line if the device is selected.
    pub(crate) fn raise_irq(&mut self, dev: usize) {
        self.devices[dev].irq_pending = true;
        if !self.device_control.contains(DeviceControl::NIEN) {
            self.bm.set_irq();
        }
        self.sync_irq();
    }

    pub(crate) fn clear_irq(&mut self, dev: usize) {
        self.devices[dev].irq_pending = false;
        self.sync_irq();
    }

    /// Recomputes the line level from the selected device and nIEN.
    pub(crate) fn sync_irq(&mut self) {
        let level = self.devices[self.selected].irq_pending
            && !self.device_control.contains(DeviceControl::NIEN);
        if level != self.irq_level {
            self.irq_level = level;
            self.irq.set_level(level);
        }
    }

    /// Successful end of a command: ready status, no error, interrupt.
    pub(crate) fn complete_ok(&mut self, dev: usize) {
        let d = &mut self.devices[dev];
        d.regs.error = 0;
        d.xfer.clear();
        if d.is_atapi() {
            d.regs.set_ireason(IREASON_IO | IREASON_COD);
            d.atapi.clear_sense();
            self.set_status(dev, Status::READY);
        } else {
            self.set_status(dev, Status::READY | Status::SEEK);
        }
        self.raise_irq(dev);
    }

    /// Failed ATA command with `error` in the error register.
    pub(crate) fn complete_error(&mut self, dev: usize, error: u8) {
        let d = &mut self.devices[dev];
        d.regs.error = error;
        d.xfer.clear();
        if d.is_atapi() {
            d.regs.set_ireason(IREASON_IO | IREASON_COD);
        }
        self.set_status(dev, Status::READY | Status::ERR);
        self.raise_irq(dev);
    }

    pub(crate) fn abort_command(&mut self, dev: usize) {
        self.complete_error(dev, ERR_ABRT);
    }

    /// ATAPI CHECK CONDITION with the given sense data.
    pub(crate) fn atapi_check_condition(&mut self, dev: usize, key: u8, asc: u8, ascq: u8) {
        let d = &mut self.devices[dev];
        d.atapi.set_sense(key, asc, ascq);
        d.regs.error = key << 4;
        d.regs.set_ireason(IREASON_IO | IREASON_COD);
        d.regs.set_byte_count(0);
        d.xfer.clear();
        self.set_status(dev, Status::READY | Status::ERR);
        self.raise_irq(dev);
    }

    pub(crate) fn illegal_request(&mut self, dev: usize, asc: u8) {
        self.atapi_check_condition(dev, SENSE_ILLEGAL_REQUEST, asc, 0);
    }

    /// Emits a rate-limited warning for `dev`.
    pub(crate) fn log_budget(&mut self, dev: usize) -> bool {
        self.devices[dev].stats.log_budget()
    }

    pub(crate) fn lock_memory(memory: &SharedMemory) -> MutexGuard<'_, dyn MemoryBus + Send + 'static> {
        memory
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Shared between the [`crate::Controller`] handle and its worker thread.
pub(crate) struct ChannelShared {
    pub(crate) name: String,
    pub(crate) state: Mutex<ChannelState>,
    pub(crate) queue: RequestQueue,
    pub(crate) redo_handler: Arc<dyn RedoHandler>,
}

impl ChannelShared {
    pub(crate) fn lock_state(&self) -> StateGuard<'_> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
