//! One IDE channel: register decode on the emulation path plus its worker thread.

use std::io;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use piix_io_snapshot::io::state::SnapshotError;
use piix_storage::{HostMedium, MediumError};
use thiserror::Error;
use tracing::{debug, warn};

use crate::busmaster::{BmCommandEffect, BusMaster};
use crate::channel::{ChannelLimits, ChannelShared, ChannelState, RedoState, SharedMemory};
use crate::config::{ConfigError, IdeConfig};
use crate::device::{Device, MediaEvent, TransferContext};
use crate::dispatch;
use crate::identify::default_transfer_mode;
use crate::pio;
use crate::queue::RequestQueue;
use crate::regs::{
    device_from_select, DeviceControl, Status, ATA_CTRL_ALT_STATUS_DEVICE_CTRL,
    ATA_CTRL_DRIVE_ADDRESS, ATA_REG_DATA, ATA_REG_DEVICE, ATA_REG_ERROR_FEATURES,
    ATA_REG_LBA2, ATA_REG_STATUS_COMMAND,
};
use crate::request::{AsyncState, Request};
use crate::stats::Stats;
use crate::worker;

pub type Result<T> = std::result::Result<T, IdeError>;

#[derive(Debug, Error)]
pub enum IdeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to spawn the ide worker thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed to allocate a {0} byte i/o buffer")]
    BufferAllocation(usize),

    #[error("invalid channel index {0}")]
    InvalidChannel(usize),

    #[error("invalid device index {0}")]
    InvalidDevice(usize),

    #[error("no drive configured at position {0}")]
    NoDrive(usize),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("the controller must be suspended first")]
    NotSuspended,

    #[error("{0} requests are still queued for the worker")]
    RequestsPending(usize),
}

/// Interrupt line of one channel (IRQ 14 or 15 on a PC).
pub trait IrqLine: Send + Sync {
    fn set_level(&self, level: bool);
}

/// Notified when a request hits a transient host error.
///
/// The embedder is expected to pause the VM, let the operator fix the host condition and
/// then call [`Controller::resume`], which replays the interrupted request.
pub trait RedoHandler: Send + Sync {
    fn on_redo(&self, err: &MediumError);
}

/// Consecutive BUSY status reads before the polling vCPU yields.
const BUSY_SPIN_LIMIT: u32 = 16;

pub(crate) fn open_bus(size: u8) -> u32 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}

/// An IDE channel with its master and slave drive positions.
pub struct Controller {
    shared: Arc<ChannelShared>,
    worker: Option<JoinHandle<()>>,
}

impl Controller {
    /// Builds channel `channel` (0 primary, 1 secondary) from `config` and starts its worker.
    pub fn new(
        config: &IdeConfig,
        channel: usize,
        memory: SharedMemory,
        irq: Arc<dyn IrqLine>,
        redo_handler: Arc<dyn RedoHandler>,
    ) -> Result<Self> {
        config.validate()?;
        if channel > 1 {
            return Err(IdeError::InvalidChannel(channel));
        }
        let max_udma = config.chipset.max_udma();
        let max_mult = u8::try_from(config.max_mult_sectors).unwrap_or(u8::MAX);
        let chan = config.channel(channel);

        let mut devices = [Device::absent(0), Device::absent(1)];
        for (index, slot) in devices.iter_mut().enumerate() {
            let Some(drive) = chan.drive(index) else {
                continue;
            };
            let mut dev =
                Device::from_config(index, drive, max_mult, default_transfer_mode(max_udma));
            let bytes = config.buffer_bytes_for(drive);
            dev.xfer = TransferContext::try_with_capacity(bytes)
                .ok_or(IdeError::BufferAllocation(bytes))?;
            *slot = dev;
        }

        let name = if channel == 0 { "primary" } else { "secondary" };
        let state = ChannelState {
            devices,
            selected: 0,
            async_device: 0,
            async_state: AsyncState::Idle,
            device_control: DeviceControl::empty(),
            reset: false,
            bm: BusMaster::new(),
            redo: RedoState::default(),
            memory,
            irq,
            irq_level: false,
            busy_polls: 0,
            limits: ChannelLimits {
                max_udma,
                passthrough_timeout: Duration::from_millis(config.passthrough_timeout_ms),
            },
        };
        let shared = Arc::new(ChannelShared {
            name: name.to_string(),
            state: Mutex::new(state),
            queue: RequestQueue::new(config.queue_capacity),
            redo_handler,
        });
        let worker = worker::spawn(Arc::clone(&shared)).map_err(IdeError::Spawn)?;
        debug!(channel = name, "ide channel created");
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    pub(crate) fn shared(&self) -> &ChannelShared {
        &self.shared
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Reads command block register `reg` (0-7).
    pub fn read_command(&self, reg: u16, size: u8) -> u32 {
        let mut st = self.shared.lock_state();
        if st.no_devices() {
            return open_bus(size);
        }
        let sel = st.selected;
        if !st.devices[sel].is_present() {
            return 0;
        }
        match reg {
            ATA_REG_DATA => {
                if st.async_state != AsyncState::Pio || st.async_device != sel {
                    return 0;
                }
                let (val, exhausted) = pio::read_data(&mut st.devices[sel].xfer, usize::from(size));
                if exhausted {
                    pio::window_exhausted(&self.shared.queue, &mut st, sel);
                }
                val
            }
            ATA_REG_STATUS_COMMAND => {
                let status = st.devices[sel].regs.status;
                st.clear_irq(sel);
                if status.contains(Status::BUSY) {
                    st.busy_polls += 1;
                    if st.busy_polls >= BUSY_SPIN_LIMIT {
                        st.busy_polls = 0;
                        drop(st);
                        thread::yield_now();
                    }
                } else {
                    st.busy_polls = 0;
                }
                u32::from(status.bits())
            }
            ATA_REG_ERROR_FEATURES..=ATA_REG_DEVICE => {
                let hob = st.device_control.contains(DeviceControl::HOB);
                u32::from(st.devices[sel].regs.read(reg, hob))
            }
            _ => 0,
        }
    }

    /// Writes command block register `reg` (0-7).
    pub fn write_command(&self, reg: u16, size: u8, val: u32) {
        let mut st = self.shared.lock_state();
        match reg {
            ATA_REG_DATA => {
                let sel = st.selected;
                if !st.devices[sel].is_present()
                    || st.async_state != AsyncState::Pio
                    || st.async_device != sel
                {
                    return;
                }
                if pio::write_data(&mut st.devices[sel].xfer, usize::from(size), val) {
                    pio::window_exhausted(&self.shared.queue, &mut st, sel);
                }
            }
            ATA_REG_ERROR_FEATURES..=ATA_REG_LBA2 => {
                for d in st.devices.iter_mut() {
                    d.regs.write(reg, val as u8);
                }
                st.device_control.remove(DeviceControl::HOB);
            }
            ATA_REG_DEVICE => {
                for d in st.devices.iter_mut() {
                    d.regs.write(reg, val as u8);
                }
                st.selected = device_from_select(val as u8);
                st.sync_irq();
            }
            ATA_REG_STATUS_COMMAND => {
                if st.reset {
                    return;
                }
                let sel = st.selected;
                dispatch::execute(&self.shared.queue, &mut st, sel, val as u8);
            }
            _ => {}
        }
    }

    /// Reads control block register `reg` (0 alternate status, 1 drive address).
    pub fn read_control(&self, reg: u16, size: u8) -> u32 {
        let st = self.shared.lock_state();
        if st.no_devices() {
            return open_bus(size);
        }
        let sel = st.selected;
        match reg {
            ATA_CTRL_ALT_STATUS_DEVICE_CTRL => {
                if !st.devices[sel].is_present() {
                    return 0;
                }
                u32::from(st.devices[sel].regs.status.bits())
            }
            ATA_CTRL_DRIVE_ADDRESS => {
                let head = st.devices[sel].regs.head();
                let nds0 = u8::from(sel != 0);
                let nds1 = u8::from(sel != 1);
                u32::from(0xC0 | (!head & 0x0F) << 2 | nds1 << 1 | nds0)
            }
            _ => open_bus(size),
        }
    }

    /// Writes the device control register.
    pub fn write_control(&self, reg: u16, val: u8) {
        if reg != ATA_CTRL_ALT_STATUS_DEVICE_CTRL {
            return;
        }
        let mut st = self.shared.lock_state();
        let old = st.device_control;
        let new = DeviceControl::from_bits_truncate(val);
        st.device_control = new;

        let was_reset = old.contains(DeviceControl::SRST);
        let is_reset = new.contains(DeviceControl::SRST);
        if !was_reset && is_reset {
            debug!(channel = %self.shared.name, "software reset asserted");
            for d in st.devices.iter_mut() {
                d.regs.status = Status::BUSY;
                d.generation += 1;
            }
            st.reset = true;
            self.shared.queue.purge();
            if !self.shared.queue.push(Request::ResetAsserted) {
                warn!(channel = %self.shared.name, "request ring full, reset request dropped");
            }
        } else if was_reset && !is_reset {
            debug!(channel = %self.shared.name, "software reset released");
            if !self.shared.queue.push(Request::ResetCleared) {
                warn!(channel = %self.shared.name, "request ring full, reset request dropped");
            }
        }
        if old.contains(DeviceControl::NIEN) != new.contains(DeviceControl::NIEN) {
            st.sync_irq();
        }
    }

    pub fn read_bus_master(&self, offset: u16, size: u8) -> u32 {
        let st = self.shared.lock_state();
        (0..u16::from(size.min(4))).fold(0u32, |acc, i| {
            acc | u32::from(st.bm.read_u8(offset.wrapping_add(i))) << (8 * i)
        })
    }

    pub fn write_bus_master(&self, offset: u16, size: u8, val: u32) {
        let mut st = self.shared.lock_state();
        for i in 0..u16::from(size.min(4)) {
            let byte = (val >> (8 * i)) as u8;
            if st.bm.write_u8(offset.wrapping_add(i), byte) == BmCommandEffect::Started {
                self.bus_master_started(&st);
            }
        }
    }

    fn bus_master_started(&self, st: &ChannelState) {
        let dev = st.async_device;
        let d = &st.devices[dev];
        if !st.reset
            && st.async_state == AsyncState::Dma
            && d.xfer.dma
            && d.regs.status.contains(Status::DRQ)
            && !self.shared.queue.push(Request::ContinueDma)
        {
            warn!(channel = %self.shared.name, "request ring full, dma start dropped");
        }
    }

    fn check_device(st: &ChannelState, dev: usize) -> Result<()> {
        if dev > 1 {
            return Err(IdeError::InvalidDevice(dev));
        }
        if !st.devices[dev].is_present() {
            return Err(IdeError::NoDrive(dev));
        }
        Ok(())
    }

    /// Inserts a medium into drive `dev`.
    pub fn attach_medium(&self, dev: usize, medium: Arc<dyn HostMedium>) -> Result<()> {
        let mut st = self.shared.lock_state();
        Self::check_device(&st, dev)?;
        let d = &mut st.devices[dev];
        d.generation += 1;
        d.set_medium(Some(medium));
        d.tracks = None;
        if d.is_atapi() {
            d.atapi.media_present = true;
            d.atapi.tray_open = false;
            d.atapi.unit_attention = true;
            d.atapi.media_event = MediaEvent::NewMedia;
        } else {
            d.set_signature();
        }
        debug!(channel = %self.shared.name, device = dev, passthrough = d.passthrough, "medium attached");
        Ok(())
    }

    /// Removes the medium from drive `dev`, aborting its command in flight.
    pub fn detach_medium(&self, dev: usize) -> Result<()> {
        let mut st = self.shared.lock_state();
        Self::check_device(&st, dev)?;
        let d = &mut st.devices[dev];
        d.generation += 1;
        let active = d.xfer.active;
        d.set_medium(None);
        d.tracks = None;
        if d.is_atapi() {
            d.atapi.media_present = false;
            d.atapi.locked = false;
            d.atapi.media_event = MediaEvent::MediaRemoval;
        }
        if active
            && !st.reset
            && !self.shared.queue.push(Request::Abort {
                device: dev,
                reset_drive: false,
            })
        {
            warn!(channel = %self.shared.name, device = dev, "request ring full, abort dropped");
        }
        debug!(channel = %self.shared.name, device = dev, "medium detached");
        Ok(())
    }

    /// The host medium changed size or content underneath the drive.
    pub fn notify_medium_changed(&self, dev: usize) -> Result<()> {
        let mut st = self.shared.lock_state();
        Self::check_device(&st, dev)?;
        let d = &mut st.devices[dev];
        let medium = d.medium.clone();
        d.set_medium(medium);
        if d.is_atapi() && d.has_medium() {
            d.atapi.unit_attention = true;
            d.atapi.media_event = MediaEvent::NewMedia;
        }
        Ok(())
    }

    /// Closes the worker gate and waits until the current request has finished.
    pub fn suspend(&self) {
        self.shared.queue.suspend();
    }

    /// Reopens the worker gate, replaying a request interrupted by a redo first.
    pub fn resume(&self) {
        self.shared.queue.resume();
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.queue.is_paused()
    }

    pub fn is_idle(&self) -> bool {
        self.shared.queue.is_idle()
    }

    /// Waits until the request queue has drained. Returns `false` on timeout.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        self.shared.queue.wait_for_idle(timeout)
    }

    pub fn stats(&self, dev: usize) -> Option<Stats> {
        let st = self.shared.lock_state();
        st.devices.get(dev).map(|d| d.stats.clone())
    }

    pub fn irq_asserted(&self) -> bool {
        self.shared.lock_state().irq_level
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.shared.queue.shutdown();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(channel = %self.shared.name, "ide worker panicked");
            }
        }
    }
}
