//! ATA command decoding.
//!
//! Commands either complete inline under the controller lock or are turned into a
//! [`NewTransfer`] for the worker.

use piix_storage::SECTOR_SIZE;
use tracing::{debug, trace, warn};

use crate::channel::ChannelState;
use crate::device::{Geometry, MAX_CYLINDERS};
use crate::identify::select_transfer_mode;
use crate::queue::RequestQueue;
use crate::regs::Status;
use crate::request::{AsyncState, BeginStep, Direction, NewTransfer, Request, SinkStep};
use crate::transfer::start_transfer;

pub const ATA_CMD_DATA_SET_MANAGEMENT: u8 = 0x06;
pub const ATA_CMD_DEVICE_RESET: u8 = 0x08;
pub const ATA_CMD_READ_SECTORS: u8 = 0x20;
pub const ATA_CMD_READ_SECTORS_NORETRY: u8 = 0x21;
pub const ATA_CMD_READ_SECTORS_EXT: u8 = 0x24;
pub const ATA_CMD_READ_DMA_EXT: u8 = 0x25;
pub const ATA_CMD_READ_NATIVE_MAX_EXT: u8 = 0x27;
pub const ATA_CMD_READ_MULTIPLE_EXT: u8 = 0x29;
pub const ATA_CMD_WRITE_SECTORS: u8 = 0x30;
pub const ATA_CMD_WRITE_SECTORS_NORETRY: u8 = 0x31;
pub const ATA_CMD_WRITE_SECTORS_EXT: u8 = 0x34;
pub const ATA_CMD_WRITE_DMA_EXT: u8 = 0x35;
pub const ATA_CMD_WRITE_MULTIPLE_EXT: u8 = 0x39;
pub const ATA_CMD_READ_VERIFY: u8 = 0x40;
pub const ATA_CMD_READ_VERIFY_NORETRY: u8 = 0x41;
pub const ATA_CMD_READ_VERIFY_EXT: u8 = 0x42;
pub const ATA_CMD_SEEK: u8 = 0x70;
pub const ATA_CMD_EXECUTE_DIAGNOSTIC: u8 = 0x90;
pub const ATA_CMD_INIT_DEVICE_PARAMS: u8 = 0x91;
pub const ATA_CMD_PACKET: u8 = 0xA0;
pub const ATA_CMD_IDENTIFY_PACKET: u8 = 0xA1;
pub const ATA_CMD_READ_MULTIPLE: u8 = 0xC4;
pub const ATA_CMD_WRITE_MULTIPLE: u8 = 0xC5;
pub const ATA_CMD_SET_MULTIPLE: u8 = 0xC6;
pub const ATA_CMD_READ_DMA: u8 = 0xC8;
pub const ATA_CMD_READ_DMA_NORETRY: u8 = 0xC9;
pub const ATA_CMD_WRITE_DMA: u8 = 0xCA;
pub const ATA_CMD_WRITE_DMA_NORETRY: u8 = 0xCB;
pub const ATA_CMD_STANDBY_IMMEDIATE: u8 = 0xE0;
pub const ATA_CMD_IDLE_IMMEDIATE: u8 = 0xE1;
pub const ATA_CMD_CHECK_POWER_MODE: u8 = 0xE5;
pub const ATA_CMD_SLEEP: u8 = 0xE6;
pub const ATA_CMD_FLUSH_CACHE: u8 = 0xE7;
pub const ATA_CMD_FLUSH_CACHE_EXT: u8 = 0xEA;
pub const ATA_CMD_IDENTIFY: u8 = 0xEC;
pub const ATA_CMD_SET_FEATURES: u8 = 0xEF;
pub const ATA_CMD_READ_NATIVE_MAX: u8 = 0xF8;

const LBA28_MAX: u64 = 0x0FFF_FFFF;

/// DATA SET MANAGEMENT feature bit selecting TRIM.
const DSM_TRIM: u8 = 0x01;

fn is_lba48(cmd: u8) -> bool {
    matches!(
        cmd,
        ATA_CMD_DATA_SET_MANAGEMENT
            | ATA_CMD_READ_SECTORS_EXT
            | ATA_CMD_READ_DMA_EXT
            | ATA_CMD_READ_NATIVE_MAX_EXT
            | ATA_CMD_READ_MULTIPLE_EXT
            | ATA_CMD_WRITE_SECTORS_EXT
            | ATA_CMD_WRITE_DMA_EXT
            | ATA_CMD_WRITE_MULTIPLE_EXT
            | ATA_CMD_READ_VERIFY_EXT
            | ATA_CMD_FLUSH_CACHE_EXT
    )
}

/// Commands a packet device accepts through the task file.
fn atapi_accepts(cmd: u8) -> bool {
    matches!(
        cmd,
        ATA_CMD_DEVICE_RESET
            | ATA_CMD_EXECUTE_DIAGNOSTIC
            | ATA_CMD_PACKET
            | ATA_CMD_IDENTIFY_PACKET
            | ATA_CMD_STANDBY_IMMEDIATE
            | ATA_CMD_IDLE_IMMEDIATE
            | ATA_CMD_CHECK_POWER_MODE
            | ATA_CMD_SLEEP
            | ATA_CMD_IDENTIFY
            | ATA_CMD_SET_FEATURES
    )
}

fn needs_medium(cmd: u8) -> bool {
    matches!(
        cmd,
        ATA_CMD_DATA_SET_MANAGEMENT
            | ATA_CMD_READ_SECTORS
            | ATA_CMD_READ_SECTORS_NORETRY
            | ATA_CMD_READ_SECTORS_EXT
            | ATA_CMD_READ_DMA_EXT
            | ATA_CMD_READ_NATIVE_MAX_EXT
            | ATA_CMD_READ_MULTIPLE_EXT
            | ATA_CMD_WRITE_SECTORS
            | ATA_CMD_WRITE_SECTORS_NORETRY
            | ATA_CMD_WRITE_SECTORS_EXT
            | ATA_CMD_WRITE_DMA_EXT
            | ATA_CMD_WRITE_MULTIPLE_EXT
            | ATA_CMD_READ_VERIFY
            | ATA_CMD_READ_VERIFY_NORETRY
            | ATA_CMD_READ_VERIFY_EXT
            | ATA_CMD_READ_MULTIPLE
            | ATA_CMD_WRITE_MULTIPLE
            | ATA_CMD_READ_DMA
            | ATA_CMD_READ_DMA_NORETRY
            | ATA_CMD_WRITE_DMA
            | ATA_CMD_WRITE_DMA_NORETRY
            | ATA_CMD_FLUSH_CACHE
            | ATA_CMD_FLUSH_CACHE_EXT
            | ATA_CMD_READ_NATIVE_MAX
    ) && !atapi_accepts(cmd)
}

/// Executes a command written to the command register of device `dev`.
pub(crate) fn execute(queue: &RequestQueue, st: &mut ChannelState, dev: usize, cmd: u8) {
    if !st.devices[dev].is_present() {
        trace!(device = dev, command = cmd, "command to absent device ignored");
        return;
    }
    let busy = st.devices[dev].regs.status.contains(Status::BUSY) || queue.has_pending();
    if cmd != ATA_CMD_DEVICE_RESET && busy {
        let d = &mut st.devices[dev];
        d.stats.dropped_commands += 1;
        if d.stats.log_budget() {
            warn!(device = dev, command = cmd, "command issued while the controller is busy, dropped");
        }
        return;
    }

    let d = &mut st.devices[dev];
    d.regs.command = cmd;
    d.regs.lba48 = is_lba48(cmd);
    d.stats.commands += 1;
    let atapi = d.is_atapi();
    let has_medium = d.has_medium();
    st.clear_irq(dev);
    trace!(device = dev, command = cmd, "ata command");

    if atapi && !atapi_accepts(cmd) {
        st.abort_command(dev);
        return;
    }
    if needs_medium(cmd) && !has_medium {
        debug!(device = dev, command = cmd, "command needs a medium");
        st.abort_command(dev);
        return;
    }

    match cmd {
        0x10..=0x1F
        | ATA_CMD_READ_VERIFY
        | ATA_CMD_READ_VERIFY_NORETRY
        | ATA_CMD_READ_VERIFY_EXT
        | ATA_CMD_SEEK
        | ATA_CMD_STANDBY_IMMEDIATE
        | ATA_CMD_IDLE_IMMEDIATE
        | ATA_CMD_SLEEP => st.complete_ok(dev),

        ATA_CMD_READ_SECTORS | ATA_CMD_READ_SECTORS_NORETRY | ATA_CMD_READ_SECTORS_EXT => {
            sectors(queue, st, dev, Direction::FromDevice, false, false)
        }
        ATA_CMD_READ_MULTIPLE | ATA_CMD_READ_MULTIPLE_EXT => {
            sectors(queue, st, dev, Direction::FromDevice, false, true)
        }
        ATA_CMD_READ_DMA | ATA_CMD_READ_DMA_NORETRY | ATA_CMD_READ_DMA_EXT => {
            sectors(queue, st, dev, Direction::FromDevice, true, false)
        }
        ATA_CMD_WRITE_SECTORS | ATA_CMD_WRITE_SECTORS_NORETRY | ATA_CMD_WRITE_SECTORS_EXT => {
            sectors(queue, st, dev, Direction::ToDevice, false, false)
        }
        ATA_CMD_WRITE_MULTIPLE | ATA_CMD_WRITE_MULTIPLE_EXT => {
            sectors(queue, st, dev, Direction::ToDevice, false, true)
        }
        ATA_CMD_WRITE_DMA | ATA_CMD_WRITE_DMA_NORETRY | ATA_CMD_WRITE_DMA_EXT => {
            sectors(queue, st, dev, Direction::ToDevice, true, false)
        }

        ATA_CMD_READ_NATIVE_MAX | ATA_CMD_READ_NATIVE_MAX_EXT => {
            let d = &mut st.devices[dev];
            let mut max = d.total_sectors.saturating_sub(1);
            if !d.regs.lba48 {
                max = max.min(LBA28_MAX);
            }
            d.set_sector(max);
            st.complete_ok(dev);
        }

        ATA_CMD_DATA_SET_MANAGEMENT => {
            let d = &st.devices[dev];
            if !d.trim_enabled || d.regs.feature != DSM_TRIM {
                st.abort_command(dev);
                return;
            }
            let total = d.sector_count() * SECTOR_SIZE as u32;
            start_transfer(
                queue,
                st,
                NewTransfer {
                    device: dev,
                    total,
                    direction: Direction::ToDevice,
                    begin: BeginStep::ReadWriteSectors,
                    sink: SinkStep::Trim,
                    dma: true,
                    chained: false,
                },
            );
        }

        ATA_CMD_DEVICE_RESET => {
            if !atapi {
                st.abort_command(dev);
                return;
            }
            st.devices[dev].generation += 1;
            st.set_status(dev, Status::BUSY);
            if !queue.push(Request::Abort {
                device: dev,
                reset_drive: true,
            }) {
                warn!(device = dev, "request ring full, device reset dropped");
            }
        }

        ATA_CMD_EXECUTE_DIAGNOSTIC => {
            // An open PIO window or armed DMA on either drive is abandoned.
            for d in st.devices.iter_mut() {
                d.xfer.clear();
            }
            if matches!(st.async_state, AsyncState::Pio | AsyncState::Dma) {
                st.async_state = AsyncState::Idle;
            }
            for d in st.devices.iter_mut().filter(|d| d.is_present()) {
                d.set_signature();
                d.regs.error = 1;
                d.regs.status = d.reset_status();
            }
            st.selected = 0;
            st.raise_irq(0);
        }

        ATA_CMD_INIT_DEVICE_PARAMS => {
            let d = &mut st.devices[dev];
            let heads = (d.regs.select & 0x0F) + 1;
            let sectors = d.regs.nsector;
            if sectors == 0 {
                st.abort_command(dev);
                return;
            }
            let per_cyl = u64::from(heads) * u64::from(sectors);
            let cylinders = (d.total_sectors / per_cyl).clamp(1, u64::from(MAX_CYLINDERS)) as u16;
            d.translated = Geometry {
                cylinders,
                heads,
                sectors,
            };
            debug!(device = dev, cylinders, heads, sectors, "translated geometry set");
            st.complete_ok(dev);
        }

        ATA_CMD_PACKET => {
            if !atapi {
                st.abort_command(dev);
                return;
            }
            st.devices[dev].expect_packet();
            start_transfer(
                queue,
                st,
                NewTransfer {
                    device: dev,
                    total: 12,
                    direction: Direction::ToDevice,
                    begin: BeginStep::AtapiCmd,
                    sink: SinkStep::Packet,
                    dma: false,
                    chained: false,
                },
            );
        }

        ATA_CMD_IDENTIFY_PACKET => {
            if !atapi {
                st.abort_command(dev);
                return;
            }
            identify(queue, st, dev, SinkStep::AtapiIdentify);
        }

        ATA_CMD_IDENTIFY => {
            if atapi {
                st.devices[dev].set_signature();
                st.abort_command(dev);
                return;
            }
            identify(queue, st, dev, SinkStep::Identify);
        }

        ATA_CMD_SET_MULTIPLE => {
            let d = &mut st.devices[dev];
            let count = d.regs.nsector;
            if count != 0 && (!count.is_power_of_two() || count > d.max_mult) {
                st.abort_command(dev);
                return;
            }
            d.mult_sectors = count;
            st.complete_ok(dev);
        }

        ATA_CMD_CHECK_POWER_MODE => {
            st.devices[dev].regs.nsector = 0xFF;
            st.complete_ok(dev);
        }

        ATA_CMD_FLUSH_CACHE | ATA_CMD_FLUSH_CACHE_EXT => flush(queue, st, dev),

        ATA_CMD_SET_FEATURES => set_features(queue, st, dev),

        _ => {
            debug!(device = dev, command = cmd, "unsupported ata command");
            st.abort_command(dev);
        }
    }
}

fn sectors(
    queue: &RequestQueue,
    st: &mut ChannelState,
    dev: usize,
    direction: Direction,
    dma: bool,
    multiple: bool,
) {
    let d = &st.devices[dev];
    if multiple && d.mult_sectors == 0 {
        st.abort_command(dev);
        return;
    }
    let sink = match direction {
        Direction::ToDevice => SinkStep::WriteSectors,
        _ => SinkStep::ReadSectors,
    };
    let total = d.sector_count() * SECTOR_SIZE as u32;
    start_transfer(
        queue,
        st,
        NewTransfer {
            device: dev,
            total,
            direction,
            begin: BeginStep::ReadWriteSectors,
            sink,
            dma,
            chained: false,
        },
    );
}

fn identify(queue: &RequestQueue, st: &mut ChannelState, dev: usize, sink: SinkStep) {
    start_transfer(
        queue,
        st,
        NewTransfer {
            device: dev,
            total: crate::identify::IDENTIFY_LEN as u32,
            direction: Direction::FromDevice,
            begin: BeginStep::None,
            sink,
            dma: false,
            chained: false,
        },
    );
}

fn flush(queue: &RequestQueue, st: &mut ChannelState, dev: usize) {
    start_transfer(
        queue,
        st,
        NewTransfer {
            device: dev,
            total: 0,
            direction: Direction::None,
            begin: BeginStep::None,
            sink: SinkStep::Flush,
            dma: false,
            chained: false,
        },
    );
}

fn set_features(queue: &RequestQueue, st: &mut ChannelState, dev: usize) {
    let feature = st.devices[dev].regs.feature;
    match feature {
        // 8-bit PIO, write cache enable, read look-ahead on/off, reverting to defaults.
        0x02 | 0xAA | 0x55 | 0xCC | 0x66 => st.complete_ok(dev),
        // Write cache disable: make everything cached so far durable.
        0x82 => {
            if st.devices[dev].has_medium() && !st.devices[dev].is_atapi() {
                flush(queue, st, dev);
            } else {
                st.complete_ok(dev);
            }
        }
        0x03 => {
            let requested = st.devices[dev].regs.nsector;
            match select_transfer_mode(requested, st.limits.max_udma) {
                Some(mode) => {
                    debug!(device = dev, mode, "transfer mode selected");
                    st.devices[dev].transfer_mode = mode;
                    st.complete_ok(dev);
                }
                None => st.abort_command(dev),
            }
        }
        _ => {
            debug!(device = dev, feature, "unsupported set features subcommand");
            st.abort_command(dev);
        }
    }
}
