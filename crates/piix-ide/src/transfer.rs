//! Begin/source-sink transfer engine.
//!
//! Every command is described by a begin step (chunk sizing) and a source-sink step (the work
//! done per chunk). Sinks only ever run on the worker thread; medium I/O inside them goes
//! through [`unlocked_io`], which leases the device buffer and drops the controller lock for
//! the duration of the call.

use piix_storage::{ByteRange, HostMedium, MediumError, SECTOR_SIZE};
use tracing::{debug, trace, warn};

use crate::channel::{ChannelShared, ChannelState, StateGuard};
use crate::device::Device;
use crate::identify::{identify_device, identify_packet};
use crate::queue::RequestQueue;
use crate::regs::{Status, ERR_ABRT, ERR_IDNF};
use crate::request::{BeginStep, NewTransfer, Request, SinkStep};
use crate::{atapi, passthrough};

/// Outcome of medium I/O performed with the controller lock released.
#[derive(Debug)]
pub(crate) enum IoError {
    /// Transient host condition; the request must be retried after `resume()`.
    Redo(MediumError),
    /// Permanent failure to be reported to the guest.
    Failed(MediumError),
    /// A reset or media change happened while the call was in flight.
    Cancelled,
}

impl IoError {
    fn classify(err: MediumError) -> Self {
        if err.is_redo() {
            IoError::Redo(err)
        } else if err.is_cancelled() {
            IoError::Cancelled
        } else {
            IoError::Failed(err)
        }
    }
}

/// Why a step stopped before finishing its chunk.
#[derive(Debug)]
pub(crate) enum Interrupted {
    Redo(MediumError),
    Cancelled,
}

pub(crate) type StepResult<'a> = (StateGuard<'a>, Result<(), Interrupted>);

const ATA_READ_MULTIPLE: u8 = 0xC4;
const ATA_WRITE_MULTIPLE: u8 = 0xC5;
const ATA_READ_MULTIPLE_EXT: u8 = 0x29;
const ATA_WRITE_MULTIPLE_EXT: u8 = 0x39;

/// Runs `op` against the device's medium with the controller lock dropped.
///
/// The I/O buffer is moved out of the device for the duration of the call, so the emulation
/// path only ever sees an empty buffer. Errors are classified here, once, after the lock has
/// been reacquired and before any register state is touched.
pub(crate) fn unlocked_io<'a, T>(
    shared: &'a ChannelShared,
    mut st: StateGuard<'a>,
    dev: usize,
    op: impl FnOnce(&dyn HostMedium, &mut [u8]) -> piix_storage::Result<T>,
) -> (StateGuard<'a>, Result<T, IoError>) {
    let Some(medium) = st.devices[dev].medium.clone() else {
        return (st, Err(IoError::Failed(MediumError::NotMounted)));
    };
    let mut buffer = std::mem::take(&mut st.devices[dev].xfer.buffer);
    let generation = st.devices[dev].generation;
    drop(st);

    let result = op(medium.as_ref(), &mut buffer);

    let mut st = shared.lock_state();
    st.devices[dev].xfer.buffer = buffer;
    if st.devices[dev].generation != generation {
        trace!(channel = %shared.name, device = dev, "medium i/o cancelled");
        return (st, Err(IoError::Cancelled));
    }
    (st, result.map_err(IoError::classify))
}

/// Borrows the first `len` bytes of a leased buffer.
pub(crate) fn window(buf: &mut [u8], len: usize) -> piix_storage::Result<&mut [u8]> {
    let capacity = buf.len() as u64;
    buf.get_mut(..len).ok_or(MediumError::OutOfBounds {
        offset: 0,
        len,
        capacity,
    })
}

/// Queues a new transfer for the worker.
///
/// Non-chained commands are only accepted while nothing is queued for the worker; otherwise
/// the guest issued a command while busy and it is dropped.
pub(crate) fn start_transfer(queue: &RequestQueue, st: &mut ChannelState, t: NewTransfer) {
    if st.reset {
        trace!(device = t.device, "transfer issued during reset, ignored");
        return;
    }
    if !t.chained && queue.has_pending() {
        let d = &mut st.devices[t.device];
        d.stats.dropped_commands += 1;
        if d.stats.log_budget() {
            warn!(
                device = t.device,
                command = d.regs.command,
                "command issued while the controller is busy, dropped"
            );
        }
        return;
    }
    st.set_status(t.device, Status::BUSY);
    if !queue.push(Request::New(t)) {
        warn!(device = t.device, "request ring full, new transfer dropped");
    }
}

fn is_multiple_command(command: u8) -> bool {
    matches!(
        command,
        ATA_READ_MULTIPLE | ATA_WRITE_MULTIPLE | ATA_READ_MULTIPLE_EXT | ATA_WRITE_MULTIPLE_EXT
    )
}

/// Size of the next elementary chunk for the device's current transfer.
pub(crate) fn chunk_size(d: &Device) -> u32 {
    let x = &d.xfer;
    match x.begin {
        BeginStep::None => x.total,
        BeginStep::ReadWriteSectors => {
            let sector = SECTOR_SIZE as u32;
            let cap = x.capacity_aligned(sector);
            if x.dma {
                x.total.min(cap)
            } else if is_multiple_command(d.regs.command) {
                x.total
                    .min(u32::from(d.mult_sectors.max(1)) * sector)
                    .min(cap)
            } else {
                x.total.min(sector)
            }
        }
        BeginStep::AtapiCmd | BeginStep::AtapiPassthrough => x.total.min(x.capacity),
    }
}

pub(crate) fn run_begin(st: &mut ChannelState, dev: usize) {
    let d = &mut st.devices[dev];
    d.xfer.elementary = chunk_size(d);
}

/// Maps an [`IoError`] onto a step result; `fail` reports permanent errors to the guest.
pub(crate) fn settle<'a>(
    mut st: StateGuard<'a>,
    err: IoError,
    fail: impl FnOnce(&mut ChannelState, MediumError),
) -> StepResult<'a> {
    match err {
        IoError::Redo(e) => (st, Err(Interrupted::Redo(e))),
        IoError::Cancelled => (st, Err(Interrupted::Cancelled)),
        IoError::Failed(e) => {
            fail(&mut st, e);
            (st, Ok(()))
        }
    }
}

/// Runs the device's current source-sink step.
pub(crate) fn run_sink<'a>(
    shared: &'a ChannelShared,
    mut st: StateGuard<'a>,
    dev: usize,
) -> StepResult<'a> {
    match st.devices[dev].xfer.sink {
        SinkStep::None => (st, Ok(())),
        SinkStep::Identify => {
            let page = identify_device(&st.devices[dev], st.limits.max_udma);
            fill_response(&mut st.devices[dev], &page);
            (st, Ok(()))
        }
        SinkStep::AtapiIdentify => {
            let page = identify_packet(&st.devices[dev], st.limits.max_udma);
            fill_response(&mut st.devices[dev], &page);
            (st, Ok(()))
        }
        SinkStep::ReadSectors => read_sectors(shared, st, dev),
        SinkStep::WriteSectors => write_sectors(shared, st, dev),
        SinkStep::Flush => flush(shared, st, dev),
        SinkStep::Trim => trim(shared, st, dev),
        SinkStep::Packet => atapi::packet(shared, st, dev),
        SinkStep::AtapiResponse => atapi::response(shared, st, dev),
        SinkStep::AtapiRead => atapi::read(shared, st, dev),
        SinkStep::Passthrough => passthrough::execute(shared, st, dev),
    }
}

/// Loads a device-to-guest reply into the buffer and ends the sink chain.
pub(crate) fn fill_response(d: &mut Device, data: &[u8]) {
    let n = data.len().min(d.xfer.buffer.len());
    d.xfer.buffer[..n].copy_from_slice(&data[..n]);
    d.xfer.filled = n as u32;
    d.xfer.total = d.xfer.total.min(n as u32);
    d.xfer.sink = SinkStep::None;
}

fn read_sectors<'a>(shared: &'a ChannelShared, st: StateGuard<'a>, dev: usize) -> StepResult<'a> {
    let d = &st.devices[dev];
    let len = d.xfer.elementary as usize;
    let lba = d.get_sector();
    let last = d.xfer.elementary >= d.xfer.total;
    let offset = lba * SECTOR_SIZE as u64;
    trace!(device = dev, lba, len, "read sectors");

    let (mut st, res) = unlocked_io(shared, st, dev, |m, buf| {
        m.read_at(offset, window(buf, len)?)
    });
    match res {
        Ok(()) => {
            let d = &mut st.devices[dev];
            d.xfer.filled = len as u32;
            d.set_sector(lba + (len / SECTOR_SIZE) as u64);
            d.stats.bytes_read += len as u64;
            if last {
                d.xfer.sink = SinkStep::None;
            }
            (st, Ok(()))
        }
        Err(err) => settle(st, err, |st, e| {
            if st.log_budget(dev) {
                warn!(device = dev, lba, error = %e, "disk read failed");
            }
            st.complete_error(dev, ERR_IDNF);
        }),
    }
}

fn write_sectors<'a>(shared: &'a ChannelShared, st: StateGuard<'a>, dev: usize) -> StepResult<'a> {
    let d = &st.devices[dev];
    let len = d.xfer.elementary as usize;
    let lba = d.get_sector();
    let offset = lba * SECTOR_SIZE as u64;
    trace!(device = dev, lba, len, "write sectors");

    let (mut st, res) = unlocked_io(shared, st, dev, |m, buf| {
        m.write_at(offset, window(buf, len)?)
    });
    match res {
        Ok(()) => {
            let d = &mut st.devices[dev];
            d.set_sector(lba + (len / SECTOR_SIZE) as u64);
            d.stats.bytes_written += len as u64;
            (st, Ok(()))
        }
        Err(err) => settle(st, err, |st, e| {
            if st.log_budget(dev) {
                warn!(device = dev, lba, error = %e, "disk write failed");
            }
            st.complete_error(dev, ERR_IDNF);
        }),
    }
}

fn flush<'a>(shared: &'a ChannelShared, st: StateGuard<'a>, dev: usize) -> StepResult<'a> {
    let (mut st, res) = unlocked_io(shared, st, dev, |m, _| m.flush());
    match res {
        Ok(()) => {
            st.devices[dev].stats.flushes += 1;
            st.complete_ok(dev);
            (st, Ok(()))
        }
        Err(err) => settle(st, err, |st, e| {
            if st.log_budget(dev) {
                warn!(device = dev, error = %e, "flush failed");
            }
            st.complete_error(dev, ERR_ABRT);
        }),
    }
}

/// Decodes DATA SET MANAGEMENT range entries: LBA in bits 0-47, count in bits 48-63.
pub(crate) fn parse_trim_ranges(data: &[u8]) -> Vec<ByteRange> {
    data.chunks_exact(8)
        .filter_map(|entry| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(entry);
            let v = u64::from_le_bytes(raw);
            let lba = v & 0xFFFF_FFFF_FFFF;
            let count = v >> 48;
            (count != 0).then(|| ByteRange {
                offset: lba * SECTOR_SIZE as u64,
                len: count * SECTOR_SIZE as u64,
            })
        })
        .collect()
}

fn trim<'a>(shared: &'a ChannelShared, st: StateGuard<'a>, dev: usize) -> StepResult<'a> {
    let len = st.devices[dev].xfer.elementary as usize;
    let (mut st, res) = unlocked_io(shared, st, dev, |m, buf| {
        let ranges = parse_trim_ranges(window(buf, len)?);
        if ranges.is_empty() {
            return Ok(0);
        }
        m.discard(&ranges)?;
        Ok(ranges.len())
    });
    match res {
        Ok(count) => {
            debug!(device = dev, ranges = count, "trim");
            st.devices[dev].stats.discards += count as u64;
            (st, Ok(()))
        }
        Err(err) => settle(st, err, |st, e| {
            if st.log_budget(dev) {
                warn!(device = dev, error = %e, "trim failed");
            }
            st.complete_error(dev, ERR_ABRT);
        }),
    }
}
