//! PIO data movement through the data register.
//!
//! The emulation path only moves bytes inside the current window; everything that touches the
//! medium happens on the worker in [`continue_pio`].

use tracing::{error, trace, warn};

use crate::channel::{ChannelShared, ChannelState, StateGuard};
use crate::device::{Cursor, TransferContext};
use crate::queue::RequestQueue;
use crate::regs::{Status, ERR_ABRT, IREASON_IO};
use crate::request::{AsyncState, BeginStep, Direction, Request, SinkStep};
use crate::transfer::{chunk_size, run_sink, StepResult};

/// ATAPI byte count used when the guest programs 0 or 0xFFFF.
const ATAPI_DEFAULT_BYTE_COUNT: u32 = 0xFFFE;

/// Opens the next data window starting at `start` and raises DRQ.
pub(crate) fn open_window(st: &mut ChannelState, dev: usize, start: u32, irq: bool) {
    let d = &mut st.devices[dev];
    let x = &d.xfer;
    let avail = match x.direction {
        Direction::FromDevice => x.filled.saturating_sub(start),
        _ => x.capacity.saturating_sub(start),
    };
    let mut len = x.total.min(avail);

    // Byte-count clipping only applies to the data phase of a PACKET command.
    let packet_data = d.is_atapi()
        && matches!(x.begin, BeginStep::AtapiCmd | BeginStep::AtapiPassthrough)
        && x.sink != SinkStep::Packet;
    if d.is_atapi() {
        if packet_data {
            let limit = match u32::from(d.regs.byte_count_limit()) {
                0 | 0xFFFF => ATAPI_DEFAULT_BYTE_COUNT,
                n => n,
            };
            if len > limit {
                len = (limit & !1).max(2);
            }
            d.regs.set_byte_count(len as u16);
            d.regs.set_ireason(if x.direction == Direction::FromDevice {
                IREASON_IO
            } else {
                0
            });
        }
    } else {
        len = len.min(chunk_size(d));
    }

    d.xfer.pio = Cursor::new(start, start + len);
    d.xfer.elementary = len;
    trace!(device = dev, start, len, "pio window");

    let mut bits = Status::DRQ | Status::SEEK;
    if !d.is_atapi() {
        bits |= Status::READY;
    }
    st.status_remove(dev, Status::BUSY);
    st.status_insert(dev, bits);
    if irq {
        st.raise_irq(dev);
    }
}

/// Reads `size` bytes from the open device-to-guest window.
///
/// Returns the little-endian value and whether this access exhausted the window. Bytes past
/// the window read as zero.
pub(crate) fn read_data(x: &mut TransferContext, size: usize) -> (u32, bool) {
    if x.direction != Direction::FromDevice || x.pio.is_exhausted() {
        return (0, false);
    }
    let mut bytes = [0u8; 4];
    let size = size.min(bytes.len());
    let start = x.pio.cur as usize;
    let n = (x.pio.remaining() as usize).min(size);
    if let Some(src) = x.buffer.get(start..start + n) {
        bytes[..n].copy_from_slice(src);
    }
    x.pio.cur += n as u32;
    (u32::from_le_bytes(bytes), x.pio.is_exhausted())
}

/// Writes `size` bytes of `val` into the open guest-to-device window. Bytes past the window
/// are dropped.
pub(crate) fn write_data(x: &mut TransferContext, size: usize, val: u32) -> bool {
    if x.direction != Direction::ToDevice || x.pio.is_exhausted() {
        return false;
    }
    let bytes = val.to_le_bytes();
    let size = size.min(bytes.len());
    let start = x.pio.cur as usize;
    let n = (x.pio.remaining() as usize).min(size);
    if let Some(dst) = x.buffer.get_mut(start..start + n) {
        dst.copy_from_slice(&bytes[..n]);
    }
    x.pio.cur += n as u32;
    x.pio.is_exhausted()
}

/// Called on the emulation path once the guest has consumed the whole window.
pub(crate) fn window_exhausted(queue: &RequestQueue, st: &mut ChannelState, dev: usize) {
    if st.reset {
        return;
    }
    st.status_remove(dev, Status::DRQ);
    let d = &mut st.devices[dev];
    match d.xfer.direction {
        Direction::FromDevice => {
            d.xfer.total = d.xfer.total.saturating_sub(d.xfer.elementary);
            if d.xfer.total == 0 {
                if d.is_atapi() {
                    st.complete_ok(dev);
                } else {
                    d.xfer.clear();
                    st.set_status(dev, Status::READY | Status::SEEK);
                }
                st.async_state = AsyncState::Idle;
                return;
            }
        }
        Direction::ToDevice if d.is_atapi() => {
            d.xfer.total = d.xfer.total.saturating_sub(d.xfer.elementary);
        }
        _ => {}
    }
    st.status_insert(dev, Status::BUSY);
    if !queue.push(Request::ContinuePio) {
        warn!(device = dev, "request ring full, pio continuation dropped");
    }
}

/// Worker side of a PIO transfer: refill or drain the buffer and open the next window.
pub(crate) fn continue_pio<'a>(shared: &'a ChannelShared, mut st: StateGuard<'a>) -> StepResult<'a> {
    let dev = st.async_device;
    let atapi = st.devices[dev].is_atapi();
    match st.devices[dev].xfer.direction {
        Direction::FromDevice => {
            let x = &st.devices[dev].xfer;
            let mut start = x.pio.end;
            if x.pio.end >= x.filled {
                start = 0;
                if x.sink == SinkStep::None {
                    error!(device = dev, total = x.total, "pio read drained without a source");
                    st.complete_error(dev, ERR_ABRT);
                    st.async_state = AsyncState::Idle;
                    return (st, Ok(()));
                }
                let elementary = chunk_size(&st.devices[dev]);
                st.devices[dev].xfer.elementary = elementary;
                let (next, res) = run_sink(shared, st, dev);
                st = next;
                if let Err(e) = res {
                    return (st, Err(e));
                }
                if !st.devices[dev].xfer.active {
                    st.async_state = AsyncState::Idle;
                    return (st, Ok(()));
                }
            }
            open_window(&mut st, dev, start, true);
        }
        Direction::ToDevice if !atapi => {
            let end = st.devices[dev].xfer.pio.end;
            st.devices[dev].xfer.elementary = end;
            let (next, res) = run_sink(shared, st, dev);
            st = next;
            if let Err(e) = res {
                return (st, Err(e));
            }
            let x = &mut st.devices[dev].xfer;
            if !x.active {
                st.async_state = AsyncState::Idle;
                return (st, Ok(()));
            }
            x.total = x.total.saturating_sub(end);
            if x.total == 0 {
                st.complete_ok(dev);
                st.async_state = AsyncState::Idle;
            } else {
                open_window(&mut st, dev, 0, true);
            }
        }
        Direction::ToDevice => {
            let x = &st.devices[dev].xfer;
            if x.total > 0 {
                let start = x.pio.end;
                open_window(&mut st, dev, start, true);
            } else {
                let (next, res) = run_sink(shared, st, dev);
                st = next;
                if let Err(e) = res {
                    return (st, Err(e));
                }
                st.async_state = AsyncState::Idle;
            }
        }
        Direction::None => {
            error!(device = dev, "pio continuation without a transfer direction");
            st.async_state = AsyncState::Idle;
        }
    }
    (st, Ok(()))
}
