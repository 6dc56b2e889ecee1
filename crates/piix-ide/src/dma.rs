//! Bus-master DMA engine.
//!
//! Walks the guest's physical region descriptor table and copies between guest memory and the
//! device I/O buffer, invoking the source-sink step whenever the buffer window is exhausted.
//! The descriptor position is saved in the redo state so a retried request continues exactly
//! where the failed chunk left off.

use tracing::{error, trace};

use crate::busmaster::PrdCursor;
use crate::channel::{ChannelShared, ChannelState, StateGuard};
use crate::device::Cursor;
use crate::regs::{Status, ERR_ABRT};
use crate::request::{AsyncState, Direction, SinkStep};
use crate::transfer::{chunk_size, run_sink, Interrupted, StepResult};

const DMA_UNIT: u32 = piix_storage::SECTOR_SIZE as u32;

/// Switches the channel into the DMA phase and runs the engine if the guest already started
/// the bus master.
pub(crate) fn enter_dma<'a>(
    shared: &'a ChannelShared,
    mut st: StateGuard<'a>,
    dev: usize,
) -> StepResult<'a> {
    st.async_state = AsyncState::Dma;
    st.set_status(dev, Status::READY | Status::SEEK | Status::DRQ);
    let x = &mut st.devices[dev].xfer;
    x.dma_cursor = match x.direction {
        Direction::FromDevice => Cursor::new(0, x.filled),
        _ => Cursor::new(0, x.total.min(x.capacity_aligned(DMA_UNIT))),
    };
    if st.bm.is_started() {
        st.bm.mark_active();
        run_dma(shared, st)
    } else {
        trace!(device = dev, "dma armed, waiting for bus master start");
        (st, Ok(()))
    }
}

fn fail_dma(st: &mut ChannelState, dev: usize) {
    st.bm.finish_error();
    st.complete_error(dev, ERR_ABRT);
    st.async_state = AsyncState::Idle;
}

/// Runs the sink for the chunk boundary that was just reached. Returns `false` once the
/// command has been finalized by the sink.
fn sink_boundary<'a>(
    shared: &'a ChannelShared,
    st: StateGuard<'a>,
    dev: usize,
    cur: PrdCursor,
) -> (StateGuard<'a>, Result<bool, Interrupted>) {
    let (mut st, res) = run_sink(shared, st, dev);
    if let Err(e) = res {
        if matches!(e, Interrupted::Redo(_)) {
            st.redo.dma = Some(cur);
        }
        return (st, Err(e));
    }
    if !st.devices[dev].xfer.active {
        st.bm.clear_active();
        st.bm.set_irq();
        st.async_state = AsyncState::Idle;
        return (st, Ok(false));
    }
    (st, Ok(true))
}

/// Moves data until the transfer completes, fails, is aborted, or needs a redo.
pub(crate) fn run_dma<'a>(shared: &'a ChannelShared, mut st: StateGuard<'a>) -> StepResult<'a> {
    let dev = st.async_device;
    let memory = st.memory.clone();
    let page_end = st.bm.table_page_end();
    let mut cur = match st.redo.dma.take() {
        Some(cur) => cur,
        None => PrdCursor::start(st.bm.prd_addr()),
    };

    loop {
        let window = st.devices[dev].xfer.dma_cursor;
        if window.is_exhausted() {
            match st.devices[dev].xfer.direction {
                Direction::ToDevice => {
                    if window.end > 0 {
                        st.devices[dev].xfer.elementary = window.end;
                        let (next, res) = sink_boundary(shared, st, dev, cur);
                        st = next;
                        match res {
                            Ok(true) => {}
                            Ok(false) => return (st, Ok(())),
                            Err(e) => return (st, Err(e)),
                        }
                        let x = &mut st.devices[dev].xfer;
                        x.total = x.total.saturating_sub(window.end);
                        x.dma_cursor = Cursor::new(0, x.total.min(x.capacity_aligned(DMA_UNIT)));
                    }
                }
                _ => {
                    let x = &mut st.devices[dev].xfer;
                    if window.end > 0 {
                        x.total = x.total.saturating_sub(window.end);
                        x.dma_cursor = Cursor::default();
                    }
                    if x.total > 0 {
                        if x.sink == SinkStep::None {
                            error!(device = dev, total = x.total, "dma read drained without a source");
                            fail_dma(&mut st, dev);
                            return (st, Ok(()));
                        }
                        let elementary = chunk_size(&st.devices[dev]);
                        st.devices[dev].xfer.elementary = elementary;
                        let (next, res) = sink_boundary(shared, st, dev, cur);
                        st = next;
                        match res {
                            Ok(true) => {}
                            Ok(false) => return (st, Ok(())),
                            Err(e) => return (st, Err(e)),
                        }
                        let x = &mut st.devices[dev].xfer;
                        if x.filled == 0 {
                            error!(device = dev, "dma source produced no data");
                            fail_dma(&mut st, dev);
                            return (st, Ok(()));
                        }
                        x.dma_cursor = Cursor::new(0, x.filled);
                    }
                }
            }
            if st.devices[dev].xfer.total == 0 {
                trace!(device = dev, "dma transfer complete");
                st.bm.finish_success();
                st.complete_ok(dev);
                st.async_state = AsyncState::Idle;
                return (st, Ok(()));
            }
        }

        if !st.bm.is_started() || st.reset {
            trace!(device = dev, "dma aborted by guest");
            st.devices[dev].xfer.clear();
            st.bm.clear_active();
            st.async_state = AsyncState::Idle;
            return (st, Ok(()));
        }

        if cur.left == 0 {
            if cur.last || cur.desc >= page_end {
                if st.log_budget(dev) {
                    error!(
                        device = dev,
                        remaining = st.devices[dev].xfer.total,
                        "descriptor table ended before the transfer"
                    );
                }
                fail_dma(&mut st, dev);
                return (st, Ok(()));
            }
            let mut mem = ChannelState::lock_memory(&memory);
            cur.advance(&mut *mem);
            continue;
        }

        let x = &mut st.devices[dev].xfer;
        let n = cur.left.min(x.dma_cursor.remaining());
        let start = x.dma_cursor.cur as usize;
        let direction = x.direction;
        let Some(chunk) = x.buffer.get_mut(start..start + n as usize) else {
            error!(device = dev, start, len = n, "dma window outside the i/o buffer");
            fail_dma(&mut st, dev);
            return (st, Ok(()));
        };
        {
            let mut mem = ChannelState::lock_memory(&memory);
            if direction == Direction::ToDevice {
                mem.read_physical(u64::from(cur.addr), chunk);
            } else {
                mem.write_physical(u64::from(cur.addr), chunk);
            }
        }
        x.dma_cursor.cur += n;
        cur.addr = cur.addr.wrapping_add(n);
        cur.left -= n;
    }
}
