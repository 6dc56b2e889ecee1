//! Per-channel I/O worker thread.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, trace, warn};

use crate::channel::{ChannelShared, ChannelState, StateGuard};
use crate::device::Device;
use crate::dma::{enter_dma, run_dma};
use crate::pio::{continue_pio, open_window};
use crate::regs::{Status, IREASON_COD, IREASON_IO};
use crate::request::{AsyncState, Direction, NewTransfer, Request, SinkStep};
use crate::transfer::{run_begin, run_sink, Interrupted, StepResult};

pub(crate) fn spawn(shared: Arc<ChannelShared>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("piix-ide-{}", shared.name))
        .spawn(move || {
            debug!(channel = %shared.name, "ide worker started");
            while let Some(request) = shared.queue.next_request() {
                process(&shared, request);
            }
            debug!(channel = %shared.name, "ide worker stopped");
        })
}

/// Runs one request to its next resting point.
pub(crate) fn process(shared: &ChannelShared, request: Request) {
    let st = shared.lock_state();
    trace!(channel = %shared.name, ?request, state = ?st.async_state, "ide request");
    let (mut st, res) = dispatch(shared, st, request);
    match res {
        Ok(()) => {}
        Err(Interrupted::Cancelled) => {
            debug!(channel = %shared.name, ?request, "request cancelled by reset or media change");
        }
        Err(Interrupted::Redo(err)) => {
            if st.reset {
                debug!(channel = %shared.name, "redo raised during reset, dropped");
                return;
            }
            let dev = st.async_device;
            st.redo.pending = true;
            st.devices[dev].stats.redos += 1;
            warn!(
                channel = %shared.name,
                device = dev,
                error = %err,
                "transient medium error, suspending the request for redo"
            );
            shared.queue.stash_redo(replay_request(&st, request));
            drop(st);
            shared.redo_handler.on_redo(&err);
        }
    }
}

/// The request that resumes the interrupted step: a transfer that already reached its data
/// phase continues from its saved cursors instead of starting over.
pub(crate) fn replay_request(st: &ChannelState, request: Request) -> Request {
    match st.async_state {
        AsyncState::Dma => Request::ContinueDma,
        AsyncState::Pio => Request::ContinuePio,
        _ => request,
    }
}

fn accepts(st: &ChannelState, request: &Request) -> bool {
    if st.redo.pending {
        return true;
    }
    match request {
        Request::New(_) => match st.async_state {
            AsyncState::Idle | AsyncState::Pio => true,
            AsyncState::Dma => !st.bm.is_active(),
            _ => false,
        },
        Request::ContinueDma => st.async_state == AsyncState::Dma,
        Request::ContinuePio => st.async_state == AsyncState::Pio,
        Request::ResetAsserted | Request::ResetCleared | Request::Abort { .. } => true,
    }
}

fn dispatch<'a>(shared: &'a ChannelShared, mut st: StateGuard<'a>, request: Request) -> StepResult<'a> {
    let transfer_request = matches!(
        request,
        Request::New(_) | Request::ContinueDma | Request::ContinuePio
    );
    if transfer_request && (st.reset || st.async_state == AsyncState::Reset) {
        trace!(?request, "transfer request discarded during reset");
        return (st, Ok(()));
    }
    if !accepts(&st, &request) {
        error!(
            channel = %shared.name,
            ?request,
            state = ?st.async_state,
            "request does not match the worker state, dropped"
        );
        return (st, Ok(()));
    }
    st.redo.pending = false;

    match request {
        Request::New(t) => handle_new(shared, st, t),
        Request::ContinueDma => run_dma(shared, st),
        Request::ContinuePio => continue_pio(shared, st),
        Request::ResetAsserted => {
            for d in st.devices.iter_mut() {
                d.xfer.clear();
            }
            st.async_state = AsyncState::Reset;
            (st, Ok(()))
        }
        Request::ResetCleared => {
            reset_cleared(&mut st);
            (st, Ok(()))
        }
        Request::Abort { device, reset_drive } => {
            abort(&mut st, device, reset_drive);
            (st, Ok(()))
        }
    }
}

fn handle_new<'a>(shared: &'a ChannelShared, mut st: StateGuard<'a>, t: NewTransfer) -> StepResult<'a> {
    let dev = t.device;
    let other = 1 - dev;
    if st.async_state == AsyncState::Pio && st.async_device == other {
        st.devices[other].xfer.clear();
    }
    st.async_device = dev;
    st.async_state = AsyncState::Busy;
    st.devices[dev]
        .xfer
        .setup(t.total, t.direction, t.begin, t.sink, t.dma);
    run_begin(&mut st, dev);

    match t.direction {
        Direction::None => {
            let (mut st, res) = run_sink(shared, st, dev);
            if res.is_ok() {
                st.async_state = AsyncState::Idle;
            }
            (st, res)
        }
        Direction::FromDevice => {
            let (mut st, res) = run_sink(shared, st, dev);
            if let Err(e) = res {
                return (st, Err(e));
            }
            if !st.devices[dev].xfer.active {
                st.async_state = AsyncState::Idle;
                return (st, Ok(()));
            }
            if st.devices[dev].xfer.total == 0 {
                st.complete_ok(dev);
                st.async_state = AsyncState::Idle;
                return (st, Ok(()));
            }
            if t.dma {
                return enter_dma(shared, st, dev);
            }
            st.async_state = AsyncState::Pio;
            open_window(&mut st, dev, 0, true);
            (st, Ok(()))
        }
        Direction::ToDevice => {
            if t.dma {
                return enter_dma(shared, st, dev);
            }
            let irq = st.devices[dev].is_atapi() && t.sink != SinkStep::Packet;
            st.async_state = AsyncState::Pio;
            open_window(&mut st, dev, 0, irq);
            (st, Ok(()))
        }
    }
}

fn reset_cleared(st: &mut ChannelState) {
    st.reset = false;
    st.redo = Default::default();
    for d in st.devices.iter_mut() {
        d.xfer.clear();
        reset_drive_registers(d);
        d.irq_pending = false;
    }
    st.selected = 0;
    st.async_state = AsyncState::Idle;
    st.sync_irq();
    debug!("channel reset complete");
}

fn reset_drive_registers(d: &mut Device) {
    d.set_signature();
    d.regs.error = 1;
    d.regs.status = d.reset_status();
}

fn abort(st: &mut ChannelState, dev: usize, reset_drive: bool) {
    st.devices[dev].xfer.clear();
    if st.async_device == dev {
        if st.async_state == AsyncState::Dma {
            st.bm.clear_active();
        }
        if st.async_state != AsyncState::Reset {
            st.async_state = AsyncState::Idle;
        }
    }
    if st.reset {
        return;
    }
    let d = &mut st.devices[dev];
    if reset_drive {
        d.set_signature();
        d.regs.error = 1;
        d.regs.status = Status::empty();
        d.atapi.clear_sense();
        debug!(device = dev, "device reset");
    } else {
        if d.is_atapi() {
            d.regs.set_ireason(IREASON_IO | IREASON_COD);
        }
        st.set_status(dev, Status::READY | Status::SEEK);
        st.raise_irq(dev);
        debug!(device = dev, "command aborted");
    }
}
