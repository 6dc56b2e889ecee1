//! Save and restore of a suspended channel.
//!
//! Host media are not part of the snapshot: the embedder re-attaches them before resuming.
//! The I/O buffer is only persisted while a transfer is in flight.

use piix_io_snapshot::io::state::{IoSnapshot, SnapshotError};
use piix_io_snapshot::io::storage::state::{
    IdeAtapiState, IdeChannelState, IdeCursorState, IdeDeviceState, IdeRedoState,
    IdeRegisterFileState, IdeSnapshotFormat, IdeTransferState,
};
use tracing::debug;

use crate::busmaster::PrdCursor;
use crate::channel::ChannelState;
use crate::controller::{Controller, IdeError, Result};
use crate::device::{AtapiState, Cursor, Device, Geometry, MediaEvent, TransferContext};
use crate::regs::{DeviceControl, RegisterFile, Status};
use crate::request::{AsyncState, BeginStep, Direction, NewTransfer, Request, SinkStep};

fn regs_state(r: &RegisterFile) -> IdeRegisterFileState {
    IdeRegisterFileState {
        feature: r.feature,
        hob_feature: r.hob_feature,
        nsector: r.nsector,
        hob_nsector: r.hob_nsector,
        sector: r.sector,
        hob_sector: r.hob_sector,
        lcyl: r.lcyl,
        hob_lcyl: r.hob_lcyl,
        hcyl: r.hcyl,
        hob_hcyl: r.hob_hcyl,
        select: r.select,
        status: r.status.bits(),
        error: r.error,
        command: r.command,
        lba48: r.lba48,
    }
}

fn restore_regs(r: &mut RegisterFile, s: &IdeRegisterFileState) {
    r.feature = s.feature;
    r.hob_feature = s.hob_feature;
    r.nsector = s.nsector;
    r.hob_nsector = s.hob_nsector;
    r.sector = s.sector;
    r.hob_sector = s.hob_sector;
    r.lcyl = s.lcyl;
    r.hob_lcyl = s.hob_lcyl;
    r.hcyl = s.hcyl;
    r.hob_hcyl = s.hob_hcyl;
    r.select = s.select;
    r.status = Status::from_bits_retain(s.status);
    r.error = s.error;
    r.command = s.command;
    r.lba48 = s.lba48;
}

fn cursor_state(c: Cursor) -> IdeCursorState {
    IdeCursorState { cur: c.cur, end: c.end }
}

fn xfer_state(x: &TransferContext) -> IdeTransferState {
    IdeTransferState {
        total: x.total,
        elementary: x.elementary,
        direction: x.direction.to_index(),
        begin_step: x.begin.to_index(),
        sink_step: x.sink.to_index(),
        dma: x.dma,
        pio: cursor_state(x.pio),
        dma_cursor: cursor_state(x.dma_cursor),
        filled: x.filled,
        atapi_lba: x.atapi_lba,
        atapi_sector_size: x.atapi_sector_size,
        cdb: x.cdb,
        buffer: if x.active { x.buffer.clone() } else { Vec::new() },
    }
}

fn restore_xfer(x: &mut TransferContext, s: &IdeTransferState) -> std::result::Result<(), SnapshotError> {
    let direction = Direction::from_index(s.direction)
        .ok_or(SnapshotError::InvalidFieldEncoding("ide transfer direction"))?;
    let begin = BeginStep::from_index(s.begin_step)
        .ok_or(SnapshotError::InvalidFieldEncoding("ide begin step"))?;
    let sink = SinkStep::from_index(s.sink_step)
        .ok_or(SnapshotError::InvalidFieldEncoding("ide sink step"))?;
    if s.buffer.len() > x.buffer.len() {
        return Err(SnapshotError::InvalidFieldEncoding("ide io buffer larger than configured"));
    }
    let window_ok = |c: &IdeCursorState| c.cur <= c.end && c.end <= x.capacity;
    if !window_ok(&s.pio) || !window_ok(&s.dma_cursor) || s.filled > x.capacity {
        return Err(SnapshotError::InvalidFieldEncoding("ide cursor window"));
    }

    x.clear();
    x.buffer[..s.buffer.len()].copy_from_slice(&s.buffer);
    x.total = s.total;
    x.elementary = s.elementary;
    x.direction = direction;
    x.begin = begin;
    x.sink = sink;
    x.dma = s.dma;
    x.active = direction != Direction::None || sink != SinkStep::None || s.total != 0;
    x.pio = Cursor::new(s.pio.cur, s.pio.end);
    x.dma_cursor = Cursor::new(s.dma_cursor.cur, s.dma_cursor.end);
    x.filled = s.filled;
    x.atapi_lba = s.atapi_lba;
    x.atapi_sector_size = s.atapi_sector_size;
    x.cdb = s.cdb;
    Ok(())
}

fn device_state(d: &Device) -> IdeDeviceState {
    let a = &d.atapi;
    IdeDeviceState {
        regs: regs_state(&d.regs),
        xfer: xfer_state(&d.xfer),
        mult_sectors: d.mult_sectors,
        translated_cylinders: d.translated.cylinders,
        translated_heads: d.translated.heads,
        translated_sectors: d.translated.sectors,
        transfer_mode: d.transfer_mode,
        irq_pending: d.irq_pending,
        atapi: IdeAtapiState {
            sense_key: a.sense_key,
            asc: a.asc,
            ascq: a.ascq,
            media_event: a.media_event.to_index(),
            media_present: a.media_present,
            unit_attention: a.unit_attention,
            locked: a.locked,
            tray_open: a.tray_open,
        },
    }
}

fn restore_device(d: &mut Device, s: &IdeDeviceState) -> std::result::Result<(), SnapshotError> {
    restore_xfer(&mut d.xfer, &s.xfer)?;
    restore_regs(&mut d.regs, &s.regs);
    d.mult_sectors = s.mult_sectors.min(d.max_mult);
    // Older snapshots carry no translated geometry; keep the one derived from the medium.
    if s.translated_heads != 0 && s.translated_sectors != 0 {
        d.translated = Geometry {
            cylinders: s.translated_cylinders,
            heads: s.translated_heads,
            sectors: s.translated_sectors,
        };
    }
    d.transfer_mode = s.transfer_mode;
    d.irq_pending = s.irq_pending;
    let a = &s.atapi;
    d.atapi = AtapiState {
        sense_key: a.sense_key,
        asc: a.asc,
        ascq: a.ascq,
        media_event: MediaEvent::from_index(a.media_event),
        media_present: a.media_present,
        unit_attention: a.unit_attention,
        locked: a.locked,
        tray_open: a.tray_open,
    };
    d.generation += 1;
    Ok(())
}

/// Request that resumes an interrupted step after a restore.
fn redo_request(st: &ChannelState) -> Option<Request> {
    let dev = st.async_device;
    let x = &st.devices[dev].xfer;
    match st.async_state {
        AsyncState::Dma => Some(Request::ContinueDma),
        AsyncState::Pio => Some(Request::ContinuePio),
        AsyncState::Busy if x.active => Some(Request::New(NewTransfer {
            device: dev,
            total: x.total,
            direction: x.direction,
            begin: x.begin,
            sink: x.sink,
            dma: x.dma,
            chained: true,
        })),
        _ => None,
    }
}

impl Controller {
    /// Captures the channel state.
    ///
    /// The controller must be suspended with an empty request ring: stop the vCPUs, let the
    /// worker drain with [`Controller::wait_for_idle`], then [`Controller::suspend`].
    pub fn snapshot_state(&self) -> Result<IdeChannelState> {
        if !self.is_suspended() {
            return Err(IdeError::NotSuspended);
        }
        let queued = self.shared().queue.queued();
        if queued > 0 {
            return Err(IdeError::RequestsPending(queued));
        }
        let st = self.shared().lock_state();
        let dma = st.redo.dma;
        Ok(IdeChannelState {
            selected: st.selected as u8,
            async_device: st.async_device as u8,
            async_state: st.async_state.to_index(),
            device_control: st.device_control.bits(),
            reset: st.reset,
            bus_master: st.bm.snapshot_state(),
            redo: IdeRedoState {
                redo: st.redo.pending,
                dma_valid: dma.is_some(),
                dma_desc: dma.map_or(0, |c| c.desc),
                dma_addr: dma.map_or(0, |c| c.addr),
                dma_left: dma.map_or(0, |c| c.left),
                dma_last: dma.is_some_and(|c| c.last),
            },
            devices: [device_state(&st.devices[0]), device_state(&st.devices[1])],
        })
    }

    /// Restores a channel captured by [`Controller::snapshot_state`]. The controller must be
    /// suspended; a pending redo is replayed on the next [`Controller::resume`].
    pub fn restore_state(&self, state: &IdeChannelState) -> Result<()> {
        if !self.is_suspended() {
            return Err(IdeError::NotSuspended);
        }
        let async_state = AsyncState::from_index(state.async_state)
            .ok_or(SnapshotError::InvalidFieldEncoding("ide async state"))?;
        if state.selected > 1 || state.async_device > 1 {
            return Err(SnapshotError::InvalidFieldEncoding("ide device index").into());
        }

        let mut st = self.shared().lock_state();
        for (d, s) in st.devices.iter_mut().zip(state.devices.iter()) {
            restore_device(d, s)?;
        }
        st.selected = usize::from(state.selected);
        st.async_device = usize::from(state.async_device);
        st.async_state = async_state;
        st.device_control = DeviceControl::from_bits_truncate(state.device_control);
        st.reset = state.reset;
        st.bm.restore_state(&state.bus_master);
        st.busy_polls = 0;

        let r = &state.redo;
        st.redo.pending = r.redo;
        st.redo.dma = r.dma_valid.then_some(PrdCursor {
            desc: r.dma_desc,
            addr: r.dma_addr,
            left: r.dma_left,
            last: r.dma_last,
        });

        let queue = &self.shared().queue;
        queue.purge();
        if st.redo.pending {
            match redo_request(&st) {
                Some(request) => queue.stash_redo(request),
                None => st.redo.pending = false,
            }
        }
        st.sync_irq();
        debug!(channel = %self.name(), redo = st.redo.pending, "ide channel restored");
        Ok(())
    }

    /// Encodes the channel state in the current snapshot format.
    pub fn save_state(&self) -> Result<Vec<u8>> {
        Ok(self.snapshot_state()?.save_state())
    }

    /// Encodes the channel state in an older snapshot layout.
    pub fn save_state_as(&self, format: IdeSnapshotFormat) -> Result<Vec<u8>> {
        Ok(self.snapshot_state()?.save_state_as(format))
    }

    /// Decodes and restores a snapshot produced by [`Controller::save_state`].
    pub fn load_state(&self, bytes: &[u8]) -> Result<()> {
        let mut state = IdeChannelState::default();
        state.load_state(bytes)?;
        self.restore_state(&state)
    }
}
