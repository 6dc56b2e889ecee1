use crate::io::state::codec::{Decoder, Encoder};
use crate::io::state::{
    IoSnapshot, SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};

// Hard cap for the per-device I/O buffer when decoding untrusted snapshot bytes.
pub const MAX_IDE_DATA_BUFFER_BYTES: usize = 16 * 1024 * 1024; // 16 MiB

const TAG_CORE: u16 = 1;
const TAG_BUS_MASTER: u16 = 2;
const TAG_REDO: u16 = 3;
const TAG_DEVICE0: u16 = 4;
const TAG_DEVICE1: u16 = 5;

/// Historical layouts of the IDE channel snapshot.
///
/// All versions share device major 1; the minor version picks the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdeSnapshotFormat {
    /// Single PIO/DMA cursor pair, no redo state.
    V1,
    /// Separate DMA cursor, buffer fill level, ATAPI LBA cursor and redo DMA pointers.
    V2,
    /// Translated geometry, transfer mode and ATAPI media-event state.
    V3,
}

impl IdeSnapshotFormat {
    pub const CURRENT: Self = IdeSnapshotFormat::V3;

    pub fn from_version(version: SnapshotVersion) -> SnapshotResult<Self> {
        if version.major != IdeChannelState::DEVICE_VERSION.major {
            return Err(SnapshotError::UnsupportedDeviceMajorVersion {
                found: version.major,
                supported: IdeChannelState::DEVICE_VERSION.major,
            });
        }
        Ok(match version.minor {
            0 => IdeSnapshotFormat::V1,
            1 => IdeSnapshotFormat::V2,
            _ => IdeSnapshotFormat::V3,
        })
    }

    pub fn version(self) -> SnapshotVersion {
        let minor = match self {
            IdeSnapshotFormat::V1 => 0,
            IdeSnapshotFormat::V2 => 1,
            IdeSnapshotFormat::V3 => 2,
        };
        SnapshotVersion::new(IdeChannelState::DEVICE_VERSION.major, minor)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdeRegisterFileState {
    pub feature: u8,
    pub hob_feature: u8,
    pub nsector: u8,
    pub hob_nsector: u8,
    pub sector: u8,
    pub hob_sector: u8,
    pub lcyl: u8,
    pub hob_lcyl: u8,
    pub hcyl: u8,
    pub hob_hcyl: u8,
    pub select: u8,
    pub status: u8,
    pub error: u8,
    pub command: u8,
    pub lba48: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdeCursorState {
    pub cur: u32,
    pub end: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdeTransferState {
    pub total: u32,
    pub elementary: u32,
    pub direction: u8,
    pub begin_step: u8,
    pub sink_step: u8,
    pub dma: bool,
    pub pio: IdeCursorState,
    pub dma_cursor: IdeCursorState,
    pub filled: u32,
    pub atapi_lba: u32,
    pub atapi_sector_size: u32,
    pub cdb: [u8; 12],
    pub buffer: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdeAtapiState {
    pub sense_key: u8,
    pub asc: u8,
    pub ascq: u8,
    pub media_event: u8,
    pub media_present: bool,
    pub unit_attention: bool,
    pub locked: bool,
    pub tray_open: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdeDeviceState {
    pub regs: IdeRegisterFileState,
    pub xfer: IdeTransferState,
    pub mult_sectors: u8,
    pub translated_cylinders: u16,
    pub translated_heads: u8,
    pub translated_sectors: u8,
    pub transfer_mode: u8,
    pub irq_pending: bool,
    pub atapi: IdeAtapiState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdeBusMasterState {
    pub cmd: u8,
    pub status: u8,
    pub prd_addr: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdeRedoState {
    pub redo: bool,
    pub dma_valid: bool,
    pub dma_desc: u32,
    pub dma_addr: u32,
    pub dma_left: u32,
    pub dma_last: bool,
}

/// Persisted state of one IDE channel (controller with two devices).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdeChannelState {
    pub selected: u8,
    pub async_device: u8,
    pub async_state: u8,
    pub device_control: u8,
    pub reset: bool,
    pub bus_master: IdeBusMasterState,
    pub redo: IdeRedoState,
    pub devices: [IdeDeviceState; 2],
}

impl IdeRegisterFileState {
    fn encode(&self, e: Encoder) -> Encoder {
        e.u8(self.feature)
            .u8(self.hob_feature)
            .u8(self.nsector)
            .u8(self.hob_nsector)
            .u8(self.sector)
            .u8(self.hob_sector)
            .u8(self.lcyl)
            .u8(self.hob_lcyl)
            .u8(self.hcyl)
            .u8(self.hob_hcyl)
            .u8(self.select)
            .u8(self.status)
            .u8(self.error)
            .u8(self.command)
            .bool(self.lba48)
    }

    fn decode(d: &mut Decoder<'_>) -> SnapshotResult<Self> {
        Ok(Self {
            feature: d.u8()?,
            hob_feature: d.u8()?,
            nsector: d.u8()?,
            hob_nsector: d.u8()?,
            sector: d.u8()?,
            hob_sector: d.u8()?,
            lcyl: d.u8()?,
            hob_lcyl: d.u8()?,
            hcyl: d.u8()?,
            hob_hcyl: d.u8()?,
            select: d.u8()?,
            status: d.u8()?,
            error: d.u8()?,
            command: d.u8()?,
            lba48: d.bool()?,
        })
    }
}

fn decode_buffer(d: &mut Decoder<'_>) -> SnapshotResult<Vec<u8>> {
    let len = d.u32()? as usize;
    if len > MAX_IDE_DATA_BUFFER_BYTES {
        return Err(SnapshotError::InvalidFieldEncoding("ide io buffer too large"));
    }
    d.bytes_vec(len)
}

fn decode_cursor(d: &mut Decoder<'_>, buffer_len: usize) -> SnapshotResult<IdeCursorState> {
    let cur = d.u32()?;
    let end = d.u32()?;
    if cur > end || end as usize > buffer_len {
        return Err(SnapshotError::InvalidFieldEncoding("ide cursor window"));
    }
    Ok(IdeCursorState { cur, end })
}

fn decode_cdb(d: &mut Decoder<'_>) -> SnapshotResult<[u8; 12]> {
    let mut cdb = [0u8; 12];
    cdb.copy_from_slice(d.bytes(12)?);
    Ok(cdb)
}

impl IdeDeviceState {
    fn encode(&self, format: IdeSnapshotFormat) -> Vec<u8> {
        let x = &self.xfer;
        let mut e = self.regs.encode(Encoder::new());
        e = e
            .u32(x.total)
            .u32(x.elementary)
            .u8(x.direction)
            .u8(x.begin_step)
            .u8(x.sink_step)
            .bool(x.dma)
            .u32(x.buffer.len() as u32)
            .bytes(&x.buffer)
            .u32(x.pio.cur)
            .u32(x.pio.end);
        if format != IdeSnapshotFormat::V1 {
            e = e
                .u32(x.dma_cursor.cur)
                .u32(x.dma_cursor.end)
                .u32(x.filled)
                .u32(x.atapi_lba)
                .u32(x.atapi_sector_size);
        }
        e = e
            .bytes(&x.cdb)
            .u8(self.mult_sectors)
            .bool(self.irq_pending)
            .u8(self.atapi.sense_key)
            .u8(self.atapi.asc)
            .bool(self.atapi.media_present)
            .bool(self.atapi.unit_attention);
        if format == IdeSnapshotFormat::V3 {
            e = e
                .u16(self.translated_cylinders)
                .u8(self.translated_heads)
                .u8(self.translated_sectors)
                .u8(self.transfer_mode)
                .u8(self.atapi.ascq)
                .u8(self.atapi.media_event)
                .bool(self.atapi.locked)
                .bool(self.atapi.tray_open);
        }
        e.finish()
    }

    fn decode_v1(bytes: &[u8]) -> SnapshotResult<Self> {
        let mut d = Decoder::new(bytes);
        let regs = IdeRegisterFileState::decode(&mut d)?;
        let (total, elementary) = (d.u32()?, d.u32()?);
        let (direction, begin_step, sink_step, dma) = (d.u8()?, d.u8()?, d.u8()?, d.bool()?);
        let buffer = decode_buffer(&mut d)?;
        // V1 kept one window for both engines.
        let window = decode_cursor(&mut d, buffer.len())?;
        let cdb = decode_cdb(&mut d)?;
        let mult_sectors = d.u8()?;
        let irq_pending = d.bool()?;
        let atapi = IdeAtapiState {
            sense_key: d.u8()?,
            asc: d.u8()?,
            media_present: d.bool()?,
            unit_attention: d.bool()?,
            ..IdeAtapiState::default()
        };
        d.finish()?;

        Ok(Self {
            regs,
            xfer: IdeTransferState {
                total,
                elementary,
                direction,
                begin_step,
                sink_step,
                dma,
                pio: window,
                dma_cursor: window,
                filled: window.end,
                atapi_lba: 0,
                atapi_sector_size: 0,
                cdb,
                buffer,
            },
            mult_sectors,
            irq_pending,
            atapi,
            ..Self::default()
        })
    }

    fn decode_v2_v3(bytes: &[u8], format: IdeSnapshotFormat) -> SnapshotResult<Self> {
        let mut d = Decoder::new(bytes);
        let regs = IdeRegisterFileState::decode(&mut d)?;
        let (total, elementary) = (d.u32()?, d.u32()?);
        let (direction, begin_step, sink_step, dma) = (d.u8()?, d.u8()?, d.u8()?, d.bool()?);
        let buffer = decode_buffer(&mut d)?;
        let pio = decode_cursor(&mut d, buffer.len())?;
        let dma_cursor = decode_cursor(&mut d, buffer.len())?;
        let filled = d.u32()?;
        if filled as usize > buffer.len() {
            return Err(SnapshotError::InvalidFieldEncoding("ide buffer fill level"));
        }
        let (atapi_lba, atapi_sector_size) = (d.u32()?, d.u32()?);
        let cdb = decode_cdb(&mut d)?;
        let mult_sectors = d.u8()?;
        let irq_pending = d.bool()?;
        let mut atapi = IdeAtapiState {
            sense_key: d.u8()?,
            asc: d.u8()?,
            media_present: d.bool()?,
            unit_attention: d.bool()?,
            ..IdeAtapiState::default()
        };

        let mut state = Self {
            regs,
            xfer: IdeTransferState {
                total,
                elementary,
                direction,
                begin_step,
                sink_step,
                dma,
                pio,
                dma_cursor,
                filled,
                atapi_lba,
                atapi_sector_size,
                cdb,
                buffer,
            },
            mult_sectors,
            irq_pending,
            ..Self::default()
        };

        if format == IdeSnapshotFormat::V3 {
            state.translated_cylinders = d.u16()?;
            state.translated_heads = d.u8()?;
            state.translated_sectors = d.u8()?;
            state.transfer_mode = d.u8()?;
            atapi.ascq = d.u8()?;
            atapi.media_event = d.u8()?;
            atapi.locked = d.bool()?;
            atapi.tray_open = d.bool()?;
        }
        state.atapi = atapi;
        d.finish()?;
        Ok(state)
    }

    fn decode(bytes: &[u8], format: IdeSnapshotFormat) -> SnapshotResult<Self> {
        match format {
            IdeSnapshotFormat::V1 => Self::decode_v1(bytes),
            IdeSnapshotFormat::V2 | IdeSnapshotFormat::V3 => Self::decode_v2_v3(bytes, format),
        }
    }
}

impl IdeChannelState {
    fn encode_core(&self) -> Vec<u8> {
        Encoder::new()
            .u8(self.selected)
            .u8(self.async_device)
            .u8(self.async_state)
            .u8(self.device_control)
            .bool(self.reset)
            .finish()
    }

    fn decode_core(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let mut d = Decoder::new(bytes);
        self.selected = d.u8()?;
        self.async_device = d.u8()?;
        self.async_state = d.u8()?;
        self.device_control = d.u8()?;
        self.reset = d.bool()?;
        d.finish()?;
        if self.selected > 1 || self.async_device > 1 {
            return Err(SnapshotError::InvalidFieldEncoding("ide device index"));
        }
        Ok(())
    }

    fn encode_bus_master(&self) -> Vec<u8> {
        Encoder::new()
            .u8(self.bus_master.cmd)
            .u8(self.bus_master.status)
            .u32(self.bus_master.prd_addr)
            .finish()
    }

    fn decode_bus_master(bytes: &[u8]) -> SnapshotResult<IdeBusMasterState> {
        let mut d = Decoder::new(bytes);
        let bm = IdeBusMasterState {
            cmd: d.u8()?,
            status: d.u8()?,
            prd_addr: d.u32()?,
        };
        d.finish()?;
        Ok(bm)
    }

    fn encode_redo(&self) -> Vec<u8> {
        let r = &self.redo;
        Encoder::new()
            .bool(r.redo)
            .bool(r.dma_valid)
            .u32(r.dma_desc)
            .u32(r.dma_addr)
            .u32(r.dma_left)
            .bool(r.dma_last)
            .finish()
    }

    fn decode_redo(bytes: &[u8]) -> SnapshotResult<IdeRedoState> {
        let mut d = Decoder::new(bytes);
        let redo = IdeRedoState {
            redo: d.bool()?,
            dma_valid: d.bool()?,
            dma_desc: d.u32()?,
            dma_addr: d.u32()?,
            dma_left: d.u32()?,
            dma_last: d.bool()?,
        };
        d.finish()?;
        Ok(redo)
    }

    /// Encodes the state in a specific historical layout.
    pub fn save_state_as(&self, format: IdeSnapshotFormat) -> Vec<u8> {
        let mut w = SnapshotWriter::new(Self::DEVICE_ID, format.version());
        w.field_bytes(TAG_CORE, self.encode_core());
        w.field_bytes(TAG_BUS_MASTER, self.encode_bus_master());
        if format != IdeSnapshotFormat::V1 {
            w.field_bytes(TAG_REDO, self.encode_redo());
        }
        w.field_bytes(TAG_DEVICE0, self.devices[0].encode(format));
        w.field_bytes(TAG_DEVICE1, self.devices[1].encode(format));
        w.finish()
    }
}

impl IoSnapshot for IdeChannelState {
    const DEVICE_ID: [u8; 4] = *b"IDEC";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 2);

    fn save_state(&self) -> Vec<u8> {
        self.save_state_as(IdeSnapshotFormat::CURRENT)
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;
        let format = IdeSnapshotFormat::from_version(r.device_version())?;

        let mut state = IdeChannelState::default();
        if let Some(buf) = r.bytes(TAG_CORE) {
            state.decode_core(buf)?;
        }
        if let Some(buf) = r.bytes(TAG_BUS_MASTER) {
            state.bus_master = Self::decode_bus_master(buf)?;
        }
        if format != IdeSnapshotFormat::V1 {
            if let Some(buf) = r.bytes(TAG_REDO) {
                state.redo = Self::decode_redo(buf)?;
            }
        }
        for (slot, tag) in [TAG_DEVICE0, TAG_DEVICE1].into_iter().enumerate() {
            if let Some(buf) = r.bytes(tag) {
                state.devices[slot] = IdeDeviceState::decode(buf, format)?;
            }
        }

        *self = state;
        Ok(())
    }
}
