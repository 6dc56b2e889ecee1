use std::sync::Arc;

use piix_storage::{HostMedium, CD_SECTOR_SIZE, SECTOR_SIZE};

use crate::config::{DriveConfig, DriveKind, InquiryConfig};
use crate::regs::{RegisterFile, Status, IREASON_COD};
use crate::request::{BeginStep, Direction, SinkStep};
use crate::stats::Stats;
use crate::tracklist::TrackList;

/// Transfer mode groups (SET FEATURES subcommand 0x03).
pub const MODE_PIO: u8 = 0x00;
pub const MODE_MDMA: u8 = 0x20;
pub const MODE_UDMA: u8 = 0x40;

/// Largest CHS cylinder count reported to the guest.
pub const MAX_CYLINDERS: u16 = 16383;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceKind {
    #[default]
    None,
    Disk,
    Cdrom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors: u8,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            cylinders: 0,
            heads: 16,
            sectors: 63,
        }
    }
}

impl Geometry {
    /// Derives a 16-head, 63-sector geometry from a capacity in sectors.
    pub fn from_total_sectors(total: u64) -> Self {
        let cylinders = (total / (16 * 63)).min(u64::from(MAX_CYLINDERS)) as u16;
        Self {
            cylinders: cylinders.max(1),
            heads: 16,
            sectors: 63,
        }
    }

    pub fn total_sectors(&self) -> u64 {
        u64::from(self.cylinders) * u64::from(self.heads) * u64::from(self.sectors)
    }
}

/// Half-open byte window `[cur, end)` into the I/O buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursor {
    pub cur: u32,
    pub end: u32,
}

impl Cursor {
    pub fn new(cur: u32, end: u32) -> Self {
        Self { cur, end }
    }

    pub fn remaining(&self) -> u32 {
        self.end.saturating_sub(self.cur)
    }

    pub fn is_exhausted(&self) -> bool {
        self.cur >= self.end
    }
}

/// Bookkeeping of the transfer in flight on one device.
#[derive(Debug, Clone, Default)]
pub struct TransferContext {
    /// Leased to the worker (and therefore empty) while medium I/O runs.
    pub buffer: Vec<u8>,
    pub capacity: u32,
    /// Bytes still to move between guest and device, including the current window.
    pub total: u32,
    /// Length of the current chunk.
    pub elementary: u32,
    pub direction: Direction,
    pub begin: BeginStep,
    pub sink: SinkStep,
    pub dma: bool,
    pub active: bool,
    pub pio: Cursor,
    pub dma_cursor: Cursor,
    /// Valid bytes in the buffer for device-to-guest transfers.
    pub filled: u32,
    pub cdb: [u8; 12],
    pub atapi_lba: u32,
    pub atapi_sector_size: u32,
}

impl TransferContext {
    /// Allocates a zeroed I/O buffer, returning `None` if the allocation fails.
    pub fn try_with_capacity(capacity: usize) -> Option<Self> {
        let buffer = try_alloc_zeroed(capacity)?;
        Some(Self {
            buffer,
            capacity: u32::try_from(capacity).ok()?,
            ..Self::default()
        })
    }

    /// Prepares a new transfer. The CDB and ATAPI read cursor survive, the packet sink
    /// stores them before chaining the data phase.
    pub fn setup(
        &mut self,
        total: u32,
        direction: Direction,
        begin: BeginStep,
        sink: SinkStep,
        dma: bool,
    ) {
        self.total = total;
        self.elementary = 0;
        self.direction = direction;
        self.begin = begin;
        self.sink = sink;
        self.dma = dma;
        self.active = true;
        self.pio = Cursor::default();
        self.dma_cursor = Cursor::default();
        self.filled = 0;
    }

    pub fn clear(&mut self) {
        self.total = 0;
        self.elementary = 0;
        self.direction = Direction::None;
        self.begin = BeginStep::None;
        self.sink = SinkStep::None;
        self.dma = false;
        self.active = false;
        self.pio = Cursor::default();
        self.dma_cursor = Cursor::default();
        self.filled = 0;
    }

    /// Capacity rounded down to a whole number of `unit` sized blocks.
    pub fn capacity_aligned(&self, unit: u32) -> u32 {
        if unit == 0 {
            return self.capacity;
        }
        (self.capacity / unit) * unit
    }
}

/// ATAPI sense, media-event and tray state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AtapiState {
    pub sense_key: u8,
    pub asc: u8,
    pub ascq: u8,
    pub media_event: MediaEvent,
    pub media_present: bool,
    pub unit_attention: bool,
    pub locked: bool,
    pub tray_open: bool,
}

impl AtapiState {
    pub fn set_sense(&mut self, key: u8, asc: u8, ascq: u8) {
        self.sense_key = key;
        self.asc = asc;
        self.ascq = ascq;
    }

    pub fn clear_sense(&mut self) {
        self.set_sense(0, 0, 0);
    }

    pub fn has_sense(&self) -> bool {
        self.sense_key != 0 || self.asc != 0
    }
}

/// Pending GET EVENT STATUS NOTIFICATION media event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaEvent {
    #[default]
    None,
    NewMedia,
    MediaRemoval,
    EjectRequest,
}

impl MediaEvent {
    pub fn to_index(self) -> u8 {
        match self {
            MediaEvent::None => 0,
            MediaEvent::NewMedia => 1,
            MediaEvent::MediaRemoval => 2,
            MediaEvent::EjectRequest => 3,
        }
    }

    pub fn from_index(index: u8) -> Self {
        match index {
            1 => MediaEvent::NewMedia,
            2 => MediaEvent::MediaRemoval,
            3 => MediaEvent::EjectRequest,
            _ => MediaEvent::None,
        }
    }
}

/// Identification strings reported by IDENTIFY and INQUIRY.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identity {
    pub serial: String,
    pub firmware: String,
    pub model: String,
}

/// One ATA or ATAPI drive position on a channel.
#[derive(Default)]
pub struct Device {
    pub index: usize,
    pub kind: DeviceKind,
    pub regs: RegisterFile,
    pub xfer: TransferContext,
    pub stats: Stats,
    pub medium: Option<Arc<dyn HostMedium>>,
    pub physical: Geometry,
    pub translated: Geometry,
    /// Geometry forced by configuration instead of derived from capacity.
    pub fixed_geometry: Option<Geometry>,
    pub total_sectors: u64,
    pub sector_size: u32,
    pub mult_sectors: u8,
    pub max_mult: u8,
    pub transfer_mode: u8,
    pub identity: Identity,
    pub atapi: AtapiState,
    pub irq_pending: bool,
    pub trim_enabled: bool,
    pub non_rotational: bool,
    /// Bumped whenever in-flight medium I/O must be treated as cancelled.
    pub generation: u64,
    pub tracks: Option<TrackList>,
    pub inquiry: Option<InquiryConfig>,
    pub passthrough: bool,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("index", &self.index)
            .field("kind", &self.kind)
            .field("regs", &self.regs)
            .field("total_sectors", &self.total_sectors)
            .field("has_medium", &self.medium.is_some())
            .finish_non_exhaustive()
    }
}

impl Device {
    pub fn absent(index: usize) -> Self {
        Self {
            index,
            ..Self::default()
        }
    }

    /// Builds a drive from its configuration. The I/O buffer is installed separately.
    pub fn from_config(index: usize, config: &DriveConfig, max_mult: u8, default_mode: u8) -> Self {
        let kind = match config.kind {
            DriveKind::Disk => DeviceKind::Disk,
            DriveKind::Cdrom => DeviceKind::Cdrom,
        };
        let mut dev = Self {
            index,
            kind,
            fixed_geometry: config.geometry.map(|g| Geometry {
                cylinders: g.cylinders,
                heads: g.heads,
                sectors: g.sectors,
            }),
            sector_size: match kind {
                DeviceKind::Cdrom => CD_SECTOR_SIZE as u32,
                _ => SECTOR_SIZE as u32,
            },
            max_mult,
            transfer_mode: default_mode,
            identity: Identity {
                serial: config.serial.clone(),
                firmware: config.firmware.clone(),
                model: config.model.clone(),
            },
            trim_enabled: config.trim,
            non_rotational: config.non_rotational,
            inquiry: config.inquiry.clone().filter(|i| !i.is_empty()),
            ..Self::default()
        };
        dev.update_geometry();
        dev.set_signature();
        dev.regs.error = 1;
        dev.regs.status = dev.reset_status();
        dev
    }

    pub fn is_present(&self) -> bool {
        self.kind != DeviceKind::None
    }

    pub fn is_atapi(&self) -> bool {
        self.kind == DeviceKind::Cdrom
    }

    pub fn has_medium(&self) -> bool {
        self.medium.is_some()
    }

    /// Installs a medium (or removes it with `None`) and recomputes capacity and geometry.
    pub fn set_medium(&mut self, medium: Option<Arc<dyn HostMedium>>) {
        self.passthrough = medium.as_ref().is_some_and(|m| m.is_passthrough());
        self.medium = medium;
        self.update_geometry();
    }

    fn update_geometry(&mut self) {
        self.total_sectors = match &self.medium {
            Some(m) => m.capacity_bytes() / u64::from(self.sector_size.max(1)),
            None => 0,
        };
        self.physical = self
            .fixed_geometry
            .unwrap_or_else(|| Geometry::from_total_sectors(self.total_sectors));
        self.translated = self.physical;
    }

    /// Status after power-on, reset or diagnostics.
    pub fn reset_status(&self) -> Status {
        match self.kind {
            DeviceKind::Disk => Status::READY | Status::SEEK,
            _ => Status::empty(),
        }
    }

    /// Loads the device signature into the task file.
    pub fn set_signature(&mut self) {
        self.regs.select &= 0xF0;
        self.regs.nsector = 1;
        self.regs.sector = 1;
        match self.kind {
            DeviceKind::Cdrom => {
                self.regs.lcyl = 0x14;
                self.regs.hcyl = 0xEB;
            }
            DeviceKind::Disk if self.has_medium() => {
                self.regs.lcyl = 0;
                self.regs.hcyl = 0;
            }
            _ => {
                self.regs.lcyl = 0xFF;
                self.regs.hcyl = 0xFF;
            }
        }
    }

    /// Current LBA (or CHS translated to LBA) from the task file.
    pub fn get_sector(&self) -> u64 {
        let r = &self.regs;
        if r.lba_mode() {
            if r.lba48 {
                u64::from(r.hob_hcyl) << 40
                    | u64::from(r.hob_lcyl) << 32
                    | u64::from(r.hob_sector) << 24
                    | u64::from(r.hcyl) << 16
                    | u64::from(r.lcyl) << 8
                    | u64::from(r.sector)
            } else {
                u64::from(r.head()) << 24
                    | u64::from(r.hcyl) << 16
                    | u64::from(r.lcyl) << 8
                    | u64::from(r.sector)
            }
        } else {
            let g = self.translated;
            let cyl = u64::from(u16::from_le_bytes([r.lcyl, r.hcyl]));
            cyl * u64::from(g.heads) * u64::from(g.sectors)
                + u64::from(r.head()) * u64::from(g.sectors)
                + u64::from(r.sector).saturating_sub(1)
        }
    }

    pub fn set_sector(&mut self, lba: u64) {
        let g = self.translated;
        let r = &mut self.regs;
        if r.lba_mode() {
            if r.lba48 {
                r.hob_hcyl = (lba >> 40) as u8;
                r.hob_lcyl = (lba >> 32) as u8;
                r.hob_sector = (lba >> 24) as u8;
            } else {
                r.select = (r.select & 0xF0) | ((lba >> 24) & 0x0F) as u8;
            }
            r.hcyl = (lba >> 16) as u8;
            r.lcyl = (lba >> 8) as u8;
            r.sector = lba as u8;
        } else {
            let per_cyl = u64::from(g.heads.max(1)) * u64::from(g.sectors.max(1));
            let cyl = lba / per_cyl;
            let rem = lba % per_cyl;
            let [lo, hi] = (cyl as u16).to_le_bytes();
            r.lcyl = lo;
            r.hcyl = hi;
            r.select = (r.select & 0xF0) | ((rem / u64::from(g.sectors.max(1))) & 0x0F) as u8;
            r.sector = (rem % u64::from(g.sectors.max(1)) + 1) as u8;
        }
    }

    /// Requested sector count: 0 means 256 (LBA28/CHS) or 65536 (LBA48).
    pub fn sector_count(&self) -> u32 {
        let r = &self.regs;
        if r.lba48 {
            match u16::from_le_bytes([r.nsector, r.hob_nsector]) {
                0 => 65536,
                n => u32::from(n),
            }
        } else {
            match r.nsector {
                0 => 256,
                n => u32::from(n),
            }
        }
    }

    /// Puts an ATAPI device's interrupt reason into the "command packet expected" phase.
    pub fn expect_packet(&mut self) {
        self.regs.set_ireason(IREASON_COD);
    }
}

pub(crate) fn try_alloc_zeroed(len: usize) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).ok()?;
    buf.resize(len, 0);
    Some(buf)
}

/// Builds a transfer mode byte reported by IDENTIFY words 63 and 88.
///
/// The low byte lists supported modes up to `max`; the high byte marks `current` when it
/// belongs to the same group as `this`.
pub fn transfer_id(this: u8, max: u8, current: u8) -> u16 {
    let supported = (1u16 << (max + 1)) - 1;
    let selected = if (this ^ current) & 0xF8 == 0 {
        1u16 << ((current & 7) + 8)
    } else {
        0
    };
    supported | selected
}
