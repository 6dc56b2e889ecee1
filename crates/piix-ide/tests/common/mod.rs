#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use memory::{Bus, MemoryBus};
use piix_ide::regs::{
    ATA_CTRL_ALT_STATUS_DEVICE_CTRL, ATA_REG_DATA, ATA_REG_DEVICE, ATA_REG_ERROR_FEATURES,
    ATA_REG_LBA0, ATA_REG_LBA1, ATA_REG_LBA2, ATA_REG_SECTOR_COUNT, ATA_REG_STATUS_COMMAND,
};
use piix_ide::{
    Controller, DriveConfig, IdeConfig, IrqLine, RedoHandler, SharedMemory,
};
use piix_storage::{
    ByteRange, DataForm, HostMedium, MediumError, RamMedium, RegionProperties, ScsiDirection,
    ScsiStatus,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub const PRD_TABLE: u32 = 0x1000;
pub const DMA_BUFFER: u32 = 0x4000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Interrupt line that remembers its level and counts rising edges.
#[derive(Default)]
pub struct TestIrq {
    level: AtomicBool,
    raised: AtomicU32,
}

impl TestIrq {
    pub fn level(&self) -> bool {
        self.level.load(Ordering::SeqCst)
    }

    pub fn raised(&self) -> u32 {
        self.raised.load(Ordering::SeqCst)
    }
}

impl IrqLine for TestIrq {
    fn set_level(&self, level: bool) {
        if level && !self.level.swap(true, Ordering::SeqCst) {
            self.raised.fetch_add(1, Ordering::SeqCst);
        } else if !level {
            self.level.store(false, Ordering::SeqCst);
        }
    }
}

/// Records every redo notification.
#[derive(Default)]
pub struct TestRedo {
    errors: Mutex<Vec<String>>,
}

impl TestRedo {
    pub fn count(&self) -> usize {
        self.errors.lock().unwrap().len()
    }
}

impl RedoHandler for TestRedo {
    fn on_redo(&self, err: &MediumError) {
        self.errors.lock().unwrap().push(err.to_string());
    }
}

/// Disk image whose next `failures` reads or writes report a full host disk.
pub struct FlakyMedium {
    inner: RamMedium,
    healthy: AtomicU32,
    failures: AtomicU32,
    written: AtomicU64,
}

impl FlakyMedium {
    pub fn new(inner: RamMedium, failures: u32) -> Self {
        Self::failing_after(inner, 0, failures)
    }

    /// Lets `healthy` accesses through before the failures start.
    pub fn failing_after(inner: RamMedium, healthy: u32, failures: u32) -> Self {
        Self {
            inner,
            healthy: AtomicU32::new(healthy),
            failures: AtomicU32::new(failures),
            written: AtomicU64::new(0),
        }
    }

    fn fail(&self) -> piix_storage::Result<()> {
        let healthy = self.healthy.load(Ordering::SeqCst);
        if healthy > 0 {
            self.healthy.store(healthy - 1, Ordering::SeqCst);
            return Ok(());
        }
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(MediumError::DiskFull);
        }
        Ok(())
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner.contents()
    }

    /// Bytes that actually reached the image.
    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::SeqCst)
    }
}

impl HostMedium for FlakyMedium {
    fn capacity_bytes(&self) -> u64 {
        self.inner.capacity_bytes()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> piix_storage::Result<()> {
        self.fail()?;
        self.inner.read_at(offset, buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> piix_storage::Result<()> {
        self.fail()?;
        self.inner.write_at(offset, buf)?;
        self.written.fetch_add(buf.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    fn flush(&self) -> piix_storage::Result<()> {
        self.inner.flush()
    }

    fn discard(&self, ranges: &[ByteRange]) -> piix_storage::Result<()> {
        self.inner.discard(ranges)
    }
}

/// One command seen by [`HostDrive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentCommand {
    pub cdb: Vec<u8>,
    pub direction: ScsiDirection,
    pub len: usize,
}

/// Fake host optical drive answering raw SCSI commands.
///
/// READ(10)/(12) fill every sector with its LBA's low byte; INQUIRY reports "HOSTVEND".
pub struct HostDrive {
    pub max_transfer: usize,
    pub block_size: u32,
    pub sent: Mutex<Vec<SentCommand>>,
    pub written: Mutex<Vec<u8>>,
    /// Sense data reported on the next command as CHECK CONDITION.
    pub fail_next: Mutex<Option<(u8, u8, u8)>>,
}

impl HostDrive {
    pub fn new(max_transfer: usize) -> Self {
        Self {
            max_transfer,
            block_size: 2048,
            sent: Mutex::new(Vec::new()),
            written: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
        }
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn sent(&self) -> Vec<SentCommand> {
        self.sent.lock().unwrap().clone()
    }
}

impl HostMedium for HostDrive {
    fn sector_size(&self) -> u32 {
        2048
    }

    fn capacity_bytes(&self) -> u64 {
        1000 * 2048
    }

    fn read_at(&self, _offset: u64, _buf: &mut [u8]) -> piix_storage::Result<()> {
        Err(MediumError::NotSupported("block read on a host drive".to_string()))
    }

    fn write_at(&self, _offset: u64, _buf: &[u8]) -> piix_storage::Result<()> {
        Err(MediumError::NotSupported("block write on a host drive".to_string()))
    }

    fn flush(&self) -> piix_storage::Result<()> {
        Ok(())
    }

    fn is_passthrough(&self) -> bool {
        true
    }

    fn max_scsi_transfer(&self) -> usize {
        self.max_transfer
    }

    fn query_region_properties(&self, region: u32) -> piix_storage::Result<RegionProperties> {
        if region != 0 {
            return Err(MediumError::NotSupported("multiple regions".to_string()));
        }
        Ok(RegionProperties {
            lba_start: 0,
            block_count: 1000,
            block_size: self.block_size,
            data_form: if self.block_size == 2048 {
                DataForm::Mode1Cooked
            } else {
                DataForm::Mode1Raw
            },
        })
    }

    fn send_scsi_cmd(
        &self,
        cdb: &[u8],
        direction: ScsiDirection,
        buf: &mut [u8],
        sense: &mut [u8],
        _timeout: Duration,
    ) -> piix_storage::Result<ScsiStatus> {
        self.sent.lock().unwrap().push(SentCommand {
            cdb: cdb.to_vec(),
            direction,
            len: buf.len(),
        });
        if let Some((key, asc, ascq)) = self.fail_next.lock().unwrap().take() {
            sense.fill(0);
            sense[0] = 0x70;
            sense[2] = key;
            sense[7] = 10;
            sense[12] = asc;
            sense[13] = ascq;
            return Ok(ScsiStatus::CheckCondition);
        }
        match cdb[0] {
            0x12 => {
                buf.fill(0);
                let reply = b"\x05\x80\x00\x21\x1f\x00\x00\x00HOSTVENDHOST CDROM DRIVE1.00";
                let n = reply.len().min(buf.len());
                buf[..n].copy_from_slice(&reply[..n]);
            }
            0x28 | 0xA8 => {
                let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]);
                for (i, sector) in buf.chunks_mut(self.block_size as usize).enumerate() {
                    sector.fill((lba as usize + i) as u8);
                }
            }
            _ => {
                if direction == ScsiDirection::ToDevice {
                    self.written.lock().unwrap().extend_from_slice(buf);
                } else {
                    buf.fill(0);
                }
            }
        }
        Ok(ScsiStatus::Good)
    }
}

/// Polls `cond` until it holds or the timeout expires.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// A primary channel wired to guest memory and recording callbacks.
pub struct Harness {
    pub ctl: Controller,
    pub memory: Arc<Mutex<Bus>>,
    pub irq: Arc<TestIrq>,
    pub redo: Arc<TestRedo>,
}

impl Harness {
    pub fn new(config: &IdeConfig) -> Self {
        init_tracing();
        let memory = Arc::new(Mutex::new(Bus::new(0x4_0000)));
        let shared: SharedMemory = memory.clone();
        let irq = Arc::new(TestIrq::default());
        let redo = Arc::new(TestRedo::default());
        let ctl = Controller::new(config, 0, shared, irq.clone(), redo.clone()).unwrap();
        Self {
            ctl,
            memory,
            irq,
            redo,
        }
    }

    pub fn with_drives(master: Option<DriveConfig>, slave: Option<DriveConfig>) -> Self {
        let mut config = IdeConfig::default();
        config.primary.master = master;
        config.primary.slave = slave;
        Self::new(&config)
    }

    pub fn disk(medium: Arc<dyn HostMedium>) -> Self {
        let h = Self::with_drives(Some(DriveConfig::disk()), None);
        h.ctl.attach_medium(0, medium).unwrap();
        h
    }

    pub fn cdrom(medium: Option<Arc<dyn HostMedium>>) -> Self {
        let h = Self::with_drives(Some(DriveConfig::cdrom()), None);
        if let Some(medium) = medium {
            h.ctl.attach_medium(0, medium).unwrap();
        }
        h
    }

    pub fn wait(&self) {
        assert!(self.ctl.wait_for_idle(TIMEOUT), "worker did not go idle");
    }

    pub fn select(&self, dev: usize) {
        self.ctl
            .write_command(ATA_REG_DEVICE, 1, 0xE0 | (dev as u32) << 4);
    }

    /// Programs an LBA28 address and sector count on the selected device.
    pub fn lba28(&self, lba: u32, count: u8) {
        self.ctl.write_command(ATA_REG_SECTOR_COUNT, 1, u32::from(count));
        self.ctl.write_command(ATA_REG_LBA0, 1, lba & 0xFF);
        self.ctl.write_command(ATA_REG_LBA1, 1, (lba >> 8) & 0xFF);
        self.ctl.write_command(ATA_REG_LBA2, 1, (lba >> 16) & 0xFF);
        let dev = self.ctl.read_command(ATA_REG_DEVICE, 1) & 0x10;
        self.ctl
            .write_command(ATA_REG_DEVICE, 1, 0xE0 | dev | ((lba >> 24) & 0x0F));
    }

    pub fn feature(&self, val: u8) {
        self.ctl.write_command(ATA_REG_ERROR_FEATURES, 1, u32::from(val));
    }

    pub fn command(&self, cmd: u8) {
        self.ctl.write_command(ATA_REG_STATUS_COMMAND, 1, u32::from(cmd));
    }

    /// Issues `cmd` and waits for the worker to settle.
    pub fn run(&self, cmd: u8) {
        self.command(cmd);
        self.wait();
    }

    /// Alternate status, which does not acknowledge the interrupt.
    pub fn alt_status(&self) -> u8 {
        self.ctl.read_control(ATA_CTRL_ALT_STATUS_DEVICE_CTRL, 1) as u8
    }

    pub fn status(&self) -> u8 {
        self.ctl.read_command(ATA_REG_STATUS_COMMAND, 1) as u8
    }

    pub fn error(&self) -> u8 {
        self.ctl.read_command(ATA_REG_ERROR_FEATURES, 1) as u8
    }

    pub fn reg(&self, reg: u16) -> u8 {
        self.ctl.read_command(reg, 1) as u8
    }

    pub fn read_data(&self, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let word = self.ctl.read_command(ATA_REG_DATA, 2) as u16;
            out.extend_from_slice(&word.to_le_bytes());
        }
        out.truncate(len);
        out
    }

    pub fn write_data(&self, data: &[u8]) {
        for chunk in data.chunks(2) {
            let mut word = [0u8; 2];
            word[..chunk.len()].copy_from_slice(chunk);
            self.ctl
                .write_command(ATA_REG_DATA, 2, u32::from(u16::from_le_bytes(word)));
        }
    }

    /// Writes a descriptor table of `(addr, len)` entries at [`PRD_TABLE`].
    pub fn setup_prd(&self, entries: &[(u32, u32)]) {
        let mut mem = self.memory.lock().unwrap();
        for (i, &(addr, len)) in entries.iter().enumerate() {
            let at = u64::from(PRD_TABLE) + i as u64 * 8;
            mem.write_u32(at, addr);
            mem.write_u16(at + 4, (len & 0xFFFF) as u16);
            let eot = if i + 1 == entries.len() { 0x8000 } else { 0 };
            mem.write_u16(at + 6, eot);
        }
        drop(mem);
        self.ctl.write_bus_master(4, 4, PRD_TABLE);
    }

    /// Starts the bus master; `to_memory` for device-to-guest transfers.
    pub fn bm_start(&self, to_memory: bool) {
        let cmd = if to_memory { 0x09 } else { 0x01 };
        self.ctl.write_bus_master(0, 1, cmd);
    }

    pub fn bm_stop(&self) {
        self.ctl.write_bus_master(0, 1, 0);
    }

    pub fn bm_status(&self) -> u8 {
        self.ctl.read_bus_master(2, 1) as u8
    }

    pub fn guest_read(&self, addr: u32, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.memory
            .lock()
            .unwrap()
            .read_physical(u64::from(addr), &mut buf);
        buf
    }

    pub fn guest_write(&self, addr: u32, data: &[u8]) {
        self.memory
            .lock()
            .unwrap()
            .write_physical(u64::from(addr), data);
    }

    /// ATAPI byte count of the open data window.
    pub fn byte_count(&self) -> usize {
        usize::from(self.reg(ATA_REG_LBA1)) | usize::from(self.reg(ATA_REG_LBA2)) << 8
    }

    pub fn ireason(&self) -> u8 {
        self.reg(ATA_REG_SECTOR_COUNT) & 0x07
    }

    /// Sends a PACKET command with `cdb`; `limit` is the byte-count limit.
    pub fn packet(&self, cdb: &[u8], limit: u16, dma: bool) {
        self.feature(u8::from(dma));
        self.ctl.write_command(ATA_REG_LBA1, 1, u32::from(limit & 0xFF));
        self.ctl.write_command(ATA_REG_LBA2, 1, u32::from(limit >> 8));
        self.run(0xA0);
        assert_eq!(self.alt_status() & 0x88, 0x08, "packet phase expected");
        let mut padded = [0u8; 12];
        padded[..cdb.len()].copy_from_slice(cdb);
        self.write_data(&padded);
        self.wait();
    }

    /// Sends a packet and collects every PIO data window until the command completes.
    pub fn packet_in(&self, cdb: &[u8], limit: u16) -> Vec<u8> {
        self.packet(cdb, limit, false);
        let mut out = Vec::new();
        while self.alt_status() & 0x08 != 0 {
            let n = self.byte_count();
            out.extend(self.read_data(n));
            self.wait();
        }
        out
    }

    /// Sends a packet expecting no data and returns the final status.
    pub fn packet_none(&self, cdb: &[u8]) -> u8 {
        self.packet(cdb, 0, false);
        self.status()
    }

    /// REQUEST SENSE: sense key, ASC and ASCQ.
    pub fn sense(&self) -> (u8, u8, u8) {
        let data = self.packet_in(&[0x03, 0, 0, 0, 18], 18);
        (data[2] & 0x0F, data[12], data[13])
    }

    /// Clears the unit attention that follows a medium insertion.
    pub fn clear_unit_attention(&self) {
        self.packet_none(&[0x00]);
        assert_eq!(self.packet_none(&[0x00]), 0x40);
    }
}

/// A disk image whose sector `n` is filled with byte `n`.
pub fn patterned_disk(sectors: u64) -> RamMedium {
    let mut data = vec![0u8; sectors as usize * 512];
    for (i, sector) in data.chunks_mut(512).enumerate() {
        sector.fill(i as u8);
    }
    RamMedium::with_data(data, 512)
}

/// An ISO image whose sector `n` starts with `n` as a big-endian u32, rest filled with `n`.
pub fn patterned_iso(sectors: usize) -> RamMedium {
    let mut data = vec![0u8; sectors * 2048];
    for (i, sector) in data.chunks_mut(2048).enumerate() {
        sector.fill(i as u8);
        sector[..4].copy_from_slice(&(i as u32).to_be_bytes());
    }
    RamMedium::iso(data)
}
