#![allow(dead_code)]

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use memory::{Bus, MemoryBus};
use piix_ide::{IdeConfig, IrqLine, PiixIde, RedoHandler, PRIMARY_PORTS, SECONDARY_PORTS};
use piix_storage::{FileMedium, HostMedium, MediumError};
use tempfile::TempDir;

pub const TIMEOUT: Duration = Duration::from_secs(5);
pub const GUEST_RAM: usize = 0x10_0000;
pub const PRD_TABLE: u32 = 0x8000;

const REG_DATA: u16 = 0;
const REG_FEATURES: u16 = 1;
const REG_NSECTOR: u16 = 2;
const REG_LBA0: u16 = 3;
const REG_LBA1: u16 = 4;
const REG_LBA2: u16 = 5;
const REG_DEVICE: u16 = 6;
const REG_STATUS: u16 = 7;

const STATUS_BSY: u8 = 0x80;
const STATUS_DRQ: u8 = 0x08;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Edge-counting interrupt line as wired to the PIC.
#[derive(Default)]
pub struct Line {
    level: AtomicBool,
    edges: AtomicU32,
}

impl Line {
    pub fn level(&self) -> bool {
        self.level.load(Ordering::SeqCst)
    }

    pub fn edges(&self) -> u32 {
        self.edges.load(Ordering::SeqCst)
    }
}

impl IrqLine for Line {
    fn set_level(&self, level: bool) {
        if self.level.swap(level, Ordering::SeqCst) != level && level {
            self.edges.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[derive(Default)]
pub struct RedoLog(Mutex<Vec<String>>);

impl RedoHandler for RedoLog {
    fn on_redo(&self, err: &MediumError) {
        tracing::warn!(%err, "host medium asked for a redo");
        self.0.lock().unwrap().push(err.to_string());
    }
}

/// A PIIX IDE function plugged into guest RAM, with disk images living in a scratch dir.
pub struct Machine {
    pub ide: PiixIde,
    pub ram: Arc<Mutex<Bus>>,
    pub irqs: [Arc<Line>; 2],
    pub redo: Arc<RedoLog>,
    dir: Arc<TempDir>,
}

impl Machine {
    /// Builds a machine from a JSON controller description.
    pub fn from_json(json: &str) -> Result<Self> {
        init_tracing();
        let config = IdeConfig::parse_str(json).context("parse ide config")?;
        let dir = tempfile::tempdir().context("create scratch dir")?;
        Self::with_dir(&config, Arc::new(dir))
    }

    fn with_dir(config: &IdeConfig, dir: Arc<TempDir>) -> Result<Self> {
        let ram = Arc::new(Mutex::new(Bus::new(GUEST_RAM)));
        let irqs = [Arc::new(Line::default()), Arc::new(Line::default())];
        let redo = Arc::new(RedoLog::default());
        let ide = PiixIde::new(
            config,
            ram.clone(),
            [irqs[0].clone(), irqs[1].clone()],
            redo.clone(),
        )
        .context("create piix ide")?;
        Ok(Self {
            ide,
            ram,
            irqs,
            redo,
            dir,
        })
    }

    /// Builds a second machine from `json` whose images live next to this machine's.
    pub fn sibling(&self, json: &str) -> Result<Self> {
        let config = IdeConfig::parse_str(json).context("parse ide config")?;
        Self::with_dir(&config, Arc::clone(&self.dir))
    }

    pub fn image_path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Writes `contents` as image `name` and returns it opened read/write.
    pub fn create_image(&self, name: &str, contents: &[u8]) -> Result<FileMedium> {
        let path = self.image_path(name);
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        open_image(&path, false)
    }

    pub fn attach(&self, channel: usize, dev: usize, medium: Arc<dyn HostMedium>) -> Result<()> {
        self.ide.channel(channel)?.attach_medium(dev, medium)?;
        Ok(())
    }

    pub fn settle(&self) -> Result<()> {
        if !self.ide.wait_for_idle(TIMEOUT) {
            bail!("ide channels did not go idle");
        }
        Ok(())
    }

    pub fn guest(&self, channel: usize) -> Guest<'_> {
        let ports = if channel == 0 {
            PRIMARY_PORTS
        } else {
            SECONDARY_PORTS
        };
        Guest {
            machine: self,
            channel,
            cmd: ports.cmd_base,
            ctrl: ports.ctrl_base,
        }
    }

    pub fn ram_write(&self, addr: u32, data: &[u8]) {
        self.ram
            .lock()
            .unwrap()
            .write_physical(u64::from(addr), data);
    }

    pub fn ram_read(&self, addr: u32, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.ram
            .lock()
            .unwrap()
            .read_physical(u64::from(addr), &mut buf);
        buf
    }
}

pub fn open_image(path: &Path, read_only: bool) -> Result<FileMedium> {
    let file = OpenOptions::new()
        .read(true)
        .write(!read_only)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    Ok(FileMedium::from_file(file)?.read_only(read_only))
}

/// A guest driver talking to one channel through port I/O only.
pub struct Guest<'a> {
    machine: &'a Machine,
    channel: usize,
    cmd: u16,
    ctrl: u16,
}

impl Guest<'_> {
    pub fn inb(&self, reg: u16) -> u8 {
        self.machine.ide.io_read(self.cmd + reg, 1) as u8
    }

    pub fn outb(&self, reg: u16, val: u8) {
        self.machine.ide.io_write(self.cmd + reg, 1, u32::from(val));
    }

    pub fn status(&self) -> u8 {
        self.inb(REG_STATUS)
    }

    pub fn alt_status(&self) -> u8 {
        self.machine.ide.io_read(self.ctrl, 1) as u8
    }

    pub fn error(&self) -> u8 {
        self.inb(REG_FEATURES)
    }

    pub fn device_control(&self, val: u8) {
        self.machine.ide.io_write(self.ctrl, 1, u32::from(val));
    }

    pub fn irq(&self) -> bool {
        self.machine.irqs[self.channel].level()
    }

    pub fn select(&self, dev: u8) {
        self.outb(REG_DEVICE, 0xE0 | dev << 4);
    }

    /// Pulses SRST and waits for the drives to come back.
    pub fn reset(&self) -> Result<()> {
        self.device_control(0x04);
        self.device_control(0x00);
        self.machine.settle()
    }

    pub fn signature(&self) -> [u8; 4] {
        [
            self.inb(REG_NSECTOR),
            self.inb(REG_LBA0),
            self.inb(REG_LBA1),
            self.inb(REG_LBA2),
        ]
    }

    pub fn lba28(&self, lba: u32, count: u8) {
        let dev = self.inb(REG_DEVICE) & 0x10;
        self.outb(REG_NSECTOR, count);
        self.outb(REG_LBA0, lba as u8);
        self.outb(REG_LBA1, (lba >> 8) as u8);
        self.outb(REG_LBA2, (lba >> 16) as u8);
        self.outb(REG_DEVICE, 0xE0 | dev | ((lba >> 24) & 0x0F) as u8);
    }

    pub fn command(&self, cmd: u8) -> Result<()> {
        self.outb(REG_STATUS, cmd);
        self.machine.settle()
    }

    /// Waits for DRQ the way a polling driver does and reads `len` bytes as 16-bit words.
    pub fn read_pio(&self, len: usize) -> Result<Vec<u8>> {
        let status = self.alt_status();
        if status & (STATUS_BSY | STATUS_DRQ) != STATUS_DRQ {
            bail!("no data window open (status {status:#04x})");
        }
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let word = self.machine.ide.io_read(self.cmd + REG_DATA, 2) as u16;
            out.extend_from_slice(&word.to_le_bytes());
        }
        out.truncate(len);
        self.machine.settle()?;
        Ok(out)
    }

    pub fn write_pio(&self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(2) {
            let mut word = [0u8; 2];
            word[..chunk.len()].copy_from_slice(chunk);
            self.machine
                .ide
                .io_write(self.cmd + REG_DATA, 2, u32::from(u16::from_le_bytes(word)));
        }
        self.machine.settle()
    }

    /// Issues PACKET with `cdb` and drains every PIO data window.
    pub fn packet_in(&self, cdb: &[u8], limit: u16) -> Result<Vec<u8>> {
        self.outb(REG_FEATURES, 0);
        self.outb(REG_LBA1, limit as u8);
        self.outb(REG_LBA2, (limit >> 8) as u8);
        self.command(0xA0)?;
        if self.alt_status() & STATUS_DRQ == 0 {
            return Err(anyhow!("drive did not ask for the packet"));
        }
        let mut padded = [0u8; 12];
        padded[..cdb.len()].copy_from_slice(cdb);
        self.write_pio(&padded)?;

        let mut out = Vec::new();
        while self.alt_status() & STATUS_DRQ != 0 {
            let n = usize::from(self.inb(REG_LBA1)) | usize::from(self.inb(REG_LBA2)) << 8;
            out.extend(self.read_pio(n)?);
        }
        Ok(out)
    }

    fn bm_port(&self, offset: u16) -> u16 {
        self.machine.ide.bus_master_base() + self.channel as u16 * 8 + offset
    }

    /// Writes a single-entry descriptor table and points the engine at it.
    pub fn setup_dma(&self, buffer: u32, len: u16) {
        let table = PRD_TABLE + self.channel as u32 * 0x100;
        {
            let mut ram = self.machine.ram.lock().unwrap();
            ram.write_u32(u64::from(table), buffer);
            ram.write_u16(u64::from(table) + 4, len);
            ram.write_u16(u64::from(table) + 6, 0x8000);
        }
        self.machine.ide.io_write(self.bm_port(4), 4, table);
    }

    pub fn start_dma(&self, to_memory: bool) {
        let cmd = if to_memory { 0x09 } else { 0x01 };
        self.machine.ide.io_write(self.bm_port(0), 1, cmd);
    }

    pub fn bm_status(&self) -> u8 {
        self.machine.ide.io_read(self.bm_port(2), 1) as u8
    }
}
