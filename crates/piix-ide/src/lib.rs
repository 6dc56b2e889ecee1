//! PIIX3/PIIX4/ICH6 IDE controller emulation with ATA disks and ATAPI CD/DVD drives.
//!
//! Each channel is a [`Controller`]: register decode runs on the caller's (vCPU) thread,
//! medium I/O runs on a per-channel worker thread. [`PiixIde`] ties both channels to the
//! legacy port ranges and the bus-master block.
//!
//! - [`IdeConfig`]: serde configuration of the chipset and its four drive positions
//! - [`IrqLine`] / [`RedoHandler`]: embedder callbacks for interrupts and transient errors
//! - [`Controller::snapshot_state`]: persisted state through `piix-io-snapshot`
//!
//! Media are provided by the `piix-storage` crate.

mod atapi;
mod busmaster;
mod channel;
pub mod config;
mod controller;
mod device;
mod dispatch;
mod dma;
mod identify;
mod passthrough;
mod piix;
mod pio;
mod queue;
pub mod regs;
mod request;
mod snapshot;
mod stats;
mod tracklist;
mod transfer;
mod worker;

pub use busmaster::{PrdCursor, PrdEntry};
pub use channel::SharedMemory;
pub use config::{
    ChannelConfig, Chipset, ConfigError, DriveConfig, DriveKind, GeometryConfig, IdeConfig,
    InquiryConfig,
};
pub use controller::{Controller, IdeError, IrqLine, RedoHandler, Result};
pub use device::{MODE_MDMA, MODE_PIO, MODE_UDMA};
pub use piix::{IdePortMap, PiixIde, BUS_MASTER_BLOCK_LEN, PRIMARY_PORTS, SECONDARY_PORTS};
pub use stats::{Stats, MAX_LOG_REL_ERRORS};
pub use tracklist::{Track, TrackDataForm, TrackList};

pub use piix_io_snapshot::io::storage::state::{IdeChannelState, IdeSnapshotFormat};
