//! Worker requests and the step tables they reference.
//!
//! Step and state enums carry a stable numeric index because snapshots persist them.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    None,
    /// Device to guest.
    FromDevice,
    /// Guest to device.
    ToDevice,
}

impl Direction {
    pub fn to_index(self) -> u8 {
        match self {
            Direction::None => 0,
            Direction::FromDevice => 1,
            Direction::ToDevice => 2,
        }
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Some(match index {
            0 => Direction::None,
            1 => Direction::FromDevice,
            2 => Direction::ToDevice,
            _ => return None,
        })
    }
}

/// Sizes the elementary chunk of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BeginStep {
    #[default]
    None,
    ReadWriteSectors,
    AtapiCmd,
    AtapiPassthrough,
}

impl BeginStep {
    pub fn to_index(self) -> u8 {
        match self {
            BeginStep::None => 0,
            BeginStep::ReadWriteSectors => 1,
            BeginStep::AtapiCmd => 2,
            BeginStep::AtapiPassthrough => 3,
        }
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Some(match index {
            0 => BeginStep::None,
            1 => BeginStep::ReadWriteSectors,
            2 => BeginStep::AtapiCmd,
            3 => BeginStep::AtapiPassthrough,
            _ => return None,
        })
    }
}

/// Produces or consumes one elementary chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SinkStep {
    #[default]
    None,
    Identify,
    ReadSectors,
    WriteSectors,
    Flush,
    Trim,
    /// Receives the 12-byte ATAPI command packet.
    Packet,
    AtapiIdentify,
    /// Fixed-size emulated ATAPI reply, selected by the stored CDB opcode.
    AtapiResponse,
    AtapiRead,
    Passthrough,
}

impl SinkStep {
    const TABLE: [SinkStep; 11] = [
        SinkStep::None,
        SinkStep::Identify,
        SinkStep::ReadSectors,
        SinkStep::WriteSectors,
        SinkStep::Flush,
        SinkStep::Trim,
        SinkStep::Packet,
        SinkStep::AtapiIdentify,
        SinkStep::AtapiResponse,
        SinkStep::AtapiRead,
        SinkStep::Passthrough,
    ];

    pub fn to_index(self) -> u8 {
        Self::TABLE
            .iter()
            .position(|s| *s == self)
            .map_or(0, |i| i as u8)
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Self::TABLE.get(usize::from(index)).copied()
    }
}

/// Worker state machine: `Idle -> Busy -> {Dma | Pio} -> Idle`, plus `Reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AsyncState {
    #[default]
    Idle,
    Busy,
    Dma,
    Pio,
    Reset,
}

impl AsyncState {
    pub fn to_index(self) -> u8 {
        match self {
            AsyncState::Idle => 0,
            AsyncState::Busy => 1,
            AsyncState::Dma => 2,
            AsyncState::Pio => 3,
            AsyncState::Reset => 4,
        }
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Some(match index {
            0 => AsyncState::Idle,
            1 => AsyncState::Busy,
            2 => AsyncState::Dma,
            3 => AsyncState::Pio,
            4 => AsyncState::Reset,
            _ => return None,
        })
    }
}

/// Parameters of a new transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewTransfer {
    pub device: usize,
    pub total: u32,
    pub direction: Direction,
    pub begin: BeginStep,
    pub sink: SinkStep,
    pub dma: bool,
    /// Issued by the worker itself as a follow-up of the current command.
    pub chained: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    New(NewTransfer),
    ContinueDma,
    ContinuePio,
    ResetAsserted,
    ResetCleared,
    Abort { device: usize, reset_drive: bool },
}
