use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MediumError>;

/// Unified error type for host medium operations.
///
/// Errors fall into two classes. *Transient* errors ([`MediumError::is_redo`]) describe host
/// conditions an operator can fix while the guest is paused: a full host disk, a severed
/// network-storage connection or a missing encryption key. The controller never reports those
/// to the guest; it suspends and retries the request instead. Everything else is *permanent*
/// and becomes an ATA error register value or ATAPI sense data.
#[derive(Debug, Error)]
pub enum MediumError {
    #[error("out of bounds: offset={offset} len={len} capacity={capacity}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        capacity: u64,
    },

    #[error("integer overflow while computing byte offsets")]
    OffsetOverflow,

    #[error("medium is read-only")]
    ReadOnly,

    #[error("no medium mounted")]
    NotMounted,

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("host disk full")]
    DiskFull,

    #[error("host file size limit exceeded")]
    FileTooBig,

    #[error("connection to storage backend lost")]
    ConnectionLost,

    #[error("stale file handle")]
    StaleHandle,

    #[error("encryption key missing")]
    KeyMissing,

    /// The I/O was interrupted by a reset or abort and has no outcome.
    #[error("operation cancelled")]
    Cancelled,

    #[error("raw SCSI command timed out")]
    Timeout,

    /// Generic I/O failure.
    ///
    /// This is a catch-all for errors that do not map to a more structured variant.
    #[error("io error: {0}")]
    Io(String),
}

impl MediumError {
    /// Returns whether the request should be suspended and redone instead of failed.
    pub fn is_redo(&self) -> bool {
        matches!(
            self,
            MediumError::DiskFull
                | MediumError::FileTooBig
                | MediumError::ConnectionLost
                | MediumError::StaleHandle
                | MediumError::KeyMissing
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, MediumError::Cancelled)
    }
}

impl From<io::Error> for MediumError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::StorageFull => MediumError::DiskFull,
            io::ErrorKind::FileTooLarge => MediumError::FileTooBig,
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionRefused => {
                MediumError::ConnectionLost
            }
            io::ErrorKind::StaleNetworkFileHandle => MediumError::StaleHandle,
            io::ErrorKind::ReadOnlyFilesystem => MediumError::ReadOnly,
            io::ErrorKind::TimedOut => MediumError::Timeout,
            io::ErrorKind::Interrupted => MediumError::Cancelled,
            _ => MediumError::Io(err.to_string()),
        }
    }
}
