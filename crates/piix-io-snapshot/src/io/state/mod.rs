//! Versioned TLV snapshot container.
//!
//! A snapshot is a fixed header (magic, container version, four-byte device id, device
//! version) followed by tagged fields in ascending tag order. Readers skip tags they do not
//! know, so a device adds state within a major version by adding tags.

mod version;

pub use version::{
    codec, SnapshotError, SnapshotHeader, SnapshotReader, SnapshotResult, SnapshotVersion,
    SnapshotWriter,
};

/// A device whose state can be written to and rebuilt from a snapshot blob.
pub trait IoSnapshot {
    /// Identifies the device kind; a blob with another id is rejected.
    const DEVICE_ID: [u8; 4];
    const DEVICE_VERSION: SnapshotVersion;

    fn save_state(&self) -> Vec<u8>;

    /// Replaces `self` with the decoded state. On error `self` is left untouched.
    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()>;
}
