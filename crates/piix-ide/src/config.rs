//! Controller and drive configuration.
//!
//! Configuration is plain data deserialized from JSON; every field has a default so an empty
//! object describes a PIIX3 controller with no drives attached.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default multi-sector ceiling advertised in IDENTIFY word 47.
pub const DEFAULT_MAX_MULT_SECTORS: u16 = 128;

/// Default per-device I/O buffer size.
pub const DEFAULT_IO_BUFFER_BYTES: usize = 128 * 1024;

/// Default request ring size (one slot stays unused).
pub const DEFAULT_QUEUE_CAPACITY: usize = 4;

pub const DEFAULT_PASSTHROUGH_TIMEOUT_MS: u64 = 30_000;

/// Legacy bus-master I/O base used when the embedder does not pick one.
pub const DEFAULT_BUS_MASTER_BASE: u16 = 0xC000;

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration json: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("max_mult_sectors must be a power of two between 1 and 128, got {0}")]
    InvalidMaxMult(u16),

    #[error("queue_capacity must be at least 2, got {0}")]
    QueueTooSmall(usize),

    #[error("{drive}: io buffer of {bytes} bytes is smaller than one sector ({min} bytes)")]
    BufferTooSmall {
        drive: &'static str,
        bytes: usize,
        min: usize,
    },

    #[error("{drive}: io buffer of {bytes} bytes exceeds the {max} byte limit")]
    BufferTooLarge {
        drive: &'static str,
        bytes: usize,
        max: usize,
    },

    #[error("{drive}: invalid geometry {cylinders}/{heads}/{sectors}")]
    InvalidGeometry {
        drive: &'static str,
        cylinders: u16,
        heads: u8,
        sectors: u8,
    },
}

/// Chipset flavour. Only the Ultra-DMA ceiling differs between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chipset {
    #[default]
    Piix3,
    Piix4,
    Ich6,
}

impl Chipset {
    /// Highest Ultra-DMA mode the chipset supports, if any.
    pub fn max_udma(self) -> Option<u8> {
        match self {
            Chipset::Piix3 => None,
            Chipset::Piix4 => Some(2),
            Chipset::Ich6 => Some(6),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveKind {
    #[default]
    Disk,
    Cdrom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeometryConfig {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors: u8,
}

/// Replacement strings reported by INQUIRY.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InquiryConfig {
    pub vendor: Option<String>,
    pub product: Option<String>,
    pub revision: Option<String>,
}

impl InquiryConfig {
    pub fn is_empty(&self) -> bool {
        self.vendor.is_none() && self.product.is_none() && self.revision.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    pub kind: DriveKind,
    pub serial: String,
    pub firmware: String,
    pub model: String,
    pub geometry: Option<GeometryConfig>,
    pub trim: bool,
    pub non_rotational: bool,
    /// Overrides [`IdeConfig::io_buffer_bytes`] for this drive.
    pub io_buffer_bytes: Option<usize>,
    pub inquiry: Option<InquiryConfig>,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self::disk()
    }
}

impl DriveConfig {
    pub fn disk() -> Self {
        Self {
            kind: DriveKind::Disk,
            serial: "PIIXHD0000000001".to_string(),
            firmware: "1.0".to_string(),
            model: "PIIX HARDDISK".to_string(),
            geometry: None,
            trim: false,
            non_rotational: false,
            io_buffer_bytes: None,
            inquiry: None,
        }
    }

    pub fn cdrom() -> Self {
        Self {
            kind: DriveKind::Cdrom,
            serial: "PIIXCD0000000001".to_string(),
            firmware: "1.0".to_string(),
            model: "PIIX CD-ROM".to_string(),
            ..Self::disk()
        }
    }

    fn min_buffer(&self) -> usize {
        match self.kind {
            DriveKind::Disk => piix_storage::SECTOR_SIZE,
            DriveKind::Cdrom => piix_storage::CD_RAW_SECTOR_SIZE,
        }
    }
}

/// The two drive positions on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub master: Option<DriveConfig>,
    pub slave: Option<DriveConfig>,
}

impl ChannelConfig {
    pub fn drive(&self, index: usize) -> Option<&DriveConfig> {
        match index {
            0 => self.master.as_ref(),
            1 => self.slave.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdeConfig {
    pub chipset: Chipset,
    pub max_mult_sectors: u16,
    pub io_buffer_bytes: usize,
    pub queue_capacity: usize,
    pub passthrough_timeout_ms: u64,
    pub bus_master_base: u16,
    pub primary: ChannelConfig,
    pub secondary: ChannelConfig,
}

impl Default for IdeConfig {
    fn default() -> Self {
        Self {
            chipset: Chipset::default(),
            max_mult_sectors: DEFAULT_MAX_MULT_SECTORS,
            io_buffer_bytes: DEFAULT_IO_BUFFER_BYTES,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            passthrough_timeout_ms: DEFAULT_PASSTHROUGH_TIMEOUT_MS,
            bus_master_base: DEFAULT_BUS_MASTER_BASE,
            primary: ChannelConfig::default(),
            secondary: ChannelConfig::default(),
        }
    }
}

impl IdeConfig {
    /// Parses and validates a JSON configuration document.
    pub fn parse_str(json: &str) -> Result<Self> {
        let config: IdeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mult = self.max_mult_sectors;
        if mult == 0 || mult > DEFAULT_MAX_MULT_SECTORS || !mult.is_power_of_two() {
            return Err(ConfigError::InvalidMaxMult(mult));
        }
        if self.queue_capacity < 2 {
            return Err(ConfigError::QueueTooSmall(self.queue_capacity));
        }
        let drives = [
            ("primary master", self.primary.master.as_ref()),
            ("primary slave", self.primary.slave.as_ref()),
            ("secondary master", self.secondary.master.as_ref()),
            ("secondary slave", self.secondary.slave.as_ref()),
        ];
        for (name, drive) in drives {
            let Some(drive) = drive else { continue };
            let bytes = self.buffer_bytes_for(drive);
            let min = drive.min_buffer();
            if bytes < min {
                return Err(ConfigError::BufferTooSmall {
                    drive: name,
                    bytes,
                    min,
                });
            }
            let max = piix_io_snapshot::io::storage::state::MAX_IDE_DATA_BUFFER_BYTES;
            if bytes > max {
                return Err(ConfigError::BufferTooLarge {
                    drive: name,
                    bytes,
                    max,
                });
            }
            if let Some(g) = drive.geometry {
                if g.cylinders == 0 || g.heads == 0 || g.heads > 16 || g.sectors == 0 {
                    return Err(ConfigError::InvalidGeometry {
                        drive: name,
                        cylinders: g.cylinders,
                        heads: g.heads,
                        sectors: g.sectors,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn buffer_bytes_for(&self, drive: &DriveConfig) -> usize {
        drive.io_buffer_bytes.unwrap_or(self.io_buffer_bytes)
    }

    pub fn channel(&self, index: usize) -> &ChannelConfig {
        if index == 0 {
            &self.primary
        } else {
            &self.secondary
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_uses_defaults() {
        let config = IdeConfig::parse_str("{}").unwrap();
        assert_eq!(config, IdeConfig::default());
        assert_eq!(config.chipset.max_udma(), None);
        assert_eq!(config.queue_capacity, 4);
    }

    #[test]
    fn drives_and_overrides_parse() {
        let config = IdeConfig::parse_str(
            r#"{
                "chipset": "ich6",
                "primary": {
                    "master": { "kind": "disk", "serial": "S1", "trim": true,
                                "geometry": { "cylinders": 100, "heads": 16, "sectors": 63 } }
                },
                "secondary": {
                    "master": { "kind": "cdrom",
                                "inquiry": { "vendor": "HOST", "product": "DVD-RW" } }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.chipset.max_udma(), Some(6));
        let disk = config.primary.master.as_ref().unwrap();
        assert!(disk.trim);
        assert_eq!(disk.serial, "S1");
        assert_eq!(disk.model, "PIIX HARDDISK");
        let cd = config.secondary.drive(0).unwrap();
        assert_eq!(cd.kind, DriveKind::Cdrom);
        assert_eq!(
            cd.inquiry.as_ref().unwrap().vendor.as_deref(),
            Some("HOST")
        );
        assert!(config.primary.slave.is_none());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            IdeConfig::parse_str(r#"{"max_mult_sectors": 3}"#),
            Err(ConfigError::InvalidMaxMult(3))
        ));
        assert!(matches!(
            IdeConfig::parse_str(r#"{"queue_capacity": 1}"#),
            Err(ConfigError::QueueTooSmall(1))
        ));
        assert!(matches!(
            IdeConfig::parse_str(r#"{"chipset": "i440"}"#),
            Err(ConfigError::InvalidJson(_))
        ));
        assert!(matches!(
            IdeConfig::parse_str(
                r#"{"secondary": {"master": {"kind": "cdrom", "io_buffer_bytes": 2048}}}"#
            ),
            Err(ConfigError::BufferTooSmall { min: 2352, .. })
        ));
    }
}
