use std::collections::BTreeMap;

use thiserror::Error;

const MAGIC: [u8; 4] = *b"PXSN";
const FORMAT_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);
const HEADER_LEN: usize = 4 + 4 + 4 + 4;
const FIELD_HEADER_LEN: usize = 2 + 4;

pub type SnapshotResult<T> = Result<T, SnapshotError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("unexpected end of snapshot data")]
    UnexpectedEof,

    #[error("invalid snapshot magic")]
    InvalidMagic,

    #[error("unsupported snapshot format version {major}.{minor}")]
    UnsupportedFormatVersion { major: u16, minor: u16 },

    #[error("snapshot device id mismatch: expected {expected:?}, found {found:?}")]
    DeviceIdMismatch { expected: [u8; 4], found: [u8; 4] },

    #[error("unsupported device major version {found} (supported: {supported})")]
    UnsupportedDeviceMajorVersion { found: u16, supported: u16 },

    #[error("duplicate field tag {0}")]
    DuplicateFieldTag(u16),

    #[error("invalid field encoding: {0}")]
    InvalidFieldEncoding(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SnapshotVersion {
    pub major: u16,
    pub minor: u16,
}

impl SnapshotVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub format_version: SnapshotVersion,
    pub device_id: [u8; 4],
    pub device_version: SnapshotVersion,
}

/// Builds one device snapshot. Fields are emitted in ascending tag order regardless of the
/// order they were added in.
#[derive(Debug)]
pub struct SnapshotWriter {
    device_id: [u8; 4],
    device_version: SnapshotVersion,
    fields: BTreeMap<u16, Vec<u8>>,
}

impl SnapshotWriter {
    pub fn new(device_id: [u8; 4], device_version: SnapshotVersion) -> Self {
        Self {
            device_id,
            device_version,
            fields: BTreeMap::new(),
        }
    }

    pub fn field_bytes(&mut self, tag: u16, bytes: Vec<u8>) {
        self.fields.insert(tag, bytes);
    }

    pub fn field_u8(&mut self, tag: u16, val: u8) {
        self.field_bytes(tag, vec![val]);
    }

    pub fn field_u32(&mut self, tag: u16, val: u32) {
        self.field_bytes(tag, val.to_le_bytes().to_vec());
    }

    pub fn finish(self) -> Vec<u8> {
        let body: usize = self
            .fields
            .values()
            .map(|v| FIELD_HEADER_LEN + v.len())
            .sum();
        let mut out = Vec::with_capacity(HEADER_LEN + body);
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.major.to_le_bytes());
        out.extend_from_slice(&FORMAT_VERSION.minor.to_le_bytes());
        out.extend_from_slice(&self.device_id);
        out.extend_from_slice(&self.device_version.major.to_le_bytes());
        out.extend_from_slice(&self.device_version.minor.to_le_bytes());
        for (tag, bytes) in self.fields {
            out.extend_from_slice(&tag.to_le_bytes());
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(&bytes);
        }
        out
    }
}

/// Parsed view over one device snapshot.
#[derive(Debug)]
pub struct SnapshotReader<'a> {
    header: SnapshotHeader,
    fields: BTreeMap<u16, &'a [u8]>,
}

impl<'a> SnapshotReader<'a> {
    pub fn parse(bytes: &'a [u8], expected_id: [u8; 4]) -> SnapshotResult<Self> {
        let mut d = codec::Decoder::new(bytes);
        if d.bytes(4)? != MAGIC {
            return Err(SnapshotError::InvalidMagic);
        }
        let format_version = SnapshotVersion::new(d.u16()?, d.u16()?);
        if format_version.major != FORMAT_VERSION.major {
            return Err(SnapshotError::UnsupportedFormatVersion {
                major: format_version.major,
                minor: format_version.minor,
            });
        }
        let mut device_id = [0u8; 4];
        device_id.copy_from_slice(d.bytes(4)?);
        if device_id != expected_id {
            return Err(SnapshotError::DeviceIdMismatch {
                expected: expected_id,
                found: device_id,
            });
        }
        let device_version = SnapshotVersion::new(d.u16()?, d.u16()?);

        let mut fields = BTreeMap::new();
        while d.remaining() > 0 {
            let tag = d.u16()?;
            let len = d.u32()? as usize;
            let value = d.bytes(len)?;
            if fields.insert(tag, value).is_some() {
                return Err(SnapshotError::DuplicateFieldTag(tag));
            }
        }

        Ok(Self {
            header: SnapshotHeader {
                format_version,
                device_id,
                device_version,
            },
            fields,
        })
    }

    pub fn header(&self) -> &SnapshotHeader {
        &self.header
    }

    pub fn device_version(&self) -> SnapshotVersion {
        self.header.device_version
    }

    pub fn ensure_device_major(&self, supported: u16) -> SnapshotResult<()> {
        let found = self.header.device_version.major;
        if found != supported {
            return Err(SnapshotError::UnsupportedDeviceMajorVersion { found, supported });
        }
        Ok(())
    }

    pub fn bytes(&self, tag: u16) -> Option<&'a [u8]> {
        self.fields.get(&tag).copied()
    }

    pub fn u8(&self, tag: u16) -> SnapshotResult<Option<u8>> {
        match self.bytes(tag) {
            None => Ok(None),
            Some([v]) => Ok(Some(*v)),
            Some(_) => Err(SnapshotError::InvalidFieldEncoding("u8 field length")),
        }
    }

    pub fn u32(&self, tag: u16) -> SnapshotResult<Option<u32>> {
        match self.bytes(tag) {
            None => Ok(None),
            Some(b) => {
                let mut d = codec::Decoder::new(b);
                let v = d.u32()?;
                d.finish()?;
                Ok(Some(v))
            }
        }
    }
}

pub mod codec {
    use super::{SnapshotError, SnapshotResult};

    /// Little-endian field encoder used inside TLV values.
    #[derive(Debug, Default)]
    pub struct Encoder {
        buf: Vec<u8>,
    }

    impl Encoder {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn u8(mut self, v: u8) -> Self {
            self.buf.push(v);
            self
        }

        pub fn u16(mut self, v: u16) -> Self {
            self.buf.extend_from_slice(&v.to_le_bytes());
            self
        }

        pub fn u32(mut self, v: u32) -> Self {
            self.buf.extend_from_slice(&v.to_le_bytes());
            self
        }

        pub fn u64(mut self, v: u64) -> Self {
            self.buf.extend_from_slice(&v.to_le_bytes());
            self
        }

        pub fn bool(self, v: bool) -> Self {
            self.u8(u8::from(v))
        }

        pub fn bytes(mut self, v: &[u8]) -> Self {
            self.buf.extend_from_slice(v);
            self
        }

        pub fn finish(self) -> Vec<u8> {
            self.buf
        }
    }

    #[derive(Debug)]
    pub struct Decoder<'a> {
        bytes: &'a [u8],
        pos: usize,
    }

    impl<'a> Decoder<'a> {
        pub fn new(bytes: &'a [u8]) -> Self {
            Self { bytes, pos: 0 }
        }

        pub fn remaining(&self) -> usize {
            self.bytes.len() - self.pos
        }

        pub fn bytes(&mut self, len: usize) -> SnapshotResult<&'a [u8]> {
            if self.remaining() < len {
                return Err(SnapshotError::UnexpectedEof);
            }
            let out = &self.bytes[self.pos..self.pos + len];
            self.pos += len;
            Ok(out)
        }

        pub fn bytes_vec(&mut self, len: usize) -> SnapshotResult<Vec<u8>> {
            self.bytes(len).map(<[u8]>::to_vec)
        }

        pub fn u8(&mut self) -> SnapshotResult<u8> {
            Ok(self.bytes(1)?[0])
        }

        pub fn u16(&mut self) -> SnapshotResult<u16> {
            let mut raw = [0u8; 2];
            raw.copy_from_slice(self.bytes(2)?);
            Ok(u16::from_le_bytes(raw))
        }

        pub fn u32(&mut self) -> SnapshotResult<u32> {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(self.bytes(4)?);
            Ok(u32::from_le_bytes(raw))
        }

        pub fn u64(&mut self) -> SnapshotResult<u64> {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(self.bytes(8)?);
            Ok(u64::from_le_bytes(raw))
        }

        pub fn bool(&mut self) -> SnapshotResult<bool> {
            match self.u8()? {
                0 => Ok(false),
                1 => Ok(true),
                _ => Err(SnapshotError::InvalidFieldEncoding("bool")),
            }
        }

        /// Fails if undecoded bytes remain.
        pub fn finish(self) -> SnapshotResult<()> {
            if self.remaining() != 0 {
                return Err(SnapshotError::InvalidFieldEncoding("trailing bytes"));
            }
            Ok(())
        }
    }
}
