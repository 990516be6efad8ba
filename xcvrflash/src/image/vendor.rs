//! Vendor upgrade image format.
//!
//! An upgrade image is a fixed-size vendor header followed immediately by
//! the firmware payload, no separators, no compression.
//!
//! ## Header Layout (64 bytes, big-endian)
//!
//! ```text
//! +-----------+------------+---------------+---------+------+--------+
//! | file size | file CRC32 | build version | version | type | offset |
//! +-----------+------------+---------------+---------+------+--------+
//! | 4         | 4          | 4             | 2       | 2    | 4      |
//! +-----------+------------+---------------+---------+------+--------+
//! +----------------+---------------+
//! | type name (12) | module # (32) |
//! +----------------+---------------+
//! ```
//!
//! `file size` and `file CRC32` cover the payload that follows the
//! header. The two name fields keep only printable ASCII and are
//! uppercased on parse.

use crate::error::{Error, Result};
use crate::protocol::crc::crc32_ieee;
use byteorder::{BigEndian, ReadBytesExt};
use log::debug;
use std::fs;
use std::io::Read;
use std::path::Path;

/// Vendor header size in bytes.
pub const HEADER_SIZE: usize = 64;

/// Firmware type name field size.
pub const TYPE_NAME_SIZE: usize = 12;

/// Module number field size.
pub const MODULE_NUMBER_SIZE: usize = 32;

/// Fixed-size vendor header prefixed to every upgrade image.
#[derive(Debug, Clone)]
pub struct VendorHeader {
    /// Payload size in bytes.
    pub file_size: u32,
    /// CRC-32/IEEE over the payload.
    pub file_crc32: u32,
    /// Firmware build number.
    pub build_version: u32,
    /// Packed major.minor firmware version.
    pub version: u16,
    /// Numeric firmware type code.
    pub firmware_type: u16,
    /// Destination image/address slot in the device.
    pub offset_addr: u32,
    /// Firmware family name (printable ASCII, uppercased).
    pub firmware_type_name: String,
    /// Module number the image targets (printable ASCII, uppercased).
    pub module_number: String,
}

impl VendorHeader {
    /// Read a header from a reader (64 bytes).
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let file_size = reader.read_u32::<BigEndian>()?;
        let file_crc32 = reader.read_u32::<BigEndian>()?;
        let build_version = reader.read_u32::<BigEndian>()?;
        let version = reader.read_u16::<BigEndian>()?;
        let firmware_type = reader.read_u16::<BigEndian>()?;
        let offset_addr = reader.read_u32::<BigEndian>()?;

        let mut type_name_bytes = [0u8; TYPE_NAME_SIZE];
        reader.read_exact(&mut type_name_bytes)?;
        let mut module_number_bytes = [0u8; MODULE_NUMBER_SIZE];
        reader.read_exact(&mut module_number_bytes)?;

        Ok(Self {
            file_size,
            file_crc32,
            build_version,
            version,
            firmware_type,
            offset_addr,
            firmware_type_name: printable_upper(&type_name_bytes),
            module_number: printable_upper(&module_number_bytes),
        })
    }

    /// Render the packed version as `major.minor` (minor as /100).
    pub fn version_string(&self) -> String {
        format!("{}.{:02}", self.version >> 8, self.version & 0xFF)
    }

    /// The image slot selected by this header (low byte of the type).
    pub fn image_slot(&self) -> u8 {
        (self.firmware_type & 0xFF) as u8
    }
}

/// Keep printable ASCII characters and uppercase them, discarding
/// everything else (NUL padding, stray bytes).
pub fn printable_upper(bytes: &[u8]) -> String {
    bytes
        .iter()
        .filter(|b| b.is_ascii_graphic() || **b == b' ')
        .map(|b| (*b as char).to_ascii_uppercase())
        .collect()
}

/// A parsed and integrity-checked upgrade image.
///
/// Immutable once parsed; both engines consume it read-only.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    /// The validated vendor header.
    pub header: VendorHeader,
    payload: Vec<u8>,
}

impl FirmwareImage {
    /// Load and validate an image from a file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading upgrade image from: {}", path.display());
        Self::parse(fs::read(path)?)
    }

    /// Parse and validate an image from raw bytes.
    ///
    /// Fails before any device I/O if the file is truncated or the
    /// payload does not match the header's declared size and CRC-32.
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::FileFormat("empty file".into()));
        }
        if data.len() < HEADER_SIZE {
            return Err(Error::FileFormat(format!(
                "file too small for vendor header ({} bytes, need {HEADER_SIZE})",
                data.len()
            )));
        }

        let mut cursor = std::io::Cursor::new(&data);
        let header = VendorHeader::read_from(&mut cursor)?;
        let payload = data[HEADER_SIZE..].to_vec();

        if payload.is_empty() {
            return Err(Error::FileFormat("no payload after vendor header".into()));
        }

        #[allow(clippy::cast_possible_truncation)] // images are < 4 GB
        let actual_size = payload.len() as u32;
        if header.file_size != actual_size {
            return Err(Error::SizeMismatch {
                expected: header.file_size,
                actual: actual_size,
            });
        }

        let actual_crc = crc32_ieee(&payload);
        if header.file_crc32 != actual_crc {
            return Err(Error::CrcMismatch {
                expected: header.file_crc32,
                actual: actual_crc,
            });
        }

        debug!(
            "Image: {} {} v{} ({} bytes, CRC {:#010x})",
            header.module_number,
            header.firmware_type_name,
            header.version_string(),
            header.file_size,
            header.file_crc32
        );

        Ok(Self { header, payload })
    }

    /// The raw payload bytes as stored in the file.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The payload right-padded with `0xFF` to a multiple of
    /// `block_size`, so every transferred chunk is full-size.
    pub fn padded_payload(&self, block_size: usize) -> Vec<u8> {
        let mut data = self.payload.clone();
        let rem = data.len() % block_size;
        if rem != 0 {
            data.resize(data.len() + block_size - rem, 0xFF);
        }
        data
    }

    /// CRC-32 over the padded payload; this is the value the legacy
    /// bootloader is told to expect.
    pub fn padded_crc32(&self, block_size: usize) -> u32 {
        crc32_ieee(&self.padded_payload(block_size))
    }
}

/// Split a raw image file at a negotiated header size (CDB path: the
/// header size is only known after the capability query).
pub fn split_raw(data: &[u8], header_len: usize) -> Result<(&[u8], &[u8])> {
    if data.is_empty() {
        return Err(Error::FileFormat("empty file".into()));
    }
    if data.len() < header_len {
        return Err(Error::FileFormat(format!(
            "file too small for {header_len}-byte vendor header"
        )));
    }
    Ok(data.split_at(header_len))
}

/// Build a well-formed image around `payload` for tests.
#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::cast_possible_truncation)]
pub(crate) fn build_test_image(
    payload: &[u8],
    type_name: &str,
    module_number: &str,
) -> Vec<u8> {
    use byteorder::WriteBytesExt;

    let mut data = Vec::with_capacity(HEADER_SIZE + payload.len());
    data.write_u32::<BigEndian>(payload.len() as u32).unwrap();
    data.write_u32::<BigEndian>(crc32_ieee(payload)).unwrap();
    data.write_u32::<BigEndian>(20260830).unwrap(); // build
    data.write_u16::<BigEndian>(0x0105).unwrap(); // v1.05
    data.write_u16::<BigEndian>(0x0001).unwrap(); // type
    data.write_u32::<BigEndian>(0x0008_0000).unwrap(); // offset

    let mut name = [0u8; TYPE_NAME_SIZE];
    name[..type_name.len()].copy_from_slice(type_name.as_bytes());
    data.extend_from_slice(&name);

    let mut module = [0u8; MODULE_NUMBER_SIZE];
    module[..module_number.len()].copy_from_slice(module_number.as_bytes());
    data.extend_from_slice(&module);

    data.extend_from_slice(payload);
    data
}
