//! Legacy vendor bootloader protocol commands.
//!
//! The legacy bootloader speaks a single-opcode-per-command protocol over
//! raw (register-less) I2C writes to the bootloader slave address. Most
//! commands are acknowledged by echoing the opcode back on a subsequent
//! read.
//!
//! ## Frame Formats
//!
//! ```text
//! Parameterless:   [opcode]
//! Unlock:          [0x10] ['B' 'O' 'O' 'T']
//! Choose image:    [0x11] [slot]
//! 32-bit payload:  [opcode] [u32 BE] [checksum]
//! Data block:      [0x21] [seq u16 BE] [data * 256] [checksum]
//! ```
//!
//! The trailing checksum byte is the sum of every preceding frame byte,
//! truncated to 8 bits.

use byteorder::{BigEndian, WriteBytesExt};

/// Number of payload bytes carried by one data block.
pub const BLOCK_SIZE: usize = 256;

/// Default bootloader unlock password.
pub const DEFAULT_PASSWORD: u32 = 0xC24F4F54;

/// Literal sent alongside the unlock opcode.
pub const UNLOCK_MAGIC: &[u8; 4] = b"BOOT";

/// Legacy bootloader command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Unlock the bootloader (followed by the literal `BOOT`).
    Unlock = 0x10,
    /// Choose the image slot to upgrade.
    ChooseImage = 0x11,
    /// Announce the flash destination address.
    FlashAddr = 0x12,
    /// Announce the total (padded) file size.
    FileSize = 0x13,
    /// Announce the CRC-32 of the (padded) file.
    FileCrc = 0x14,
    /// Erase the target flash region.
    Erase = 0x20,
    /// Transfer one data block.
    WriteData = 0x21,
    /// Ask the bootloader to validate the flashed CRC-32.
    ValidateCrc = 0x22,
    /// Jump into the freshly written image (fire-and-forget).
    Jump = 0x30,
    /// Reset back to the pre-upgrade image (fire-and-forget).
    Reset = 0x32,
    /// DSP-family data backup before erase.
    DspBackup = 0x44,
    /// Query the module number from the bootloader context.
    ModuleNumber = 0x74,
}

/// Legacy bootloader command frame builder.
#[derive(Debug)]
pub struct CommandFrame {
    opcode: Opcode,
    payload: Vec<u8>,
    checksummed: bool,
}

impl CommandFrame {
    fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            payload: Vec::new(),
            checksummed: false,
        }
    }

    /// Build the unlock frame: `[0x10, 'B', 'O', 'O', 'T']`.
    pub fn unlock() -> Self {
        let mut frame = Self::new(Opcode::Unlock);
        frame.payload.extend_from_slice(UNLOCK_MAGIC);
        frame
    }

    /// Build the image-slot selection frame: `[0x11, slot]`.
    pub fn choose_image(slot: u8) -> Self {
        let mut frame = Self::new(Opcode::ChooseImage);
        frame.payload.push(slot);
        frame
    }

    /// Build the flash-address frame (checksummed 32-bit payload).
    pub fn flash_addr(addr: u32) -> Self {
        Self::with_u32(Opcode::FlashAddr, addr)
    }

    /// Build the file-size frame (checksummed 32-bit payload).
    pub fn file_size(size: u32) -> Self {
        Self::with_u32(Opcode::FileSize, size)
    }

    /// Build the file-CRC frame (checksummed 32-bit payload).
    pub fn file_crc(crc: u32) -> Self {
        Self::with_u32(Opcode::FileCrc, crc)
    }

    /// Build a data block frame.
    ///
    /// Block sequence numbers start at 1. Chunks shorter than
    /// [`BLOCK_SIZE`] are right-padded with `0xFF` so every frame carries
    /// a full block.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn data_block(seq: u16, chunk: &[u8]) -> Self {
        debug_assert!(chunk.len() <= BLOCK_SIZE);
        let mut frame = Self::new(Opcode::WriteData);
        frame.payload.write_u16::<BigEndian>(seq).unwrap();
        frame.payload.extend_from_slice(chunk);
        frame.payload.resize(2 + BLOCK_SIZE, 0xFF);
        frame.checksummed = true;
        frame
    }

    /// Build the family-specific backup frame (bare opcode).
    pub fn backup(opcode: Opcode) -> Self {
        Self::new(opcode)
    }

    /// Build the erase frame (bare opcode).
    pub fn erase() -> Self {
        Self::new(Opcode::Erase)
    }

    /// Build the CRC validation frame (bare opcode).
    pub fn validate() -> Self {
        Self::new(Opcode::ValidateCrc)
    }

    /// Build the jump-to-image frame (bare opcode, no acknowledgement).
    pub fn jump() -> Self {
        Self::new(Opcode::Jump)
    }

    /// Build the reset frame (bare opcode, no acknowledgement).
    pub fn reset() -> Self {
        Self::new(Opcode::Reset)
    }

    /// Build the bootloader-context module number query (bare opcode).
    pub fn module_number_query() -> Self {
        Self::new(Opcode::ModuleNumber)
    }

    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    fn with_u32(opcode: Opcode, value: u32) -> Self {
        let mut frame = Self::new(opcode);
        frame.payload.write_u32::<BigEndian>(value).unwrap();
        frame.checksummed = true;
        frame
    }

    /// Build the complete frame bytes, appending the checksum when the
    /// command carries one.
    pub fn build(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.payload.len() + 1);
        buf.push(self.opcode as u8);
        buf.extend_from_slice(&self.payload);
        if self.checksummed {
            buf.push(checksum(&buf));
        }
        buf
    }

    /// Get the command opcode.
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }
}

/// Checksum byte for a legacy frame: sum of all bytes, truncated to 8 bits.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlock_frame() {
        let data = CommandFrame::unlock().build();
        assert_eq!(data, [0x10, 0x42, 0x4F, 0x4F, 0x54]);
    }

    #[test]
    fn test_choose_image_has_no_checksum() {
        let data = CommandFrame::choose_image(0x02).build();
        assert_eq!(data, [0x11, 0x02]);
    }

    #[test]
    fn test_file_size_frame_layout() {
        let data = CommandFrame::file_size(0x0001_0200).build();
        assert_eq!(data.len(), 6);
        assert_eq!(data[0], 0x13);
        assert_eq!(&data[1..5], &[0x00, 0x01, 0x02, 0x00]);
        assert_eq!(data[5], checksum(&data[..5]));
    }

    #[test]
    fn test_checksum_property_over_u32_frames() {
        for value in [0u32, 1, 0xFF, 0xDEADBEEF, u32::MAX] {
            let data = CommandFrame::flash_addr(value).build();
            let sum: u32 = data[..data.len() - 1]
                .iter()
                .map(|&b| u32::from(b))
                .sum();
            assert_eq!(u32::from(data[data.len() - 1]), sum & 0xFF);
        }
    }

    #[test]
    fn test_data_block_frame() {
        let chunk = [0xAB; BLOCK_SIZE];
        let data = CommandFrame::data_block(1, &chunk).build();
        assert_eq!(data.len(), 1 + 2 + BLOCK_SIZE + 1);
        assert_eq!(data[0], 0x21);
        assert_eq!(&data[1..3], &[0x00, 0x01]);
        assert_eq!(data[data.len() - 1], checksum(&data[..data.len() - 1]));
    }

    #[test]
    fn test_data_block_pads_short_chunk() {
        let data = CommandFrame::data_block(3, &[0x01, 0x02]).build();
        assert_eq!(data.len(), 1 + 2 + BLOCK_SIZE + 1);
        assert_eq!(&data[3..5], &[0x01, 0x02]);
        assert!(data[5..3 + BLOCK_SIZE].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_bare_opcode_frames() {
        assert_eq!(CommandFrame::erase().build(), [0x20]);
        assert_eq!(CommandFrame::validate().build(), [0x22]);
        assert_eq!(CommandFrame::jump().build(), [0x30]);
        assert_eq!(CommandFrame::reset().build(), [0x32]);
        assert_eq!(CommandFrame::backup(Opcode::DspBackup).build(), [0x44]);
    }
}
