//! CMIS Command Data Block (CDB) protocol commands.
//!
//! CDB commands live on upper page `0x9F` of the module's register map.
//! A command is issued by writing its parameter block to the CDB LPL
//! window and then writing the two command-code bytes; the write of the
//! second code byte triggers execution. Completion is reported through a
//! flag register and a status register on page 0.
//!
//! ## Parameter Block Layout
//!
//! ```text
//! +---------+---------+-----------+---------+-----------+-----------+
//! | EPL len | LPL len | CheckCode | RLPLLen | RLPLChkCd | LPL bytes |
//! +---------+---------+-----------+---------+-----------+-----------+
//! | 2 (BE)  | 1       | 1         | 1       | 1         | 0..=116   |
//! +---------+---------+-----------+---------+-----------+-----------+
//! ```
//!
//! The check code is chosen so that the byte sum of the command code plus
//! the whole parameter block equals `0xFF` modulo 256.

use byteorder::{BigEndian, WriteBytesExt};

/// Page select register (lower page).
pub const PAGE_SELECT_REG: u8 = 0x7F;

/// CDB command code register (two bytes, page 0x9F).
pub const CDB_COMMAND_REG: u8 = 0x80;

/// CDB local payload / parameter block register (page 0x9F).
pub const CDB_PARAM_REG: u8 = 0x82;

/// CDB reply LPL register (page 0x9F).
pub const CDB_REPLY_REG: u8 = 0x8A;

/// CDB command completion flag register (lower page).
pub const CDB_FLAG_REG: u8 = 0x08;

/// CDB status register (lower page).
pub const CDB_STATUS_REG: u8 = 0x25;

/// Completion bit within [`CDB_FLAG_REG`].
pub const CDB_COMPLETE_FLAG: u8 = 0x40;

/// Status register value reporting success.
pub const CDB_STATUS_SUCCESS: u8 = 0x01;

/// Upper page hosting the CDB command/reply windows.
pub const CDB_PAGE: u8 = 0x9F;

/// First upper page of the extended payload window.
pub const EPL_PAGE_BASE: u8 = 0xA0;

/// Bytes addressable per extended payload page.
pub const EPL_PAGE_SIZE: usize = 128;

/// Chunk size for the local-payload-only transfer path.
pub const LPL_CHUNK_SIZE: usize = 116;

/// Default CMIS host password.
pub const DEFAULT_PASSWORD: u32 = 0x0000_1011;

/// A CDB command: two-byte command code plus parameter block.
#[derive(Debug, Clone)]
pub struct CdbCommand {
    code: u16,
    epl_len: u16,
    lpl: Vec<u8>,
}

impl CdbCommand {
    fn new(code: u16) -> Self {
        Self {
            code,
            epl_len: 0,
            lpl: Vec::new(),
        }
    }

    /// Build command 0x0001: enter the host password.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn password(password: u32) -> Self {
        let mut cmd = Self::new(0x0001);
        cmd.lpl.write_u32::<BigEndian>(password).unwrap();
        cmd
    }

    /// Build command 0x0041: query firmware management features.
    ///
    /// The reply carries the start-command payload size and the
    /// write-block capability byte.
    pub fn firmware_features() -> Self {
        Self::new(0x0041)
    }

    /// Build command 0x0101: start firmware download.
    ///
    /// The LPL embeds the declared image size (plus 8 bytes of protocol
    /// overhead), four reserved bytes and the image's own vendor header.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn start_download(image_size: u32, vendor_header: &[u8]) -> Self {
        let mut cmd = Self::new(0x0101);
        cmd.lpl
            .write_u32::<BigEndian>(image_size.wrapping_add(8))
            .unwrap();
        cmd.lpl.extend_from_slice(&[0x00; 4]);
        cmd.lpl.extend_from_slice(vendor_header);
        cmd
    }

    /// Build command 0x0103: write one image chunk through the LPL.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn write_lpl(addr: u32, chunk: &[u8]) -> Self {
        debug_assert!(chunk.len() <= LPL_CHUNK_SIZE);
        let mut cmd = Self::new(0x0103);
        cmd.lpl.write_u32::<BigEndian>(addr).unwrap();
        cmd.lpl.extend_from_slice(chunk);
        cmd
    }

    /// Build command 0x0104: commit one block previously staged in the
    /// extended payload pages.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn write_epl(block_len: u16, addr: u32) -> Self {
        let mut cmd = Self::new(0x0104);
        cmd.epl_len = block_len;
        cmd.lpl.write_u32::<BigEndian>(addr).unwrap();
        cmd
    }

    /// Build command 0x0107: complete firmware download.
    pub fn complete_download() -> Self {
        Self::new(0x0107)
    }

    /// Build command 0x0109: run the downloaded image.
    ///
    /// `reset_mode` 0x01 requests a hitless restart, 0x00 a full reset.
    pub fn run_image(reset_mode: u8) -> Self {
        let mut cmd = Self::new(0x0109);
        cmd.lpl
            .extend_from_slice(&[0x00, reset_mode, 0x00, 0x00]);
        cmd
    }

    /// Build command 0x010A: commit the running image as persistent.
    pub fn commit_image() -> Self {
        Self::new(0x010A)
    }

    /// The two big-endian command code bytes.
    pub fn code_bytes(&self) -> [u8; 2] {
        self.code.to_be_bytes()
    }

    /// Get the command code.
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Build the parameter block with the check code inserted.
    #[allow(clippy::cast_possible_truncation)] // LPL is at most 116 + 8 bytes
    pub fn param_block(&self) -> Vec<u8> {
        let mut block = Vec::with_capacity(6 + self.lpl.len());
        block.extend_from_slice(&self.epl_len.to_be_bytes());
        block.push(self.lpl.len() as u8); // LPL Len
        block.push(0x00); // CdbCheckCode, patched below
        block.push(0x00); // RLPLLen
        block.push(0x00); // RLPLChkCode
        block.extend_from_slice(&self.lpl);

        block[3] = check_code(self.code, &block);
        block
    }
}

/// Compute the CDB check code for a command code and parameter block
/// (whose check-code byte must be zero), such that the total byte sum is
/// `0xFF` modulo 256.
pub fn check_code(code: u16, param_block: &[u8]) -> u8 {
    let sum = u32::from(code >> 8)
        + u32::from(code & 0xFF)
        + param_block
            .iter()
            .map(|&b| u32::from(b))
            .sum::<u32>();
    0xFF - (sum & 0xFF) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_sum_is_ff(cmd: &CdbCommand) {
        let block = cmd.param_block();
        let code = cmd.code_bytes();
        let sum: u32 = block
            .iter()
            .chain(code.iter())
            .map(|&b| u32::from(b))
            .sum();
        assert_eq!(sum & 0xFF, 0xFF, "check code invariant for {:#06x}", cmd.code());
    }

    #[test]
    fn test_check_code_invariant_across_commands() {
        assert_sum_is_ff(&CdbCommand::password(DEFAULT_PASSWORD));
        assert_sum_is_ff(&CdbCommand::firmware_features());
        assert_sum_is_ff(&CdbCommand::start_download(1024, &[0x5A; 64]));
        assert_sum_is_ff(&CdbCommand::write_lpl(0, &[0x11; 116]));
        assert_sum_is_ff(&CdbCommand::write_epl(128, 0x80));
        assert_sum_is_ff(&CdbCommand::complete_download());
        assert_sum_is_ff(&CdbCommand::run_image(0x01));
        assert_sum_is_ff(&CdbCommand::commit_image());
    }

    #[test]
    fn test_firmware_features_well_known_check_code() {
        // Empty LPL, code 0x0041: 0xFF - 0x41 = 0xBE.
        let block = CdbCommand::firmware_features().param_block();
        assert_eq!(block.len(), 6);
        assert_eq!(block[3], 0xBE);
    }

    #[test]
    fn test_complete_download_well_known_check_code() {
        // Empty LPL, code 0x0107: 0xFF - 0x08 = 0xF7.
        let block = CdbCommand::complete_download().param_block();
        assert_eq!(block[3], 0xF7);
    }

    #[test]
    fn test_start_download_layout() {
        let header = [0xA5u8; 64];
        let cmd = CdbCommand::start_download(1000, &header);
        let block = cmd.param_block();
        // 6 fixed + 4 size + 4 reserved + 64 header
        assert_eq!(block.len(), 78);
        assert_eq!(block[2], 64 + 8); // LPL Len = header + 8
        assert_eq!(&block[6..10], &1008u32.to_be_bytes());
        assert_eq!(&block[10..14], &[0x00; 4]);
        assert_eq!(&block[14..], &header);
    }

    #[test]
    fn test_write_epl_layout() {
        let cmd = CdbCommand::write_epl(128, 0x0000_0080);
        let block = cmd.param_block();
        assert_eq!(block.len(), 10);
        assert_eq!(&block[0..2], &[0x00, 0x80]); // EPL Len
        assert_eq!(block[2], 0x04); // LPL Len = address only
        assert_eq!(&block[6..10], &[0x00, 0x00, 0x00, 0x80]);
    }

    #[test]
    fn test_password_layout() {
        let block = CdbCommand::password(0x0000_1011).param_block();
        assert_eq!(block.len(), 10);
        assert_eq!(block[2], 0x04);
        assert_eq!(&block[6..10], &[0x00, 0x00, 0x10, 0x11]);
    }
}
