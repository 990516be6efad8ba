//! Error types for xcvrflash.

use std::io;
use thiserror::Error;

/// Result type for xcvrflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for xcvrflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (image file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid upgrade image file.
    #[error("Invalid image file: {0}")]
    FileFormat(String),

    /// Declared payload size does not match the bytes in the file.
    #[error("Size mismatch: header declares {expected} bytes, file carries {actual}")]
    SizeMismatch {
        /// Size declared by the vendor header.
        expected: u32,
        /// Actual payload size.
        actual: u32,
    },

    /// CRC-32 checksum mismatch between header and payload.
    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch {
        /// CRC declared by the vendor header.
        expected: u32,
        /// CRC computed over the payload.
        actual: u32,
    },

    /// Image is not compatible with the target engine or module.
    #[error(transparent)]
    Compatibility(#[from] CompatibilityError),

    /// A protocol step never reached its expected acknowledgement.
    #[error("Timeout: no acknowledgement for {0} within its deadline")]
    StepTimeout(UpgradeStep),

    /// The CDB completion flag was never set within the deadline.
    #[error("CDB command not completed")]
    CommandNotCompleted,

    /// The module is still busy processing a CDB command at the deadline.
    #[error("Busy processing CDB command")]
    CdbBusy,

    /// The module explicitly reported a CDB failure status.
    #[error("CDB command status: [{}]", cdb_status_message(*.code))]
    CdbStatus {
        /// Raw status register value.
        code: u8,
    },

    /// The module never answered again after a requested reset.
    #[error("Timeout waiting for module reboot")]
    RebootTimeout,

    /// The transport layer rejected a register transaction.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The operation was cancelled by the embedding application.
    #[error("Upgrade interrupted")]
    Interrupted,
}

/// Compatibility failures between an image file and the live module.
#[derive(Debug, Error)]
pub enum CompatibilityError {
    /// The header's firmware type name is not accepted by this engine.
    #[error("Unsupported firmware type: {0:?}")]
    UnsupportedFirmwareType(String),

    /// The module number read from the device does not match the header.
    #[error("Module number mismatch: image is for {expected:?}, module reports {actual:?}")]
    ModuleNumberMismatch {
        /// Module number declared by the vendor header.
        expected: String,
        /// Module number read back from the device.
        actual: String,
    },

    /// Neither the application nor the bootloader context produced a
    /// usable module number within the verification deadline.
    #[error("Module number verification timed out")]
    VerifyTimeout,
}

/// Protocol steps of the legacy bootloader sequence, named so callers can
/// tell which step timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeStep {
    /// Bootloader unlock handshake (opcode 0x10).
    Unlock,
    /// Image slot selection (opcode 0x11).
    ChooseImage,
    /// Flash destination address (opcode 0x12).
    FlashAddr,
    /// Total file size announcement (opcode 0x13).
    SendFileSize,
    /// File CRC-32 announcement (opcode 0x14).
    SendFileCrc,
    /// Family-specific backup command.
    BackupData,
    /// Flash erase (opcode 0x20).
    EraseFlash,
    /// A data block transfer (opcode 0x21).
    WriteData,
    /// CRC validation read-back (opcode 0x22).
    ValidateCrc,
}

impl std::fmt::Display for UpgradeStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unlock => "bootloader unlock",
            Self::ChooseImage => "choose image",
            Self::FlashAddr => "flash address",
            Self::SendFileSize => "send file size",
            Self::SendFileCrc => "send file CRC32",
            Self::BackupData => "backup data",
            Self::EraseFlash => "erase flash",
            Self::WriteData => "write data",
            Self::ValidateCrc => "validate CRC32",
        };
        f.write_str(name)
    }
}

/// Human-readable text for a CDB status register value.
pub fn cdb_status_message(code: u8) -> &'static str {
    match code {
        0x01 => "Success",
        0x40 => "Failed",
        0x41 => "CMD Code unknown",
        0x42 => "Parameter range error or not supported",
        0x43 => "Previous CMD was not aborted",
        0x44 => "CMD checking time out",
        0x45 => "CdbChkCode error",
        0x46 => "Insufficient privilege",
        _ => "Unknown status",
    }
}
