//! Legacy vendor bootloader upgrade engine.
//!
//! Drives the proprietary single-opcode-per-command bootloader protocol:
//! unlock, image selection, size/CRC announcement, family-specific
//! backup, erase, chunked transfer, validation and jump. Every step
//! writes a command frame and then polls the same address for an
//! expected echo; see [`crate::protocol::legacy`] for the frame formats.
//!
//! The engine is generic over the transport and the clock, so tests can
//! run the full sequence against stubs without real hardware or delay.

use crate::engine::{Progress, UpgradeEngine};
use crate::error::{CompatibilityError, Error, Result, UpgradeStep};
use crate::image::FirmwareImage;
use crate::image::vendor::printable_upper;
use crate::protocol::crc::crc32_ieee;
use crate::protocol::legacy::{BLOCK_SIZE, CommandFrame, DEFAULT_PASSWORD, Opcode};
use crate::retry::{Clock, RetryPolicy, SystemClock};
use crate::transport::Transport;
use log::{debug, info, trace};
use std::time::Duration;

/// Management map slave address (application context).
pub const APP_ADDR: u8 = 0xA0;

/// Bootloader slave address.
pub const BOOTLOADER_ADDR: u8 = 0x36;

/// Page select register on the management map.
const PAGE_SELECT_REG: u8 = 0x7F;

/// Upper page carrying the module number.
const MODULE_INFO_PAGE: u8 = 0xF0;

/// Module number register within [`MODULE_INFO_PAGE`].
const MODULE_NUMBER_REG: u8 = 0xC0;

/// Fixed password that opens the module-number register page.
const MODULE_QUERY_PASSWORD: [u8; 4] = [0xC1, 0x4D, 0x41, 0x5A];

/// Bytes of module number read back from the device.
const MODULE_NUMBER_LEN: usize = 32;

/// Cadence of every acknowledgement poll.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Default acknowledgement deadline for quick steps.
const ACK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Acknowledgement deadline for one data block.
const DATA_ACK_TIMEOUT: Duration = Duration::from_millis(100);

/// Deadline for module-number verification.
const VERIFY_TIMEOUT: Duration = Duration::from_secs(20);

/// Pause between module-number polls.
const VERIFY_POLL: Duration = Duration::from_secs(1);

/// Deadline for the unlock handshake.
const UNLOCK_TIMEOUT: Duration = Duration::from_secs(20);

/// Pause between the bootloader-context query and its answer.
const BOOTLOADER_QUERY_DELAY: Duration = Duration::from_millis(40);

/// Pause between the password write and the unlock frame.
const UNLOCK_PASSWORD_DELAY: Duration = Duration::from_millis(10);

/// Pause between the unlock frame and its acknowledgement read.
const UNLOCK_ACK_DELAY: Duration = Duration::from_millis(500);

/// Firmware families the legacy bootloader can flash.
///
/// The family decides which firmware-type names an image may carry and
/// the family-specific backup command and step deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FirmwareFamily {
    /// DSP firmware (type names starting with `DSP`).
    #[default]
    Dsp,
}

impl FirmwareFamily {
    /// Whether this family accepts the given firmware type name.
    pub fn accepts(&self, type_name: &str) -> bool {
        match self {
            Self::Dsp => type_name.starts_with("DSP"),
        }
    }

    /// The pre-erase backup command and its deadline, if the family
    /// has one.
    pub fn backup_command(&self) -> Option<(Opcode, Duration)> {
        match self {
            Self::Dsp => Some((Opcode::DspBackup, Duration::from_secs(20))),
        }
    }

    /// Deadline for the erase acknowledgement.
    pub fn erase_timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    /// Deadline for the CRC validation read-back.
    pub fn validate_timeout(&self) -> Duration {
        match self {
            Self::Dsp => Duration::from_secs(10),
        }
    }

    /// Get the family from a string name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "dsp" => Some(Self::Dsp),
            _ => None,
        }
    }
}

impl std::fmt::Display for FirmwareFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dsp => write!(f, "DSP"),
        }
    }
}

/// Legacy bootloader upgrade engine.
///
/// Generic over the transport `T` and the clock `C`; the clock must be
/// cloneable so the whole-sequence retry wrapper can sleep while the
/// engine is borrowed.
pub struct LegacyBootloaderEngine<T: Transport, C: Clock + Clone = SystemClock> {
    transport: T,
    clock: C,
    image: FirmwareImage,
    family: FirmwareFamily,
    password: u32,
    retry: Option<RetryPolicy>,
    unlocked: bool,
}

impl<T: Transport> LegacyBootloaderEngine<T, SystemClock> {
    /// Create an engine over real wall-clock time.
    pub fn new(transport: T, image: FirmwareImage, family: FirmwareFamily) -> Self {
        Self::with_clock(transport, image, family, SystemClock)
    }
}

impl<T: Transport, C: Clock + Clone> LegacyBootloaderEngine<T, C> {
    /// Create an engine with an explicit clock (used by tests).
    pub fn with_clock(transport: T, image: FirmwareImage, family: FirmwareFamily, clock: C) -> Self {
        Self {
            transport,
            clock,
            image,
            family,
            password: DEFAULT_PASSWORD,
            retry: Some(RetryPolicy::default()),
            unlocked: false,
        }
    }

    /// Override the bootloader unlock password.
    #[must_use]
    pub fn with_password(mut self, password: u32) -> Self {
        self.password = password;
        self
    }

    /// Enable or disable the whole-sequence retry wrapper.
    ///
    /// When disabled the step sequence runs exactly once; both branches
    /// call the same underlying sequence.
    #[must_use]
    pub fn with_retry(mut self, enabled: bool) -> Self {
        self.retry = enabled.then(RetryPolicy::default);
        self
    }

    /// Consume the engine and return the underlying transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// The image this engine was created for.
    pub fn image(&self) -> &FirmwareImage {
        &self.image
    }

    fn interrupted(&self) -> Result<()> {
        if crate::is_interrupt_requested() {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Password register on the management map; 100G/50G modules moved
    /// it up by one.
    fn password_reg(&self) -> u8 {
        let module = &self.image.header.module_number;
        if module.contains("100G") || module.contains("50G") {
            0x7B
        } else {
            0x7A
        }
    }

    /// Poll `addr` for an expected echo at a 25 ms cadence.
    fn check_cmd(&mut self, addr: u8, expects: &[u8], cmd: u8, timeout: Duration) -> Result<bool> {
        let deadline = self.clock.now() + timeout;
        while self.clock.now() < deadline {
            self.clock.sleep(POLL_INTERVAL);
            let data = self
                .transport
                .read(addr, None, expects.len(), Some(cmd))?;
            if data == expects {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Write a command frame and await its opcode echo.
    fn command_step(
        &mut self,
        frame: &CommandFrame,
        step: UpgradeStep,
        timeout: Duration,
    ) -> Result<()> {
        let opcode = frame.opcode() as u8;
        trace!("step {step}: sending opcode {opcode:#04x}");
        self.transport
            .write(BOOTLOADER_ADDR, None, &frame.build())?;
        if self.check_cmd(BOOTLOADER_ADDR, &[opcode], opcode, timeout)? {
            Ok(())
        } else {
            Err(Error::StepTimeout(step))
        }
    }

    /// A module-number response is authoritative once it is non-empty
    /// and neither all-`0xFF` nor all-`0x00`. Uniform filler keeps the
    /// poll going; whether that masks a genuine failure is an open
    /// question inherited from the original protocol.
    fn is_authoritative(data: &[u8]) -> bool {
        !data.is_empty()
            && !data.iter().all(|&b| b == 0xFF)
            && !data.iter().all(|&b| b == 0x00)
    }

    fn query_module_number_app(&mut self) -> Result<Vec<u8>> {
        let reg = self.password_reg();
        self.transport
            .write(APP_ADDR, Some(reg), &MODULE_QUERY_PASSWORD)?;
        self.transport
            .write(APP_ADDR, Some(PAGE_SELECT_REG), &[MODULE_INFO_PAGE])?;
        self.transport
            .read(APP_ADDR, Some(MODULE_NUMBER_REG), MODULE_NUMBER_LEN, None)
    }

    fn query_module_number_bootloader(&mut self) -> Result<Vec<u8>> {
        self.transport.write(
            BOOTLOADER_ADDR,
            None,
            &CommandFrame::module_number_query().build(),
        )?;
        self.clock.sleep(BOOTLOADER_QUERY_DELAY);
        self.transport.read(
            BOOTLOADER_ADDR,
            None,
            MODULE_NUMBER_LEN,
            Some(Opcode::ModuleNumber as u8),
        )
    }

    /// Poll the live module number from either context and compare it
    /// against the header, for up to 20 seconds.
    fn verify_module_number(&mut self) -> Result<()> {
        let expected = self.image.header.module_number.clone();
        let deadline = self.clock.now() + VERIFY_TIMEOUT;

        while self.clock.now() < deadline {
            let app = self.query_module_number_app()?;
            if Self::is_authoritative(&app) {
                return Self::compare_module_number(&expected, &app);
            }

            let boot = self.query_module_number_bootloader()?;
            if Self::is_authoritative(&boot) {
                return Self::compare_module_number(&expected, &boot);
            }

            self.clock.sleep(VERIFY_POLL);
        }

        Err(CompatibilityError::VerifyTimeout.into())
    }

    fn compare_module_number(expected: &str, raw: &[u8]) -> Result<()> {
        let actual = printable_upper(raw);
        if actual == expected {
            debug!("module number verified: {actual}");
            Ok(())
        } else {
            Err(CompatibilityError::ModuleNumberMismatch {
                expected: expected.to_string(),
                actual,
            }
            .into())
        }
    }

    /// Unlock the bootloader: password, `BOOT` magic, ACK poll.
    fn unlock_bootloader(&mut self) -> Result<()> {
        info!("Unlocking bootloader...");
        let deadline = self.clock.now() + UNLOCK_TIMEOUT;
        let unlock = CommandFrame::unlock().build();

        while self.clock.now() < deadline {
            let reg = self.password_reg();
            self.transport
                .write(APP_ADDR, Some(reg), &self.password.to_be_bytes())?;
            self.clock.sleep(UNLOCK_PASSWORD_DELAY);

            self.transport.write(BOOTLOADER_ADDR, None, &unlock)?;
            self.clock.sleep(UNLOCK_ACK_DELAY);

            let ack = self
                .transport
                .read(BOOTLOADER_ADDR, None, 1, Some(Opcode::Unlock as u8))?;
            if ack == [Opcode::Unlock as u8] {
                self.unlocked = true;
                debug!("bootloader unlocked");
                return Ok(());
            }
        }

        Err(Error::StepTimeout(UpgradeStep::Unlock))
    }

    /// The retried body: everything between unlock and jump.
    fn upgrade_sequence(&mut self, progress: Progress<'_>) -> Result<()> {
        let padded = self.image.padded_payload(BLOCK_SIZE);
        #[allow(clippy::cast_possible_truncation)] // images are < 4 GB
        let file_size = padded.len() as u32;
        let file_crc = crc32_ieee(&padded);
        let slot = self.image.header.image_slot();
        let offset = self.image.header.offset_addr;

        self.interrupted()?;
        self.command_step(
            &CommandFrame::choose_image(slot),
            UpgradeStep::ChooseImage,
            ACK_TIMEOUT,
        )?;
        self.command_step(
            &CommandFrame::flash_addr(offset),
            UpgradeStep::FlashAddr,
            ACK_TIMEOUT,
        )?;
        self.command_step(
            &CommandFrame::file_size(file_size),
            UpgradeStep::SendFileSize,
            ACK_TIMEOUT,
        )?;
        self.command_step(
            &CommandFrame::file_crc(file_crc),
            UpgradeStep::SendFileCrc,
            ACK_TIMEOUT,
        )?;

        if let Some((opcode, timeout)) = self.family.backup_command() {
            info!("Backing up data...");
            self.interrupted()?;
            self.command_step(&CommandFrame::backup(opcode), UpgradeStep::BackupData, timeout)?;
        }

        info!("Erasing flash...");
        self.interrupted()?;
        self.command_step(
            &CommandFrame::erase(),
            UpgradeStep::EraseFlash,
            self.family.erase_timeout(),
        )?;

        info!("Sending data... ({file_size} bytes)");
        self.send_file_data(&padded, progress)?;

        info!("Validating...");
        self.interrupted()?;
        self.validate_crc(file_crc)?;
        Ok(())
    }

    /// Transfer the padded payload in 256-byte blocks, sequence numbers
    /// starting at 1, each acknowledged within 100 ms.
    fn send_file_data(&mut self, padded: &[u8], progress: Progress<'_>) -> Result<()> {
        let total = padded.len();
        for (index, chunk) in padded.chunks(BLOCK_SIZE).enumerate() {
            self.interrupted()?;
            #[allow(clippy::cast_possible_truncation)] // < 65536 blocks per image
            let seq = (index + 1) as u16;
            let frame = CommandFrame::data_block(seq, chunk).build();
            self.transport.write(BOOTLOADER_ADDR, None, &frame)?;

            let opcode = Opcode::WriteData as u8;
            if !self.check_cmd(BOOTLOADER_ADDR, &[opcode], opcode, DATA_ACK_TIMEOUT)? {
                return Err(Error::StepTimeout(UpgradeStep::WriteData));
            }

            progress((index + 1) * BLOCK_SIZE, total);
        }
        Ok(())
    }

    /// Ask the bootloader to validate the flashed CRC; the expected echo
    /// is the literal CRC-32 bytes rather than the opcode.
    fn validate_crc(&mut self, file_crc: u32) -> Result<()> {
        self.transport
            .write(BOOTLOADER_ADDR, None, &CommandFrame::validate().build())?;
        let expects = file_crc.to_be_bytes();
        if self.check_cmd(
            BOOTLOADER_ADDR,
            &expects,
            Opcode::ValidateCrc as u8,
            self.family.validate_timeout(),
        )? {
            Ok(())
        } else {
            Err(Error::StepTimeout(UpgradeStep::ValidateCrc))
        }
    }

    /// Jump into the freshly written image. Fire-and-forget.
    fn jump_to_image(&mut self) -> Result<()> {
        info!("Jumping to new image");
        self.transport
            .write(BOOTLOADER_ADDR, None, &CommandFrame::jump().build())
    }

    /// Reset back to the pre-upgrade image. Fire-and-forget.
    pub fn reset(&mut self) -> Result<()> {
        self.transport
            .write(BOOTLOADER_ADDR, None, &CommandFrame::reset().build())
    }
}

impl<T: Transport, C: Clock + Clone> UpgradeEngine for LegacyBootloaderEngine<T, C> {
    fn verify(&mut self) -> Result<()> {
        let type_name = self.image.header.firmware_type_name.clone();
        if !self.family.accepts(&type_name) {
            return Err(CompatibilityError::UnsupportedFirmwareType(type_name).into());
        }
        self.verify_module_number()
    }

    fn authenticate(&mut self) -> Result<()> {
        self.unlock_bootloader()
    }

    fn transfer_image(&mut self, progress: Progress<'_>) -> Result<()> {
        let result = match self.retry {
            Some(policy) => {
                let mut clock = self.clock.clone();
                policy.run(&mut clock, || self.upgrade_sequence(&mut *progress))
            },
            None => self.upgrade_sequence(progress),
        };

        if let Err(e) = result {
            // Leave the device on its pre-upgrade image rather than
            // mid-flash.
            if self.unlocked {
                let _ = self.reset();
            }
            return Err(e);
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.jump_to_image()
    }
}
