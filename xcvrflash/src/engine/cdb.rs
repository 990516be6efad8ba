//! CMIS CDB firmware upgrade engine.
//!
//! Drives a firmware download over the standard CMIS Command Data Block
//! mechanism: feature negotiation, optional password, start-download
//! with the vendor header, block transfer through the extended payload
//! pages (or the slower LPL-only path), completion and an optional
//! run/commit step. See [`crate::protocol::cdb`] for the command and
//! parameter block formats.
//!
//! Unlike the legacy bootloader, the module itself knows the image
//! header size: it is negotiated through the firmware-features command
//! rather than assumed, so the engine takes the raw file bytes and
//! splits them only after talking to the device.

use crate::engine::{FinalizeMode, Progress, UpgradeEngine};
use crate::error::{Error, Result};
use crate::image::split_raw;
use crate::protocol::cdb::{
    CDB_COMMAND_REG, CDB_COMPLETE_FLAG, CDB_FLAG_REG, CDB_PAGE, CDB_PARAM_REG, CDB_REPLY_REG,
    CDB_STATUS_REG, CDB_STATUS_SUCCESS, CdbCommand, DEFAULT_PASSWORD, EPL_PAGE_BASE,
    EPL_PAGE_SIZE, LPL_CHUNK_SIZE, PAGE_SELECT_REG,
};
use crate::retry::{Clock, SystemClock};
use crate::transport::Transport;
use log::{debug, info, trace};
use std::time::Duration;

/// Management map slave address.
pub const MODULE_ADDR: u8 = 0xA0;

/// Pause between the parameter block write and the command code write.
const CODE_WRITE_DELAY: Duration = Duration::from_millis(50);

/// Cadence of completion flag polls.
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(40);

/// Deadline for quick commands (password, features, block writes).
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for the start-download command.
const START_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for the complete-download command.
const COMPLETE_TIMEOUT: Duration = Duration::from_secs(20);

/// Deadline for the module to come back after a restart.
const REBOOT_TIMEOUT: Duration = Duration::from_secs(40);

/// Longest pause between reboot probes.
const REBOOT_PROBE_CAP: Duration = Duration::from_secs(4);

/// Tuning knobs for a CDB upgrade run.
#[derive(Debug, Clone, Copy)]
pub struct CdbOptions {
    /// Host password entered before the download, if any.
    pub password: Option<u32>,
    /// What to do with the image once transferred.
    pub finalize: FinalizeMode,
    /// Force the LPL-only transfer path even when the module supports
    /// the extended payload pages.
    pub lpl_only: bool,
}

impl Default for CdbOptions {
    fn default() -> Self {
        Self {
            password: Some(DEFAULT_PASSWORD),
            finalize: FinalizeMode::None,
            lpl_only: false,
        }
    }
}

/// Capabilities negotiated through the firmware-features command.
#[derive(Debug, Clone, Copy)]
struct CdbFeatures {
    /// Vendor header size expected by the start-download command.
    header_len: usize,
    /// Write block size for the extended payload path.
    block_size: usize,
}

/// CMIS CDB upgrade engine.
pub struct CdbEngine<T: Transport, C: Clock + Clone = SystemClock> {
    transport: T,
    clock: C,
    raw: Vec<u8>,
    options: CdbOptions,
    features: Option<CdbFeatures>,
}

impl<T: Transport> CdbEngine<T, SystemClock> {
    /// Create an engine over real wall-clock time.
    pub fn new(transport: T, raw_image: Vec<u8>, options: CdbOptions) -> Self {
        Self::with_clock(transport, raw_image, options, SystemClock)
    }
}

impl<T: Transport, C: Clock + Clone> CdbEngine<T, C> {
    /// Create an engine with an explicit clock (used by tests).
    pub fn with_clock(transport: T, raw_image: Vec<u8>, options: CdbOptions, clock: C) -> Self {
        Self {
            transport,
            clock,
            raw: raw_image,
            options,
            features: None,
        }
    }

    /// Consume the engine and return the underlying transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    fn interrupted(&self) -> Result<()> {
        if crate::is_interrupt_requested() {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }

    fn select_page(&mut self, page: u8) -> Result<()> {
        self.transport
            .write(MODULE_ADDR, Some(PAGE_SELECT_REG), &[page])
    }

    /// Write the parameter block, then the command code; the second code
    /// byte triggers execution.
    fn send_command(&mut self, cmd: &CdbCommand) -> Result<()> {
        trace!("CDB command {:#06x}", cmd.code());
        self.transport
            .write(MODULE_ADDR, Some(CDB_PARAM_REG), &cmd.param_block())?;
        self.clock.sleep(CODE_WRITE_DELAY);
        self.transport
            .write(MODULE_ADDR, Some(CDB_COMMAND_REG), &cmd.code_bytes())
    }

    /// Poll the completion flag, then the status register, until the
    /// command reports success or the deadline passes. Modules flip
    /// through transient status codes while working, so a non-success
    /// code is an error only once the deadline has passed: a code at
    /// the deadline is [`Error::CdbStatus`], an unanswered status read
    /// is [`Error::CdbBusy`], and a flag that never raised at all is
    /// [`Error::CommandNotCompleted`].
    fn check_cdb_status(&mut self, timeout: Duration) -> Result<()> {
        let deadline = self.clock.now() + timeout;

        loop {
            self.clock.sleep(STATUS_POLL_INTERVAL);
            let expired = self.clock.now() > deadline;
            let flags = self.transport.read(MODULE_ADDR, Some(CDB_FLAG_REG), 1, None)?;
            if flags.first().is_some_and(|f| f & CDB_COMPLETE_FLAG != 0) {
                break;
            }
            if expired {
                return Err(Error::CommandNotCompleted);
            }
        }

        let mut expired = self.clock.now() > deadline;
        loop {
            let status = self
                .transport
                .read(MODULE_ADDR, Some(CDB_STATUS_REG), 1, None)?;
            match status.first() {
                Some(&CDB_STATUS_SUCCESS) => return Ok(()),
                Some(&code) if expired => return Err(Error::CdbStatus { code }),
                None if expired => return Err(Error::CdbBusy),
                _ => {},
            }
            self.clock.sleep(STATUS_POLL_INTERVAL);
            expired = self.clock.now() > deadline;
        }
    }

    fn execute(&mut self, cmd: &CdbCommand, timeout: Duration) -> Result<()> {
        self.send_command(cmd)?;
        self.check_cdb_status(timeout)
    }

    /// Query the firmware management features and split the raw file
    /// using the header size the module reports.
    fn negotiate_features(&mut self) -> Result<CdbFeatures> {
        if let Some(features) = self.features {
            return Ok(features);
        }

        self.select_page(CDB_PAGE)?;
        self.execute(&CdbCommand::firmware_features(), COMMAND_TIMEOUT)?;
        let reply = self
            .transport
            .read(MODULE_ADDR, Some(CDB_REPLY_REG), 3, None)?;
        if reply.len() < 3 {
            return Err(Error::CommandNotCompleted);
        }

        let features = CdbFeatures {
            header_len: usize::from(reply[0]),
            block_size: (usize::from(reply[2]) + 1) * 8,
        };
        debug!(
            "CDB features: header {} bytes, write block {} bytes",
            features.header_len, features.block_size
        );

        // Fail early if the file is too short for the negotiated header.
        split_raw(&self.raw, features.header_len)?;

        self.features = Some(features);
        Ok(features)
    }

    /// Stage one block in the extended payload pages, then commit it.
    fn write_epl_block(&mut self, block: &[u8], addr: u32) -> Result<()> {
        for (page_index, slice) in block.chunks(EPL_PAGE_SIZE).enumerate() {
            #[allow(clippy::cast_possible_truncation)] // at most 16 EPL pages
            self.select_page(EPL_PAGE_BASE + page_index as u8)?;
            self.transport
                .write(MODULE_ADDR, Some(CDB_COMMAND_REG), slice)?;
        }
        self.select_page(CDB_PAGE)?;
        #[allow(clippy::cast_possible_truncation)] // block size is (255+1)*8 at most
        self.execute(&CdbCommand::write_epl(block.len() as u16, addr), COMMAND_TIMEOUT)
    }

    fn transfer_epl(&mut self, payload: &[u8], block_size: usize, progress: Progress<'_>) -> Result<()> {
        let mut padded = payload.to_vec();
        let blocks = payload.len().div_ceil(block_size);
        padded.resize(blocks * block_size, 0xFF);

        for (index, block) in padded.chunks(block_size).enumerate() {
            self.interrupted()?;
            #[allow(clippy::cast_possible_truncation)] // images are < 4 GB
            let addr = (index * block_size) as u32;
            self.write_epl_block(block, addr)?;
            progress(((index + 1) * block_size).min(payload.len()), payload.len());
        }
        Ok(())
    }

    fn transfer_lpl(&mut self, payload: &[u8], progress: Progress<'_>) -> Result<()> {
        let mut sent = 0usize;
        for chunk in payload.chunks(LPL_CHUNK_SIZE) {
            self.interrupted()?;
            #[allow(clippy::cast_possible_truncation)] // images are < 4 GB
            let addr = sent as u32;
            self.execute(&CdbCommand::write_lpl(addr, chunk), COMMAND_TIMEOUT)?;
            sent += chunk.len();
            progress(sent, payload.len());
        }
        Ok(())
    }

    /// Wait for the module to answer reads again after a restart,
    /// probing with a doubling backoff.
    fn wait_reboot(&mut self) -> Result<()> {
        let deadline = self.clock.now() + REBOOT_TIMEOUT;
        let mut delay = Duration::from_secs(1);

        while self.clock.now() < deadline {
            self.clock.sleep(delay);
            let probe = self.transport.read(MODULE_ADDR, Some(0x00), 1, None)?;
            if !probe.is_empty() {
                debug!("module answered after restart");
                return Ok(());
            }
            delay = (delay * 2).min(REBOOT_PROBE_CAP);
        }

        Err(Error::RebootTimeout)
    }

    fn enter_password(&mut self) -> Result<()> {
        if let Some(password) = self.options.password {
            self.execute(&CdbCommand::password(password), COMMAND_TIMEOUT)?;
        }
        Ok(())
    }
}

impl<T: Transport, C: Clock + Clone> UpgradeEngine for CdbEngine<T, C> {
    fn verify(&mut self) -> Result<()> {
        self.negotiate_features().map(|_| ())
    }

    fn authenticate(&mut self) -> Result<()> {
        self.select_page(CDB_PAGE)?;
        self.enter_password()
    }

    fn transfer_image(&mut self, progress: Progress<'_>) -> Result<()> {
        let features = self.negotiate_features()?;
        let (header, payload) = {
            let (header, payload) = split_raw(&self.raw, features.header_len)?;
            (header.to_vec(), payload.to_vec())
        };

        info!("Starting download... ({} bytes)", payload.len());
        self.interrupted()?;
        self.select_page(CDB_PAGE)?;
        // The declared size covers the vendor header as well as the
        // payload blocks that follow it.
        #[allow(clippy::cast_possible_truncation)] // images are < 4 GB
        let image_size = self.raw.len() as u32;
        self.execute(&CdbCommand::start_download(image_size, &header), START_TIMEOUT)?;

        info!("Sending data...");
        if self.options.lpl_only {
            self.transfer_lpl(&payload, progress)?;
        } else {
            self.transfer_epl(&payload, features.block_size, progress)?;
        }

        info!("Completing download...");
        self.interrupted()?;
        self.execute(&CdbCommand::complete_download(), COMPLETE_TIMEOUT)
    }

    fn finalize(&mut self) -> Result<()> {
        match self.options.finalize {
            FinalizeMode::None => Ok(()),
            FinalizeMode::Run { hitless } => {
                info!("Running new image ({})", if hitless { "hitless" } else { "full reset" });
                // Fire-and-forget: the module restarts into the new
                // image and stops answering.
                self.send_command(&CdbCommand::run_image(u8::from(hitless)))
            },
            FinalizeMode::Commit => {
                info!("Waiting for module reboot...");
                self.wait_reboot()?;
                self.select_page(CDB_PAGE)?;
                self.enter_password()?;
                info!("Committing image");
                self.execute(&CdbCommand::commit_image(), COMMAND_TIMEOUT)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::vendor::build_test_image;
    use crate::retry::testing::VirtualClock;

    /// Scripted CMIS module double: page-aware register map, decoded
    /// command log, configurable completion behavior.
    struct FakeModule {
        page: u8,
        flag: u8,
        status: Option<u8>,
        features_reply: [u8; 3],
        answers_probe: bool,
        commands: Vec<u16>,
        writes: Vec<(u8, u8, Vec<u8>)>,
    }

    impl FakeModule {
        /// A module that completes every command successfully on the
        /// first poll. Header 64 bytes, write block (15 + 1) * 8 = 128.
        fn healthy() -> Self {
            Self {
                page: 0,
                flag: CDB_COMPLETE_FLAG,
                status: Some(CDB_STATUS_SUCCESS),
                features_reply: [64, 0, 15],
                answers_probe: true,
                commands: Vec::new(),
                writes: Vec::new(),
            }
        }

        /// A module that never raises the completion flag.
        fn silent() -> Self {
            let mut fake = Self::healthy();
            fake.flag = 0x00;
            fake
        }

        /// A module whose completion flag raises but whose status
        /// register never answers.
        fn busy() -> Self {
            let mut fake = Self::healthy();
            fake.status = None;
            fake
        }

        fn with_status(status: u8) -> Self {
            let mut fake = Self::healthy();
            fake.status = Some(status);
            fake
        }

        /// Data slices staged in the EPL pages, with the page they were
        /// written to.
        fn epl_writes(&self) -> Vec<(u8, usize)> {
            self.writes
                .iter()
                .filter(|(page, reg, _)| *page >= EPL_PAGE_BASE && *reg == CDB_COMMAND_REG)
                .map(|(page, _, data)| (*page, data.len()))
                .collect()
        }
    }

    impl Transport for FakeModule {
        fn write(&mut self, _slave_addr: u8, reg_addr: Option<u8>, data: &[u8]) -> Result<()> {
            let reg = reg_addr.unwrap_or(0);
            if reg == PAGE_SELECT_REG {
                self.page = data[0];
            }
            if reg == CDB_COMMAND_REG && self.page == CDB_PAGE && data.len() == 2 {
                self.commands.push(u16::from_be_bytes([data[0], data[1]]));
            }
            self.writes.push((self.page, reg, data.to_vec()));
            Ok(())
        }

        fn read(
            &mut self,
            _slave_addr: u8,
            reg_addr: Option<u8>,
            count: usize,
            _cmd: Option<u8>,
        ) -> Result<Vec<u8>> {
            match reg_addr {
                Some(CDB_FLAG_REG) => Ok(vec![self.flag]),
                Some(CDB_STATUS_REG) => Ok(self.status.map_or_else(Vec::new, |s| vec![s])),
                Some(CDB_REPLY_REG) => Ok(self.features_reply[..count.min(3)].to_vec()),
                Some(0x00) if self.answers_probe => Ok(vec![0x07]),
                _ => Ok(Vec::new()),
            }
        }
    }

    fn engine_with(
        fake: FakeModule,
        payload_len: usize,
        options: CdbOptions,
    ) -> CdbEngine<FakeModule, VirtualClock> {
        let raw = build_test_image(&vec![0x42; payload_len], "DSP-LR4", "XCVR-400G-DR4");
        CdbEngine::with_clock(fake, raw, options, VirtualClock::new())
    }

    #[test]
    fn test_end_to_end_epl_upgrade() {
        let mut engine = engine_with(FakeModule::healthy(), 1024, CdbOptions::default());
        let mut progress = Vec::new();
        engine.run(&mut |done, total| progress.push((done, total))).unwrap();

        // Features, password, start, 8 block commits, complete.
        let commands = &engine.transport.commands;
        assert_eq!(commands[0], 0x0041);
        assert_eq!(commands[1], 0x0001);
        assert_eq!(commands[2], 0x0101);
        assert_eq!(commands[3..11], [0x0104; 8]);
        assert_eq!(*commands.last().unwrap(), 0x0107);

        // 1024 bytes at a 128-byte block = 8 blocks, one EPL page each.
        let epl = engine.transport.epl_writes();
        assert_eq!(epl.len(), 8);
        assert!(epl.iter().all(|&(page, len)| page == EPL_PAGE_BASE && len == 128));

        assert_eq!(progress.first(), Some(&(128, 1024)));
        assert_eq!(progress.last(), Some(&(1024, 1024)));
    }

    #[test]
    fn test_epl_block_addresses_increment() {
        let mut engine = engine_with(FakeModule::healthy(), 300, CdbOptions::default());
        engine.run(&mut |_, _| {}).unwrap();

        // 300 bytes pad to 384 = 3 blocks at addresses 0, 128, 256.
        let addrs: Vec<u32> = engine
            .transport
            .writes
            .iter()
            .filter(|(page, reg, data)| {
                *page == CDB_PAGE && *reg == CDB_PARAM_REG && data.len() == 10 && data[0..2] != [0, 0]
            })
            .map(|(_, _, data)| u32::from_be_bytes([data[6], data[7], data[8], data[9]]))
            .collect();
        assert_eq!(addrs, vec![0, 128, 256]);
    }

    #[test]
    fn test_large_negotiated_block_spans_epl_pages() {
        // Capability byte 31 negotiates (31 + 1) * 8 = 256-byte blocks,
        // which need two 128-byte EPL pages each.
        let mut fake = FakeModule::healthy();
        fake.features_reply = [64, 0, 31];
        let mut engine = engine_with(fake, 2048, CdbOptions::default());
        engine.run(&mut |_, _| {}).unwrap();

        let epl = engine.transport.epl_writes();
        // 2048 / 256 = 8 blocks, two page writes per block.
        assert_eq!(epl.len(), 16);
        assert!(epl.iter().all(|&(_, len)| len == 128));
        let pages: Vec<u8> = epl.iter().map(|&(page, _)| page).collect();
        assert_eq!(&pages[..2], &[EPL_PAGE_BASE, EPL_PAGE_BASE + 1]);
    }

    #[test]
    fn test_lpl_only_path() {
        let options = CdbOptions {
            lpl_only: true,
            ..CdbOptions::default()
        };
        let mut engine = engine_with(FakeModule::healthy(), 1024, options);
        engine.run(&mut |_, _| {}).unwrap();

        // 1024 bytes in 116-byte chunks: 8 full chunks + 96 bytes.
        let lpl_writes = engine
            .transport
            .commands
            .iter()
            .filter(|&&code| code == 0x0103)
            .count();
        assert_eq!(lpl_writes, 9);
        assert!(engine.transport.epl_writes().is_empty());
    }

    #[test]
    fn test_never_completing_command_times_out() {
        let mut engine = engine_with(FakeModule::silent(), 128, CdbOptions::default());
        let err = engine.verify().unwrap_err();
        assert!(matches!(err, Error::CommandNotCompleted));
        // The engine must give up only once the deadline has passed.
        assert!(engine.clock.total_slept() >= COMMAND_TIMEOUT);
    }

    #[test]
    fn test_unanswered_status_reads_report_busy() {
        let mut engine = engine_with(FakeModule::busy(), 128, CdbOptions::default());
        let err = engine.verify().unwrap_err();
        assert!(matches!(err, Error::CdbBusy));
        assert!(engine.clock.total_slept() >= COMMAND_TIMEOUT);
    }

    #[test]
    fn test_failure_status_carries_code() {
        let mut engine = engine_with(FakeModule::with_status(0x46), 128, CdbOptions::default());
        let err = engine.verify().unwrap_err();
        assert!(matches!(err, Error::CdbStatus { code: 0x46 }));
        // A failure code counts only once the deadline has passed.
        assert!(engine.clock.total_slept() >= COMMAND_TIMEOUT);
    }

    #[test]
    fn test_start_download_declares_whole_file_size() {
        let mut engine = engine_with(FakeModule::healthy(), 1024, CdbOptions::default());
        engine.run(&mut |_, _| {}).unwrap();

        // 64-byte header + 1024-byte payload + the 8 leading parameter
        // bytes of the download itself.
        let start_param = engine
            .transport
            .writes
            .iter()
            .find(|(page, reg, data)| {
                *page == CDB_PAGE && *reg == CDB_PARAM_REG && data.len() == 78
            })
            .cloned()
            .unwrap();
        assert_eq!(&start_param.2[6..10], &1096u32.to_be_bytes());
    }

    #[test]
    fn test_no_password_skips_command() {
        let options = CdbOptions {
            password: None,
            ..CdbOptions::default()
        };
        let mut engine = engine_with(FakeModule::healthy(), 128, options);
        engine.run(&mut |_, _| {}).unwrap();
        assert!(!engine.transport.commands.contains(&0x0001));
    }

    #[test]
    fn test_finalize_run_is_fire_and_forget() {
        let options = CdbOptions {
            finalize: FinalizeMode::Run { hitless: true },
            ..CdbOptions::default()
        };
        let mut engine = engine_with(FakeModule::healthy(), 128, options);
        engine.run(&mut |_, _| {}).unwrap();

        assert_eq!(*engine.transport.commands.last().unwrap(), 0x0109);
        // Hitless restart requested through the reset-mode byte.
        let run_param = engine
            .transport
            .writes
            .iter()
            .rev()
            .find(|(page, reg, _)| *page == CDB_PAGE && *reg == CDB_PARAM_REG)
            .cloned()
            .unwrap();
        assert_eq!(&run_param.2[6..10], &[0x00, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_finalize_commit_waits_for_reboot() {
        let options = CdbOptions {
            finalize: FinalizeMode::Commit,
            ..CdbOptions::default()
        };
        let mut engine = engine_with(FakeModule::healthy(), 128, options);
        engine.run(&mut |_, _| {}).unwrap();

        let commands = &engine.transport.commands;
        assert_eq!(*commands.last().unwrap(), 0x010A);
        // Password is entered again after the reboot.
        let passwords = commands.iter().filter(|&&c| c == 0x0001).count();
        assert_eq!(passwords, 2);
        // At least one reboot probe delay.
        assert!(engine.clock.total_slept() >= Duration::from_secs(1));
    }

    #[test]
    fn test_file_shorter_than_negotiated_header_rejected() {
        let mut engine = CdbEngine::with_clock(
            FakeModule::healthy(),
            vec![0x00; 32],
            CdbOptions::default(),
            VirtualClock::new(),
        );
        let err = engine.verify().unwrap_err();
        assert!(matches!(err, Error::FileFormat(_)));
    }
}
