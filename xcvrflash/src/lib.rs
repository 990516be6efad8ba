//! # xcvrflash
//!
//! A library for upgrading the firmware of pluggable optical transceiver
//! modules over their I2C management interface.
//!
//! This crate provides the core functionality for talking to a module's
//! firmware download machinery, including:
//!
//! - Vendor upgrade image parsing and validation
//! - The legacy vendor bootloader protocol (opcode/echo over raw I2C)
//! - The CMIS Command Data Block (CDB) firmware download protocol
//! - CRC-32/IEEE checksum calculation
//!
//! ## Supported Protocols
//!
//! - Legacy bootloader (DSP firmware family)
//! - CMIS CDB (EPL and LPL-only transfer paths)
//!
//! ## Features
//!
//! - `hal` (default): [`transport::HalI2cTransport`] adapter for any
//!   [`embedded_hal::i2c::I2c`] bus
//!
//! ## Example
//!
//! ```rust,no_run
//! use xcvrflash::{FirmwareFamily, FirmwareImage, LegacyBootloaderEngine, UpgradeEngine};
//!
//! fn upgrade(bus: impl xcvrflash::Transport) -> xcvrflash::Result<()> {
//!     // Parse and validate the upgrade image
//!     let image = FirmwareImage::from_file("firmware.bin")?;
//!
//!     // Run the whole upgrade: verify, unlock, transfer, jump
//!     let mut engine = LegacyBootloaderEngine::new(bus, image, FirmwareFamily::Dsp);
//!     engine.run(&mut |current, total| {
//!         println!("{current}/{total} bytes");
//!     })
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod engine;
pub mod error;
pub mod image;
pub mod protocol;
pub mod retry;
pub mod transport;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupt_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

// Re-exports for convenience
#[cfg(feature = "hal")]
pub use transport::HalI2cTransport;
pub use {
    engine::{
        FinalizeMode, Progress, UpgradeEngine,
        cdb::{CdbEngine, CdbOptions},
        legacy::{FirmwareFamily, LegacyBootloaderEngine},
    },
    error::{CompatibilityError, Error, Result, UpgradeStep},
    image::{FirmwareImage, VendorHeader},
    protocol::crc::crc32_ieee,
    retry::{Clock, RetryPolicy, SystemClock},
    transport::Transport,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_checker_default_false() {
        test_set_interrupted(false);
        assert!(!is_interrupt_requested());
    }

    #[test]
    fn test_interrupt_checker_toggle_true_false() {
        test_set_interrupted(true);
        assert!(is_interrupt_requested());

        test_set_interrupted(false);
        assert!(!is_interrupt_requested());
    }
}
